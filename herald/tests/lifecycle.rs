use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use herald::{
    runnable, DispatchError, Dispatcher, Looper, LooperConfig, LooperError, LooperRegistry,
    LooperState, LooperThread, Message, PoolError, QueueError,
};

#[test]
fn second_prepare_on_a_thread_fails() {
    thread::spawn(|| {
        let looper = Looper::prepare().unwrap();
        assert_eq!(Looper::my_looper(), Some(looper.clone()));
        assert!(Looper::my_queue().is_some_and(|q| Arc::ptr_eq(&q, looper.queue())));

        let err = Looper::prepare().unwrap_err();
        let current = thread::current().id();
        assert!(matches!(err, LooperError::AlreadyPrepared { thread: owner } if owner == current));
    })
    .join()
    .unwrap();
}

#[test]
fn dispatcher_requires_a_prepared_thread() {
    thread::spawn(|| {
        assert!(Looper::my_looper().is_none());
        assert!(matches!(Dispatcher::new(), Err(LooperError::NotPrepared)));
        assert!(matches!(Looper::run_current(), Err(LooperError::NotPrepared)));

        Looper::prepare().unwrap();
        let dispatcher = Dispatcher::with_callback(|_: &herald::Message| true).unwrap();
        assert_eq!(dispatcher.looper().thread_id(), thread::current().id());
    })
    .join()
    .unwrap();
}

#[test]
fn looper_runs_on_the_preparing_thread_until_quit() {
    let (tx, rx) = flume::bounded(1);
    let handle = thread::spawn(move || -> Result<(), LooperError> {
        let looper = Looper::prepare()?;
        let _ = tx.send(looper.clone());
        Looper::run_current()?;
        assert_eq!(looper.state(), LooperState::Stopped);
        Ok(())
    });

    let looper: Looper = rx.recv().unwrap();
    assert!(matches!(looper.run(), Err(LooperError::WrongThread { .. })));

    let dispatcher = Dispatcher::for_looper(&looper);
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    assert_eq!(
        dispatcher.run_blocking(move || flag.store(true, Ordering::SeqCst)),
        Ok(())
    );
    assert_eq!(looper.state(), LooperState::Running);
    assert!(matches!(
        dispatcher.run_blocking(Looper::run_current),
        Ok(Err(LooperError::AlreadyRunning))
    ));

    looper.quit().unwrap();
    handle.join().unwrap().unwrap();
    assert!(ran.load(Ordering::SeqCst));
    assert!(matches!(looper.quit(), Err(LooperError::Quitting)));
}

#[test]
fn main_looper_is_global_and_cannot_quit() {
    let registry = LooperRegistry::new();
    let r = registry.clone();
    thread::spawn(move || {
        let main = Looper::builder().registry(&r).main().prepare().unwrap();
        assert!(!main.config().quit_allowed);
        assert!(matches!(main.quit(), Err(LooperError::QuitNotAllowed)));
        assert!(!main.queue().is_quitting());
        // A bare message is a quit request, so the queue refuses it too.
        assert_eq!(
            main.queue().enqueue(Box::new(Message::new()), 0),
            Err(QueueError::QuitNotAllowed)
        );
        assert!(!main.queue().is_quitting());
        assert!(main.queue().is_empty());

        let other = thread::spawn({
            let r = r.clone();
            move || Looper::builder().registry(&r).main().prepare().map(|_| ())
        })
        .join()
        .unwrap();
        assert!(matches!(other, Err(LooperError::MainAlreadyPrepared)));
        assert_eq!(r.main(), Some(main));
    })
    .join()
    .unwrap();
    assert!(registry.main().is_none());
}

#[test]
fn looper_thread_lifecycle() -> anyhow::Result<()> {
    let registry = LooperRegistry::new();
    let config = LooperConfig {
        thread_name_prefix: "worker".to_string(),
        slow_dispatch_threshold: Some(Duration::from_millis(5)),
        ..Default::default()
    };
    let worker = LooperThread::spawn_with("lifecycle", config, &registry)?;
    assert_eq!(worker.name(), "worker-lifecycle");
    assert_eq!(registry.len(), 1);

    let dispatcher = worker.dispatcher();
    // Slow dispatches are only reported.
    dispatcher.run_blocking(|| thread::sleep(Duration::from_millis(20)))?;
    assert!(dispatcher.post(runnable(|| {})));

    let looper = worker.looper().clone();
    worker.quit_and_join()?;
    assert_eq!(looper.state(), LooperState::Stopped);
    assert!(looper.stats().dispatched >= 1);
    assert!(registry.is_empty());
    assert!(!dispatcher.post(runnable(|| {})));
    Ok(())
}

#[test]
fn dropping_a_looper_thread_quits_it() -> anyhow::Result<()> {
    let worker = LooperThread::spawn("dropped")?;
    let looper = worker.looper().clone();
    drop(worker);
    while looper.state() != LooperState::Stopped {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(looper.queue().is_quitting());
    Ok(())
}

#[test]
fn sends_fail_once_the_preparing_thread_has_exited() {
    let registry = LooperRegistry::new();
    let r = registry.clone();
    let dispatcher = thread::spawn(move || {
        Looper::builder().registry(&r).prepare().map(|looper| Dispatcher::for_looper(&looper))
    })
    .join()
    .unwrap()
    .unwrap();

    assert!(registry.is_empty());
    assert_eq!(dispatcher.looper().state(), LooperState::Stopped);
    assert!(!dispatcher.send_empty_message(1));
    assert!(!dispatcher.has_pending());
    assert_eq!(dispatcher.call(|| ()).unwrap_err(), DispatchError::QueueUnavailable);
}

#[test]
fn errors_render_readable_messages() {
    assert_eq!(
        LooperError::NotPrepared.to_string(),
        "No looper prepared on this thread; call Looper::prepare() first"
    );
    assert_eq!(LooperError::QuitNotAllowed.to_string(), "Main looper is not allowed to quit");
    assert_eq!(
        QueueError::MessageInUse { what: 3 }.to_string(),
        "Message (what=3) is already in flight and cannot be enqueued again"
    );
    assert_eq!(
        PoolError::Exhausted { max_size: 10 }.to_string(),
        "Message pool exhausted (max size: 10)"
    );
    assert_eq!(
        DispatchError::from(PoolError::Exhausted { max_size: 1 }).to_string(),
        "Could not obtain a message: Message pool exhausted (max size: 1)"
    );
    assert_eq!(
        LooperError::ThreadPanicked("boom".into()).to_string(),
        "Looper thread panicked: boom"
    );
}
