//! # Looper Module
//!
//! A [`Looper`] turns the thread that prepared it into a consumer of one
//! [`MessageQueue`]. [`Looper::run`] blocks that thread, takes messages off the
//! queue in due-time order and hands each one to the dispatcher it was sent
//! to, until the quit sentinel comes up.
//!
//! ## Lifecycle
//! ```text
//! prepare() -> Prepared --run()--> Running --quit sentinel--> Stopped
//! ```
//! A thread has at most one looper per registry. `run` may only be called
//! from the owning thread, and only once.
//!
//! ## Main looper
//! [`Looper::prepare_main_looper`] additionally records the looper as the
//! registry's main looper. The main looper refuses to quit.

pub mod registry;
pub mod thread;

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;
use std::time::Instant;

use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::clock;
use crate::config::LooperConfig;
use crate::error::{LooperError, QueueError};
use crate::message::{Message, MessagePool, MessageTarget};
use crate::queue::MessageQueue;

pub use registry::LooperRegistry;
pub use thread::LooperThread;

/// Where a looper is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LooperState {
    /// Bound to its thread, not yet running.
    Prepared,
    /// Inside [`Looper::run`].
    Running,
    /// `run` has returned. The queue refuses new messages.
    Stopped,
}

/// Snapshot of looper counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LooperStats {
    /// Messages delivered (to a dispatcher or as an orphaned deferred action).
    pub dispatched: usize,
    /// Messages dropped because their dispatcher no longer existed.
    pub stale_targets: usize,
}

/// Builder for [`Looper`].
#[derive(Default)]
pub struct LooperBuilder {
    registry: Option<LooperRegistry>,
    config: Option<LooperConfig>,
    pool: Option<Arc<MessagePool>>,
    main: bool,
}

impl LooperBuilder {
    /// Register in `registry` instead of the global one.
    pub fn registry(mut self, registry: &LooperRegistry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    pub fn config(mut self, config: LooperConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Recycle into a shared pool instead of one built from the config.
    pub fn pool(mut self, pool: Arc<MessagePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Prepare as the registry's main looper. Forces `quit_allowed = false`.
    pub fn main(mut self) -> Self {
        self.main = true;
        self
    }

    /// Bind a new looper to the calling thread.
    pub fn prepare(self) -> Result<Looper, LooperError> {
        let registry = self.registry.unwrap_or_else(LooperRegistry::global);
        let mut config = match (self.config, self.main) {
            (Some(config), _) => config,
            (None, true) => LooperConfig::main(),
            (None, false) => LooperConfig::default(),
        };
        if self.main {
            config.quit_allowed = false;
        }

        let current = std::thread::current();
        if registry.get(current.id()).is_some() {
            return Err(LooperError::AlreadyPrepared {
                thread: current.id(),
            });
        }

        let pool = self
            .pool
            .unwrap_or_else(|| Arc::new(MessagePool::new(config.pool.clone())));
        let looper = Looper {
            inner: Arc::new(LooperInner {
                id: Uuid::new_v4(),
                thread: current.id(),
                thread_name: current.name().map(str::to_string),
                queue: Arc::new(MessageQueue::new(pool, config.quit_allowed)),
                config,
                state: Mutex::new(LooperState::Prepared),
                dispatched: AtomicUsize::new(0),
                stale_targets: AtomicUsize::new(0),
            }),
        };
        registry.register(&looper, self.main)?;

        debug!(
            looper = %looper.inner.id,
            thread = ?looper.inner.thread,
            main = self.main,
            "Looper prepared"
        );
        Ok(looper)
    }
}

struct LooperInner {
    id: Uuid,
    thread: ThreadId,
    thread_name: Option<String>,
    queue: Arc<MessageQueue>,
    config: LooperConfig,
    state: Mutex<LooperState>,
    dispatched: AtomicUsize,
    stale_targets: AtomicUsize,
}

/// Handle to a thread's message loop. Cheap to clone.
#[derive(Clone)]
pub struct Looper {
    inner: Arc<LooperInner>,
}

impl Looper {
    /// Bind a looper with default configuration to the calling thread.
    pub fn prepare() -> Result<Looper, LooperError> {
        Self::builder().prepare()
    }

    /// Bind the process main looper to the calling thread.
    pub fn prepare_main_looper() -> Result<Looper, LooperError> {
        Self::builder().main().prepare()
    }

    pub fn builder() -> LooperBuilder {
        LooperBuilder::default()
    }

    /// Looper prepared on the calling thread, if any.
    pub fn my_looper() -> Option<Looper> {
        LooperRegistry::global().current()
    }

    /// Queue of the calling thread's looper, if any.
    pub fn my_queue() -> Option<Arc<MessageQueue>> {
        Self::my_looper().map(|looper| Arc::clone(looper.queue()))
    }

    pub fn main_looper() -> Option<Looper> {
        LooperRegistry::global().main()
    }

    /// Run the calling thread's looper until it quits.
    pub fn run_current() -> Result<(), LooperError> {
        Self::my_looper().ok_or(LooperError::NotPrepared)?.run()
    }

    fn lock_state(&self) -> MutexGuard<'_, LooperState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Process messages until the quit sentinel is taken off the queue.
    ///
    /// Messages still pending behind the sentinel are discarded. If a
    /// dispatch panics the loop is torn down the same way before the panic
    /// continues to unwind.
    pub fn run(&self) -> Result<(), LooperError> {
        let caller = std::thread::current().id();
        if caller != self.inner.thread {
            return Err(LooperError::WrongThread {
                owner: self.inner.thread,
                caller,
            });
        }
        {
            let mut state = self.lock_state();
            match *state {
                LooperState::Prepared => *state = LooperState::Running,
                LooperState::Running => return Err(LooperError::AlreadyRunning),
                LooperState::Stopped => return Err(LooperError::Stopped),
            }
        }

        let _teardown = Teardown(self);
        debug!(looper = %self.inner.id, "Looper started");

        let queue = &self.inner.queue;
        loop {
            let msg = queue.next();
            if msg.is_quit_sentinel() {
                queue.pool().release(msg);
                return Ok(());
            }
            self.dispatch(msg);
        }
    }

    fn dispatch(&self, msg: Box<Message>) {
        let started = Instant::now();

        match msg.target.as_ref().and_then(MessageTarget::upgrade) {
            Some(dispatcher) => {
                trace!(
                    dispatcher = %dispatcher.id(),
                    what = msg.what,
                    has_callback = msg.callback.is_some(),
                    ">>>>> Dispatching"
                );
                dispatcher.dispatch_message(&msg);
                trace!(dispatcher = %dispatcher.id(), what = msg.what, "<<<<< Finished");
                self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            None => match msg.callback() {
                // The sender is gone but the action itself is still valid.
                Some(action) => {
                    trace!(what = msg.what, "Running deferred action of a dropped dispatcher");
                    action();
                    self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    debug!(
                        what = msg.what,
                        target = ?msg.target_id(),
                        "Dropping message for a dispatcher that no longer exists"
                    );
                    self.inner.stale_targets.fetch_add(1, Ordering::Relaxed);
                }
            },
        }

        if let Some(threshold) = self.inner.config.slow_dispatch_threshold {
            let elapsed = started.elapsed();
            if elapsed > threshold {
                warn!(
                    looper = %self.inner.id,
                    what = msg.what,
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "Slow dispatch"
                );
            }
        }

        self.inner.queue.pool().release(msg);
    }

    /// Ask the loop to stop once it reaches the quit sentinel.
    ///
    /// The sentinel is queued at the front, so messages already pending are
    /// discarded rather than dispatched.
    pub fn quit(&self) -> Result<(), LooperError> {
        if !self.inner.config.quit_allowed {
            return Err(LooperError::QuitNotAllowed);
        }
        if self.inner.queue.is_quitting() {
            return Err(LooperError::Quitting);
        }

        let sentinel = self
            .inner
            .queue
            .pool()
            .acquire()
            .unwrap_or_else(|_| Box::new(Message::new()));
        // A freshly acquired message is never in flight.
        self.inner
            .queue
            .enqueue(sentinel, 0)
            .map_err(|err| match err {
                QueueError::QuitNotAllowed => LooperError::QuitNotAllowed,
                _ => LooperError::Quitting,
            })?;

        debug!(looper = %self.inner.id, "Looper quit requested");
        Ok(())
    }

    /// Refuse further messages, discard pending ones and mark the looper
    /// stopped. Returns how many messages were discarded.
    pub(crate) fn shut_down(&self) -> usize {
        let discarded = self.inner.queue.dispose();
        *self.lock_state() = LooperState::Stopped;
        discarded
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.inner.queue
    }

    pub fn pool(&self) -> &Arc<MessagePool> {
        self.inner.queue.pool()
    }

    pub fn config(&self) -> &LooperConfig {
        &self.inner.config
    }

    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread
    }

    pub fn thread_name(&self) -> Option<&str> {
        self.inner.thread_name.as_deref()
    }

    pub fn is_current_thread(&self) -> bool {
        std::thread::current().id() == self.inner.thread
    }

    pub fn state(&self) -> LooperState {
        *self.lock_state()
    }

    pub fn stats(&self) -> LooperStats {
        LooperStats {
            dispatched: self.inner.dispatched.load(Ordering::Relaxed),
            stale_targets: self.inner.stale_targets.load(Ordering::Relaxed),
        }
    }

    /// Human-readable listing of the pending messages, due times relative
    /// to now.
    pub fn dump(&self) -> String {
        let now = clock::uptime_millis();
        let pending = self.inner.queue.snapshot();

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Looper ({}, thread {:?}) state={:?}",
            self.thread_name().unwrap_or("<unnamed>"),
            self.inner.thread,
            self.state()
        );
        for (i, msg) in pending.iter().enumerate() {
            let when = if msg.when == 0 {
                "front".to_string()
            } else {
                format!("{:+}ms", msg.when as i128 - now as i128)
            };
            let target = match msg.target {
                Some(id) => id.to_string(),
                None => "<quit>".to_string(),
            };
            let _ = writeln!(
                out,
                "  Message {i}: when={when} what={} arg1={} arg2={} target={target} callback={}",
                msg.what, msg.arg1, msg.arg2, msg.has_callback
            );
        }
        let _ = write!(out, "(Total messages: {})", pending.len());
        out
    }
}

impl PartialEq for Looper {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Looper {}

impl fmt::Debug for Looper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Looper")
            .field("id", &self.inner.id)
            .field("thread", &self.inner.thread)
            .field("state", &self.state())
            .field("queue", &self.inner.queue)
            .finish()
    }
}

/// Marks the looper stopped and empties its queue when `run` returns or
/// unwinds.
struct Teardown<'a>(&'a Looper);

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        let inner = &self.0.inner;
        let discarded = self.0.shut_down();
        debug!(
            looper = %inner.id,
            discarded,
            panicking = std::thread::panicking(),
            "Looper stopped"
        );
    }
}
