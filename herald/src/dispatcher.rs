//! # Dispatcher Module
//!
//! A [`Dispatcher`] is an endpoint bound to exactly one [`Looper`]. Any thread
//! holding a clone can schedule messages and deferred actions on it; they are
//! delivered back to the dispatcher on the looper's thread, in due-time order.
//!
//! ## Dispatch contract
//! For every message the looper hands to a dispatcher exactly one path runs:
//! 1. the message's deferred action, if it carries one
//! 2. otherwise the installed [`Callback`], if it claims the message
//! 3. otherwise the dispatcher's [`MessageHandler`]
//!
//! ## Failure policy
//! Scheduling calls return `false` when the looper is quitting (or when the
//! pool refuses to hand out a message). That is an expected outcome, logged at
//! `warn` level, never a panic. Building a dispatcher on a thread without a
//! prepared looper is a configuration error reported as
//! [`LooperError::NotPrepared`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

use crate::clock;
use crate::error::{DispatchError, LooperError, PoolError, QueueError};
use crate::looper::{Looper, LooperRegistry};
use crate::message::{runnable, Message, MessageTarget, Payload, Runnable};
use crate::queue::{MessageFilter, MessageQueue};

/// Identity of a dispatcher, used to scope removal and queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatcherId(Uuid);

impl DispatcherId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DispatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dispatcher-{}", self.0)
    }
}

/// Receives messages that carry no deferred action and were not claimed by
/// the [`Callback`].
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, msg: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn handle_message(&self, msg: &Message) {
        self(msg)
    }
}

/// Fallback installed at construction. Returning `true` means the message was
/// fully handled and the [`MessageHandler`] is skipped.
pub trait Callback: Send + Sync {
    fn handle_message(&self, msg: &Message) -> bool;
}

impl<F> Callback for F
where
    F: Fn(&Message) -> bool + Send + Sync,
{
    fn handle_message(&self, msg: &Message) -> bool {
        self(msg)
    }
}

pub(crate) struct DispatcherInner {
    id: DispatcherId,
    looper: Looper,
    queue: Arc<MessageQueue>,
    handler: Option<Arc<dyn MessageHandler>>,
    callback: Option<Arc<dyn Callback>>,
}

/// Builder for [`Dispatcher`].
///
/// Without an explicit looper, the builder binds to the looper prepared on
/// the calling thread in the chosen registry (the global one by default).
#[derive(Default)]
pub struct DispatcherBuilder {
    looper: Option<Looper>,
    registry: Option<LooperRegistry>,
    handler: Option<Arc<dyn MessageHandler>>,
    callback: Option<Arc<dyn Callback>>,
}

impl DispatcherBuilder {
    /// Bind to `looper` instead of the calling thread's looper.
    pub fn looper(mut self, looper: &Looper) -> Self {
        self.looper = Some(looper.clone());
        self
    }

    /// Look the calling thread's looper up in `registry`.
    pub fn registry(mut self, registry: &LooperRegistry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    pub fn handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<Dispatcher, LooperError> {
        let looper = match self.looper {
            Some(looper) => looper,
            None => self
                .registry
                .unwrap_or_else(LooperRegistry::global)
                .current()
                .ok_or(LooperError::NotPrepared)?,
        };

        Ok(Dispatcher {
            inner: Arc::new(DispatcherInner {
                id: DispatcherId::new(),
                queue: Arc::clone(looper.queue()),
                looper,
                handler: self.handler,
                callback: self.callback,
            }),
        })
    }
}

/// Cross-thread handle for scheduling work on one looper.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Bind to the calling thread's looper, with no handler or callback.
    pub fn new() -> Result<Self, LooperError> {
        Self::builder().build()
    }

    /// Bind to the calling thread's looper with a fallback callback.
    pub fn with_callback(callback: impl Callback + 'static) -> Result<Self, LooperError> {
        Self::builder().callback(callback).build()
    }

    /// Bind to the calling thread's looper with a message handler.
    pub fn with_handler(handler: impl MessageHandler + 'static) -> Result<Self, LooperError> {
        Self::builder().handler(handler).build()
    }

    /// Bind explicitly to `looper`, with no handler or callback.
    pub fn for_looper(looper: &Looper) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                id: DispatcherId::new(),
                looper: looper.clone(),
                queue: Arc::clone(looper.queue()),
                handler: None,
                callback: None,
            }),
        }
    }

    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    pub(crate) fn from_inner(inner: Arc<DispatcherInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> DispatcherId {
        self.inner.id
    }

    pub fn looper(&self) -> &Looper {
        &self.inner.looper
    }

    fn target(&self) -> MessageTarget {
        MessageTarget {
            id: self.inner.id,
            dispatcher: Arc::downgrade(&self.inner),
        }
    }

    // --- Obtaining messages ---

    /// A message from the looper's pool with tag `what`, addressed to this
    /// dispatcher.
    pub fn obtain_message(&self, what: i32) -> Result<Box<Message>, PoolError> {
        let mut msg = self.inner.queue.pool().acquire()?;
        msg.target = Some(self.target());
        msg.what = what;
        Ok(msg)
    }

    /// A pooled message with the given fields, addressed to this dispatcher.
    pub fn obtain_message_with(
        &self,
        what: i32,
        arg1: i32,
        arg2: i32,
        obj: Option<Payload>,
    ) -> Result<Box<Message>, PoolError> {
        let mut msg = self.obtain_message(what)?;
        msg.arg1 = arg1;
        msg.arg2 = arg2;
        msg.obj = obj;
        Ok(msg)
    }

    fn post_message(&self, action: Runnable, token: Option<Payload>) -> Option<Box<Message>> {
        match self.inner.queue.pool().acquire() {
            Ok(mut msg) => {
                msg.callback = Some(action);
                msg.obj = token;
                Some(msg)
            }
            Err(err) => {
                warn!(dispatcher = %self.inner.id, error = %err, "Could not obtain a message for post");
                None
            }
        }
    }

    // --- Posting deferred actions ---

    /// Run `action` on the looper thread as soon as possible.
    pub fn post(&self, action: Runnable) -> bool {
        self.post_delayed(action, Duration::ZERO)
    }

    /// Run `action` on the looper thread after `delay`.
    pub fn post_delayed(&self, action: Runnable, delay: Duration) -> bool {
        self.post_at_time(action, clock::deadline_after(delay))
    }

    /// Run `action` at `uptime_millis` on the [`clock`](crate::clock).
    pub fn post_at_time(&self, action: Runnable, uptime_millis: u64) -> bool {
        match self.post_message(action, None) {
            Some(msg) => self.send_message_at_time(msg, uptime_millis),
            None => false,
        }
    }

    /// Like [`post_at_time`](Self::post_at_time), tagging the message with
    /// `token` so it can be removed with
    /// [`remove_callbacks_and_messages`](Self::remove_callbacks_and_messages).
    pub fn post_at_time_with_token(&self, action: Runnable, token: Payload, uptime_millis: u64) -> bool {
        match self.post_message(action, Some(token)) {
            Some(msg) => self.send_message_at_time(msg, uptime_millis),
            None => false,
        }
    }

    /// Queue `action` with due time 0. It competes on time with other
    /// immediate messages rather than jumping ahead unconditionally.
    pub fn post_at_front_of_queue(&self, action: Runnable) -> bool {
        match self.post_message(action, None) {
            Some(msg) => self.send_message_at_front_of_queue(msg),
            None => false,
        }
    }

    // --- Sending messages ---

    pub fn send_message(&self, msg: impl Into<Box<Message>>) -> bool {
        self.send_message_delayed(msg, Duration::ZERO)
    }

    pub fn send_message_delayed(&self, msg: impl Into<Box<Message>>, delay: Duration) -> bool {
        self.send_message_at_time(msg, clock::deadline_after(delay))
    }

    /// Address `msg` to this dispatcher and queue it for `uptime_millis`.
    ///
    /// Returns false if the looper is quitting.
    ///
    /// # Panics
    /// If `msg` is already in flight on a queue.
    pub fn send_message_at_time(&self, msg: impl Into<Box<Message>>, uptime_millis: u64) -> bool {
        let mut msg = msg.into();
        msg.target = Some(self.target());
        match self.inner.queue.enqueue(msg, uptime_millis) {
            Ok(()) => true,
            Err(QueueError::Quitting | QueueError::QuitNotAllowed) => false,
            Err(err @ QueueError::MessageInUse { .. }) => panic!("{err}"),
        }
    }

    /// Queue `msg` with due time 0.
    pub fn send_message_at_front_of_queue(&self, msg: impl Into<Box<Message>>) -> bool {
        self.send_message_at_time(msg, 0)
    }

    pub fn send_empty_message(&self, what: i32) -> bool {
        self.send_empty_message_delayed(what, Duration::ZERO)
    }

    pub fn send_empty_message_delayed(&self, what: i32, delay: Duration) -> bool {
        self.send_empty_message_at_time(what, clock::deadline_after(delay))
    }

    pub fn send_empty_message_at_time(&self, what: i32, uptime_millis: u64) -> bool {
        match self.obtain_message(what) {
            Ok(msg) => self.send_message_at_time(msg, uptime_millis),
            Err(err) => {
                warn!(dispatcher = %self.inner.id, what, error = %err, "Could not obtain a message");
                false
            }
        }
    }

    // --- Calls with a result ---

    /// Run `f` on the looper thread and receive its result.
    ///
    /// The receiver resolves with an error if the message is removed or
    /// discarded before it runs.
    pub fn call<T, F>(&self, f: F) -> Result<oneshot::Receiver<T>, DispatchError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some((f, tx)));
        let action = runnable(move || {
            let taken = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some((f, tx)) = taken {
                let _ = tx.send(f());
            }
        });

        let mut msg = self.inner.queue.pool().acquire()?;
        msg.callback = Some(action);
        if self.send_message(msg) {
            Ok(rx)
        } else {
            Err(DispatchError::QueueUnavailable)
        }
    }

    /// Run `f` on the looper thread and wait for its result. Runs inline when
    /// called from the looper thread itself.
    ///
    /// Must not be called from inside an async runtime.
    pub fn run_blocking<T, F>(&self, f: F) -> Result<T, DispatchError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.inner.looper.is_current_thread() {
            return Ok(f());
        }
        self.call(f)?
            .blocking_recv()
            .map_err(|_| DispatchError::Cancelled)
    }

    // --- Removal and queries ---

    /// Remove pending messages with tag `what`.
    pub fn remove_messages(&self, what: i32) {
        self.inner.queue.remove_messages(self.inner.id, what, None);
    }

    /// Remove pending messages with tag `what` whose payload is `token`.
    pub fn remove_messages_with(&self, what: i32, token: &Payload) {
        self.inner.queue.remove_messages(self.inner.id, what, Some(token));
    }

    /// Remove pending posts of `action`.
    pub fn remove_callbacks(&self, action: &Runnable) {
        self.inner
            .queue
            .remove_callbacks_and_messages(self.inner.id, None, Some(action));
    }

    /// Remove pending posts of `action` tagged with `token`.
    pub fn remove_callbacks_with_token(&self, action: &Runnable, token: &Payload) {
        self.inner
            .queue
            .remove_callbacks_and_messages(self.inner.id, Some(token), Some(action));
    }

    /// Remove pending messages and posts whose payload is `token`, or every
    /// pending item of this dispatcher when `token` is `None`.
    pub fn remove_callbacks_and_messages(&self, token: Option<&Payload>) {
        self.inner
            .queue
            .remove_callbacks_and_messages(self.inner.id, token, None);
    }

    pub fn has_messages(&self, what: i32) -> bool {
        self.inner.queue.has_messages(self.inner.id, what, None)
    }

    pub fn has_messages_with(&self, what: i32, token: &Payload) -> bool {
        self.inner.queue.has_messages(self.inner.id, what, Some(token))
    }

    pub fn has_callbacks(&self, action: &Runnable) -> bool {
        self.inner.queue.has_callbacks(self.inner.id, action)
    }

    /// Whether anything at all is pending for this dispatcher.
    pub fn has_pending(&self) -> bool {
        self.inner
            .queue
            .has_matching(&MessageFilter::target(self.inner.id))
    }

    // --- Dispatch ---

    /// Deliver `msg` following the dispatch contract. Called by the looper on
    /// its own thread.
    pub fn dispatch_message(&self, msg: &Message) {
        if let Some(action) = msg.callback() {
            action();
            return;
        }
        if let Some(callback) = &self.inner.callback {
            if callback.handle_message(msg) {
                return;
            }
        }
        if let Some(handler) = &self.inner.handler {
            handler.handle_message(msg);
        }
    }
}

impl PartialEq for Dispatcher {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Dispatcher {}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.inner.id)
            .field("looper", &self.inner.looper.id())
            .field("has_handler", &self.inner.handler.is_some())
            .field("has_callback", &self.inner.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn build_without_looper_is_not_prepared() {
        let registry = LooperRegistry::new();
        thread::spawn(move || {
            let err = Dispatcher::builder().registry(&registry).build().unwrap_err();
            assert!(matches!(err, LooperError::NotPrepared));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn obtained_message_is_addressed_to_dispatcher() {
        let registry = LooperRegistry::new();
        thread::spawn(move || {
            Looper::builder().registry(&registry).prepare().unwrap();
            let dispatcher = Dispatcher::builder().registry(&registry).build().unwrap();
            let msg = dispatcher
                .obtain_message_with(4, 1, 2, Some(crate::message::payload("x")))
                .unwrap();
            assert_eq!(msg.target_id(), Some(dispatcher.id()));
            assert_eq!((msg.what, msg.arg1, msg.arg2), (4, 1, 2));
            assert!(!msg.is_in_flight());
        })
        .join()
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "already in flight")]
    fn resending_an_in_flight_message_panics() {
        let looper = Looper::builder()
            .registry(&LooperRegistry::new())
            .prepare()
            .unwrap();
        let dispatcher = Dispatcher::for_looper(&looper);
        let mut msg = dispatcher.obtain_message(1).unwrap();
        msg.in_flight = true;
        dispatcher.send_message(msg);
    }

    #[test]
    fn dispatch_prefers_action_then_callback_then_handler() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let looper = Looper::builder()
            .registry(&LooperRegistry::new())
            .prepare()
            .unwrap();
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handled);
        let dispatcher = Dispatcher::builder()
            .looper(&looper)
            .callback(|msg: &Message| msg.what == 1)
            .handler(move |_: &Message| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        let mut with_action = Message::with_what(2);
        with_action.callback = Some(runnable(|| {}));
        dispatcher.dispatch_message(&with_action);
        dispatcher.dispatch_message(&Message::with_what(1));
        assert_eq!(handled.load(Ordering::SeqCst), 0);

        dispatcher.dispatch_message(&Message::with_what(2));
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }
}
