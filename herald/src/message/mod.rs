//! # Message Module
//!
//! A [`Message`] is the unit of work carried by a [`MessageQueue`](crate::queue::MessageQueue):
//! an integer tag, two integer arguments, an optional shared payload and an
//! optional deferred action, addressed to one [`Dispatcher`].
//!
//! ## Lifecycle
//! 1. Obtained from a [`MessagePool`] (or allocated fresh)
//! 2. Populated and handed to a dispatcher, which stamps the target and due time
//! 3. Owned by the queue while pending (`in_flight`)
//! 4. Returned to the looper, dispatched, cleared and released back to the pool
//!
//! Messages are linked intrusively through `next`, both on the queue's pending
//! list and on the pool's free list, so moving a message between the two never
//! allocates.

pub mod pool;

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::clock;
use crate::dispatcher::{Dispatcher, DispatcherId, DispatcherInner};

pub use pool::{MessagePool, PoolStats};

/// Opaque shared payload. Identity (not equality) is used when matching tokens.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Deferred action run on the looper thread. Identity is used for removal.
pub type Runnable = Arc<dyn Fn() + Send + Sync>;

/// Wrap a closure as a [`Runnable`].
pub fn runnable<F>(f: F) -> Runnable
where
    F: Fn() + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a value as a [`Payload`].
pub fn payload<T>(value: T) -> Payload
where
    T: Any + Send + Sync,
{
    Arc::new(value)
}

pub(crate) fn same_payload(a: &Payload, b: &Payload) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub(crate) fn same_runnable(a: &Runnable, b: &Runnable) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Weak address of the dispatcher a message is sent to.
#[derive(Clone)]
pub(crate) struct MessageTarget {
    pub(crate) id: DispatcherId,
    pub(crate) dispatcher: Weak<DispatcherInner>,
}

impl MessageTarget {
    pub(crate) fn upgrade(&self) -> Option<Dispatcher> {
        self.dispatcher.upgrade().map(Dispatcher::from_inner)
    }
}

/// A unit of work delivered to a dispatcher on its looper thread.
#[derive(Default)]
pub struct Message {
    /// User-defined tag identifying what this message is about.
    pub what: i32,
    /// First integer argument.
    pub arg1: i32,
    /// Second integer argument.
    pub arg2: i32,
    /// Optional payload, also used as the token for removal.
    pub obj: Option<Payload>,

    pub(crate) when: u64,
    pub(crate) in_flight: bool,
    pub(crate) target: Option<MessageTarget>,
    pub(crate) callback: Option<Runnable>,
    pub(crate) next: Option<Box<Message>>,
}

impl Message {
    /// A blank message outside of any pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// A blank message with the given tag.
    pub fn with_what(what: i32) -> Self {
        let mut msg = Self::default();
        msg.what = what;
        msg
    }

    /// Copy the user-visible fields, target and action of `orig`.
    ///
    /// Queue state (due time, in-flight flag, link) is never copied.
    pub fn copy_from(orig: &Message) -> Self {
        let mut msg = Self::default();
        msg.what = orig.what;
        msg.arg1 = orig.arg1;
        msg.arg2 = orig.arg2;
        msg.obj = orig.obj.clone();
        msg.target = orig.target.clone();
        msg.callback = orig.callback.clone();
        msg
    }

    /// Due time on the uptime clock; `0` until the message is enqueued
    /// (or when it was queued at the front).
    pub fn when(&self) -> u64 {
        self.when
    }

    /// Id of the dispatcher this message is addressed to.
    pub fn target_id(&self) -> Option<DispatcherId> {
        self.target.as_ref().map(|t| t.id)
    }

    /// Deferred action carried by this message, if any.
    pub fn callback(&self) -> Option<&Runnable> {
        self.callback.as_ref()
    }

    /// Whether the message currently sits on a queue or is being dispatched.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Borrow the payload as `T` if it is one.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.obj.as_deref().and_then(|obj| obj.downcast_ref::<T>())
    }

    /// A message without a target is the looper's quit sentinel.
    pub(crate) fn is_quit_sentinel(&self) -> bool {
        self.target.is_none()
    }

    /// Send this message to the dispatcher it was obtained from.
    ///
    /// Returns false if it has no target, the target was dropped, or the
    /// target's queue is quitting.
    pub fn send_to_target(self: Box<Self>) -> bool {
        match self.target.as_ref().and_then(MessageTarget::upgrade) {
            Some(dispatcher) => dispatcher.send_message(self),
            None => false,
        }
    }

    /// Reset every field so the message can be reused.
    pub(crate) fn clear_for_recycle(&mut self) {
        self.what = 0;
        self.arg1 = 0;
        self.arg2 = 0;
        self.obj = None;
        self.when = 0;
        self.in_flight = false;
        self.target = None;
        self.callback = None;
        self.next = None;
    }
}

impl Drop for Message {
    // Unlink iteratively so a long chain cannot overflow the stack.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(mut msg) = next {
            next = msg.next.take();
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Message");
        if self.when == 0 {
            s.field("when", &"front");
        } else {
            let now = clock::uptime_millis();
            s.field("when", &format_args!("{:+}ms", self.when as i128 - now as i128));
        }
        s.field("what", &self.what)
            .field("arg1", &self.arg1)
            .field("arg2", &self.arg2)
            .field("has_obj", &self.obj.is_some())
            .field("has_callback", &self.callback.is_some())
            .field("target", &self.target.as_ref().map(|t| t.id))
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_for_recycle_resets_everything() {
        let mut msg = Message::with_what(7);
        msg.arg1 = 1;
        msg.arg2 = 2;
        msg.obj = Some(payload("hello"));
        msg.callback = Some(runnable(|| {}));
        msg.when = 42;
        msg.in_flight = true;
        msg.next = Some(Box::new(Message::new()));

        msg.clear_for_recycle();

        assert_eq!(msg.what, 0);
        assert_eq!(msg.arg1, 0);
        assert_eq!(msg.arg2, 0);
        assert!(msg.obj.is_none());
        assert!(msg.callback.is_none());
        assert_eq!(msg.when, 0);
        assert!(!msg.in_flight);
        assert!(msg.target.is_none());
        assert!(msg.next.is_none());
    }

    #[test]
    fn copy_from_skips_queue_state() {
        let mut orig = Message::with_what(3);
        orig.arg1 = 10;
        orig.obj = Some(payload(5u32));
        orig.when = 99;
        orig.in_flight = true;

        let copy = Message::copy_from(&orig);
        assert_eq!(copy.what, 3);
        assert_eq!(copy.arg1, 10);
        assert_eq!(copy.payload::<u32>(), Some(&5));
        assert_eq!(copy.when(), 0);
        assert!(!copy.is_in_flight());
    }

    #[test]
    fn payload_identity_is_by_pointer() {
        let a = payload(1u8);
        let b = payload(1u8);
        assert!(same_payload(&a, &a.clone()));
        assert!(!same_payload(&a, &b));
    }

    #[test]
    fn long_chain_drops_without_recursion() {
        let mut head: Option<Box<Message>> = None;
        for _ in 0..200_000 {
            let mut msg = Box::new(Message::new());
            msg.next = head.take();
            head = Some(msg);
        }
        drop(head);
    }

    #[test]
    fn untargeted_message_is_sentinel() {
        assert!(Message::new().is_quit_sentinel());
        assert!(!Box::new(Message::new()).send_to_target());
    }
}
