//! # Message Queue Module
//!
//! The pending-message list of one looper, kept sorted by ascending due time.
//!
//! ## Key Concepts
//! - Single monitor: one mutex guards the list, the idle handlers and the
//!   `quitting`/`blocked` flags; the condition variable waits on that mutex
//! - Stable ordering: a new message goes after every message with a due time
//!   `<=` its own, except due time `0` which always becomes the new head
//! - Shutdown: a message without a target is the quit sentinel; once it is
//!   accepted every later enqueue is refused. A queue built with
//!   `quit_allowed = false` refuses the sentinel itself
//!
//! ## Threading
//! `enqueue`, the removal calls and the queries may be called from any thread.
//! [`MessageQueue::next`] is reserved for the looper's own thread. Messages
//! removed under the queue lock are released to the pool only after the lock
//! has been dropped, so the queue and pool locks are never nested.

pub mod idle;

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{trace, warn};

use crate::clock;
use crate::dispatcher::DispatcherId;
use crate::error::QueueError;
use crate::message::{same_payload, same_runnable, Message, MessagePool, Payload, Runnable};

pub use idle::{idle_handler, IdleHandler, IdleHandlerRef};

/// Read-only view of one pending message, as returned by [`MessageQueue::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub what: i32,
    pub arg1: i32,
    pub arg2: i32,
    pub when: u64,
    pub target: Option<DispatcherId>,
    pub has_callback: bool,
}

impl PendingMessage {
    fn of(msg: &Message) -> Self {
        Self {
            what: msg.what,
            arg1: msg.arg1,
            arg2: msg.arg2,
            when: msg.when,
            target: msg.target_id(),
            has_callback: msg.callback.is_some(),
        }
    }

    /// The quit sentinel has no target.
    pub fn is_quit_sentinel(&self) -> bool {
        self.target.is_none()
    }
}

/// Criteria for removal and lookup. Every set field must match.
pub(crate) struct MessageFilter<'a> {
    pub(crate) target: DispatcherId,
    pub(crate) what: Option<i32>,
    pub(crate) callback: Option<&'a Runnable>,
    pub(crate) token: Option<&'a Payload>,
}

impl<'a> MessageFilter<'a> {
    pub(crate) fn target(target: DispatcherId) -> Self {
        Self {
            target,
            what: None,
            callback: None,
            token: None,
        }
    }

    fn matches(&self, msg: &Message) -> bool {
        if msg.target_id() != Some(self.target) {
            return false;
        }
        if let Some(what) = self.what {
            if msg.what != what {
                return false;
            }
        }
        if let Some(callback) = self.callback {
            match msg.callback.as_ref() {
                Some(cb) if same_runnable(cb, callback) => {}
                _ => return false,
            }
        }
        if let Some(token) = self.token {
            match msg.obj.as_ref() {
                Some(obj) if same_payload(obj, token) => {}
                _ => return false,
            }
        }
        true
    }
}

#[derive(Default)]
struct QueueState {
    messages: Option<Box<Message>>,
    len: usize,
    idle_handlers: Vec<IdleHandlerRef>,
    quitting: bool,
    blocked: bool,
}

impl QueueState {
    fn insert(&mut self, mut msg: Box<Message>) {
        let when = msg.when;
        let at_head = match self.messages.as_deref() {
            None => true,
            Some(head) => when == 0 || when < head.when,
        };

        // Count the run of messages due no later than `when`, then walk a
        // mutable cursor exactly that far.
        let mut steps = 0;
        if !at_head {
            let mut p = self.messages.as_deref();
            while let Some(node) = p {
                if node.when > when {
                    break;
                }
                steps += 1;
                p = node.next.as_deref();
            }
        }

        let mut slot = &mut self.messages;
        for _ in 0..steps {
            if let Some(node) = slot {
                slot = &mut node.next;
            }
        }
        msg.next = slot.take();
        *slot = Some(msg);
        self.len += 1;
    }

    /// Unlink the head if it is due at `now`.
    fn pop_due(&mut self, now: u64) -> Option<Box<Message>> {
        let due = self.messages.as_deref().is_some_and(|head| head.when <= now);
        if !due {
            return None;
        }
        let mut msg = self.messages.take()?;
        self.messages = msg.next.take();
        self.len -= 1;
        Some(msg)
    }

    /// Unlink every matching message: first the run at the head (which moves
    /// the list root), then matches behind a kept node (which only rewires that
    /// node's `next`).
    fn unlink_matching(&mut self, filter: &MessageFilter<'_>) -> Vec<Box<Message>> {
        let mut removed = Vec::new();

        while let Some(mut msg) = self.messages.take() {
            if filter.matches(&msg) {
                self.messages = msg.next.take();
                removed.push(msg);
            } else {
                self.messages = Some(msg);
                break;
            }
        }

        let mut cursor = self.messages.as_mut();
        while let Some(node) = cursor {
            while node.next.as_deref().is_some_and(|next| filter.matches(next)) {
                if let Some(mut next) = node.next.take() {
                    node.next = next.next.take();
                    removed.push(next);
                }
            }
            cursor = node.next.as_mut();
        }

        self.len -= removed.len();
        removed
    }

    fn iter(&self) -> impl Iterator<Item = &Message> {
        std::iter::successors(self.messages.as_deref(), |msg| msg.next.as_deref())
    }
}

/// Time-ordered queue of pending messages for one looper.
pub struct MessageQueue {
    state: Mutex<QueueState>,
    wake: Condvar,
    pool: Arc<MessagePool>,
    quit_allowed: bool,
}

impl MessageQueue {
    /// Create an empty queue that recycles into `pool`.
    pub fn new(pool: Arc<MessagePool>, quit_allowed: bool) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            wake: Condvar::new(),
            pool,
            quit_allowed,
        }
    }

    /// Whether the quit sentinel is accepted.
    pub fn quit_allowed(&self) -> bool {
        self.quit_allowed
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pool that messages removed from this queue are released to.
    pub fn pool(&self) -> &Arc<MessagePool> {
        &self.pool
    }

    /// Insert `msg` with due time `when` and wake the consumer.
    ///
    /// A message without a target is accepted as the quit sentinel and flips
    /// the queue into the quitting state, unless the queue does not allow
    /// quitting. Once quitting, every enqueue is refused. Refused messages are
    /// released back to the pool.
    pub fn enqueue(&self, mut msg: Box<Message>, when: u64) -> Result<(), QueueError> {
        if msg.in_flight {
            return Err(QueueError::MessageInUse { what: msg.what });
        }
        if msg.is_quit_sentinel() && !self.quit_allowed {
            self.pool.release(msg);
            return Err(QueueError::QuitNotAllowed);
        }

        let mut state = self.lock();
        if state.quitting {
            drop(state);
            warn!(what = msg.what, "Sending message to a handler on a dead thread");
            self.pool.release(msg);
            return Err(QueueError::Quitting);
        }
        if msg.is_quit_sentinel() {
            state.quitting = true;
        }

        msg.when = when;
        msg.in_flight = true;
        trace!(what = msg.what, when, "Enqueued message");
        state.insert(msg);
        drop(state);

        self.wake.notify_one();
        Ok(())
    }

    /// Block until the earliest message is due and unlink it.
    ///
    /// The first time a call finds nothing due, registered idle handlers are
    /// run once (outside the lock) and the list is re-checked without waiting.
    pub fn next(&self) -> Box<Message> {
        let mut idle_drained = false;
        let mut state = self.lock();
        loop {
            let now = clock::uptime_millis();
            if let Some(msg) = state.pop_due(now) {
                state.blocked = false;
                return msg;
            }

            let timeout = state
                .messages
                .as_deref()
                .map(|head| Duration::from_millis(head.when.saturating_sub(now)));

            if !idle_drained {
                idle_drained = true;
                if !state.idle_handlers.is_empty() {
                    let pending = state.idle_handlers.clone();
                    drop(state);

                    let retired: Vec<IdleHandlerRef> = pending
                        .into_iter()
                        .filter(|handler| !idle::run_idle_handler(handler))
                        .collect();

                    state = self.lock();
                    if !retired.is_empty() {
                        state
                            .idle_handlers
                            .retain(|h| !retired.iter().any(|r| idle::same_handler(h, r)));
                        // `retired` may hold the last reference.
                        drop(state);
                        drop(retired);
                        state = self.lock();
                    }
                    // A message may have arrived while the handlers ran.
                    continue;
                }
            }

            state.blocked = true;
            state = match timeout {
                Some(timeout) => {
                    self.wake
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.wake.wait(state).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Remove messages for `target` with tag `what` (and payload `token`, if given).
    pub fn remove_messages(&self, target: DispatcherId, what: i32, token: Option<&Payload>) {
        self.remove_matching(&MessageFilter {
            what: Some(what),
            token,
            ..MessageFilter::target(target)
        });
    }

    /// Remove messages for `target` matching the optional payload token and
    /// deferred action. With neither given, every message for `target` goes.
    pub fn remove_callbacks_and_messages(
        &self,
        target: DispatcherId,
        token: Option<&Payload>,
        action: Option<&Runnable>,
    ) {
        self.remove_matching(&MessageFilter {
            callback: action,
            token,
            ..MessageFilter::target(target)
        });
    }

    pub(crate) fn remove_matching(&self, filter: &MessageFilter<'_>) -> usize {
        let removed = self.lock().unlink_matching(filter);
        let count = removed.len();
        if count > 0 {
            trace!(count, "Removed pending messages");
        }
        self.pool.release_all(removed);
        count
    }

    /// Whether a message for `target` with tag `what` (and payload `token`) is pending.
    pub fn has_messages(&self, target: DispatcherId, what: i32, token: Option<&Payload>) -> bool {
        self.has_matching(&MessageFilter {
            what: Some(what),
            token,
            ..MessageFilter::target(target)
        })
    }

    /// Whether `action` is pending for `target`.
    pub fn has_callbacks(&self, target: DispatcherId, action: &Runnable) -> bool {
        self.has_matching(&MessageFilter {
            callback: Some(action),
            ..MessageFilter::target(target)
        })
    }

    pub(crate) fn has_matching(&self, filter: &MessageFilter<'_>) -> bool {
        self.lock().iter().any(|msg| filter.matches(msg))
    }

    /// Register a handler to run when the queue runs out of due messages.
    pub fn add_idle_handler(&self, handler: IdleHandlerRef) {
        self.lock().idle_handlers.push(handler);
    }

    /// Unregister `handler`. Returns false if it was not registered.
    pub fn remove_idle_handler(&self, handler: &IdleHandlerRef) -> bool {
        let removed: Vec<IdleHandlerRef> = {
            let mut state = self.lock();
            let (removed, kept) = std::mem::take(&mut state.idle_handlers)
                .into_iter()
                .partition(|h| idle::same_handler(h, handler));
            state.idle_handlers = kept;
            removed
        };
        // Dropped after the lock is released.
        !removed.is_empty()
    }

    pub fn idle_handler_count(&self) -> usize {
        self.lock().idle_handlers.len()
    }

    /// True when no message is due right now.
    pub fn is_idle(&self) -> bool {
        let now = clock::uptime_millis();
        self.lock()
            .messages
            .as_deref()
            .is_none_or(|head| head.when > now)
    }

    /// True while the consumer is parked on the condition variable.
    pub fn is_blocked(&self) -> bool {
        self.lock().blocked
    }

    /// True once the quit sentinel has been accepted.
    pub fn is_quitting(&self) -> bool {
        self.lock().quitting
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_none()
    }

    /// Pending messages in delivery order.
    pub fn snapshot(&self) -> Vec<PendingMessage> {
        self.lock().iter().map(PendingMessage::of).collect()
    }

    /// Refuse further messages and drop every pending one without
    /// dispatching it. Returns how many were discarded.
    pub(crate) fn dispose(&self) -> usize {
        let removed = {
            let mut state = self.lock();
            state.quitting = true;
            state.len = 0;
            let mut removed = Vec::new();
            let mut next = state.messages.take();
            while let Some(mut msg) = next {
                next = msg.next.take();
                removed.push(msg);
            }
            removed
        };
        let count = removed.len();
        self.pool.release_all(removed);
        count
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MessageQueue")
            .field("len", &state.len)
            .field("idle_handlers", &state.idle_handlers.len())
            .field("quitting", &state.quitting)
            .field("blocked", &state.blocked)
            .finish()
    }
}
