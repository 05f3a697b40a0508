use std::any::Any;
use std::io;
use std::thread::ThreadId;

use thiserror::Error;

/// Errors related to looper lifecycle and thread binding.
#[derive(Error, Debug)]
pub enum LooperError {
    #[error("Only one looper may be created per thread (thread {thread:?} already has one)")]
    AlreadyPrepared { thread: ThreadId },
    #[error("The main looper has already been prepared")]
    MainAlreadyPrepared,
    #[error("No looper prepared on this thread; call Looper::prepare() first")]
    NotPrepared,
    #[error("Looper is owned by thread {owner:?} but was driven from {caller:?}")]
    WrongThread { owner: ThreadId, caller: ThreadId },
    #[error("Looper is already running")]
    AlreadyRunning,
    #[error("Looper has already stopped")]
    Stopped,
    #[error("Main looper is not allowed to quit")]
    QuitNotAllowed,
    #[error("Looper is already quitting")]
    Quitting,
    #[error("Failed to spawn looper thread: {0}")]
    ThreadSpawn(#[from] io::Error),
    #[error("Looper thread panicked: {0}")]
    ThreadPanicked(String),
}

/// Errors reported by [`MessageQueue::enqueue`](crate::queue::MessageQueue::enqueue).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Message (what={what}) is already in flight and cannot be enqueued again")]
    MessageInUse { what: i32 },
    #[error("Queue is quitting; message sent to a handler on a dead thread")]
    Quitting,
    #[error("Queue does not accept a quit request")]
    QuitNotAllowed,
}

/// Errors related to the message pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Message pool exhausted (max size: {max_size})")]
    Exhausted { max_size: usize },
}

/// Errors returned by the fallible dispatcher APIs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Target queue is unavailable")]
    QueueUnavailable,
    #[error("Could not obtain a message: {0}")]
    Pool(#[from] PoolError),
    #[error("Call was cancelled before it ran")]
    Cancelled,
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic".to_string()
    }
}
