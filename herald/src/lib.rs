// herald: thread-bound message loops
//
// A thread prepares a `Looper`, which owns a time-ordered `MessageQueue`.
// Any thread holding a `Dispatcher` bound to that looper can schedule
// messages or deferred actions on it; the looper delivers them one at a time
// on its own thread, in due-time order, until it is told to quit.
//
// ```rust,no_run
// use std::time::Duration;
// use herald::{runnable, LooperThread};
//
// let worker = LooperThread::spawn("io")?;
// let dispatcher = worker.dispatcher();
// dispatcher.post_delayed(runnable(|| println!("later")), Duration::from_millis(100));
// dispatcher.post(runnable(|| println!("now")));
// worker.quit_and_join()?;
// ```

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod looper;
pub mod message;
pub mod queue;

// Re-export commonly used types
pub use config::{ExhaustionPolicy, LooperConfig, PoolConfig};
pub use dispatcher::{Callback, Dispatcher, DispatcherBuilder, DispatcherId, MessageHandler};
pub use error::{DispatchError, LooperError, PoolError, QueueError};
pub use looper::{Looper, LooperBuilder, LooperRegistry, LooperState, LooperStats, LooperThread};
pub use message::{payload, runnable, Message, MessagePool, Payload, PoolStats, Runnable};
pub use queue::{idle_handler, IdleHandler, IdleHandlerRef, MessageQueue, PendingMessage};
