//! # Looper Thread
//!
//! A named OS thread that prepares a [`Looper`] and runs it until quit.
//!
//! The spawner blocks until the new thread has prepared its looper, so the
//! returned handle can schedule work immediately. A panic escaping a
//! dispatch is caught at the top of the thread, logged, and reported from
//! [`LooperThread::join`].

use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;

use tracing::{debug, error};

use crate::config::LooperConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{panic_message, LooperError};
use crate::looper::{Looper, LooperRegistry};

/// Owns a thread that runs one looper.
///
/// Dropping the handle without joining asks the looper to quit but does not
/// wait for the thread.
pub struct LooperThread {
    looper: Looper,
    name: String,
    handle: Option<JoinHandle<Result<(), LooperError>>>,
}

impl LooperThread {
    /// Spawn a thread named `<prefix>-<name>` with default configuration.
    pub fn spawn(name: impl Into<String>) -> Result<Self, LooperError> {
        Self::spawn_with(name, LooperConfig::default(), &LooperRegistry::global())
    }

    /// Spawn with an explicit configuration and registry.
    pub fn spawn_with(
        name: impl Into<String>,
        config: LooperConfig,
        registry: &LooperRegistry,
    ) -> Result<Self, LooperError> {
        let name = format!("{}-{}", config.thread_name_prefix, name.into());
        let (ready_tx, ready_rx) = flume::bounded::<Result<Looper, LooperError>>(1);
        let registry = registry.clone();
        let thread_name = name.clone();

        let handle = std::thread::Builder::new().name(name.clone()).spawn(move || {
            let looper = match Looper::builder().registry(&registry).config(config).prepare() {
                Ok(looper) => looper,
                Err(err) => {
                    // Reported to the spawner through the channel.
                    let _ = ready_tx.send(Err(err));
                    return Ok(());
                }
            };
            if ready_tx.send(Ok(looper.clone())).is_err() {
                return Ok(());
            }
            drop(ready_tx);

            match panic::catch_unwind(AssertUnwindSafe(|| looper.run())) {
                Ok(result) => {
                    debug!(thread = %thread_name, "Looper thread finished");
                    result
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(thread = %thread_name, panic = %message, "Looper thread panicked");
                    Err(LooperError::ThreadPanicked(message))
                }
            }
        })?;

        let looper = match ready_rx.recv() {
            Ok(prepared) => prepared?,
            Err(_) => {
                let message = match handle.join() {
                    Err(payload) => panic_message(payload.as_ref()),
                    Ok(_) => "looper thread exited before preparing".to_string(),
                };
                return Err(LooperError::ThreadPanicked(message));
            }
        };

        Ok(Self {
            looper,
            name,
            handle: Some(handle),
        })
    }

    pub fn looper(&self) -> &Looper {
        &self.looper
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A new dispatcher bound to this thread's looper.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::for_looper(&self.looper)
    }

    pub fn quit(&self) -> Result<(), LooperError> {
        self.looper.quit()
    }

    /// Wait for the thread to finish and return the result of its loop.
    pub fn join(mut self) -> Result<(), LooperError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|payload| LooperError::ThreadPanicked(panic_message(payload.as_ref())))?,
            None => Ok(()),
        }
    }

    /// Quit the looper and wait for the thread.
    pub fn quit_and_join(self) -> Result<(), LooperError> {
        match self.quit() {
            Ok(()) | Err(LooperError::Quitting) => {}
            Err(err) => return Err(err),
        }
        self.join()
    }
}

impl Drop for LooperThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.looper.quit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::runnable;
    use std::time::Duration;

    #[test]
    fn spawned_thread_carries_prefixed_name() {
        let registry = LooperRegistry::new();
        let worker = LooperThread::spawn_with("io", LooperConfig::default(), &registry).unwrap();
        assert_eq!(worker.name(), "herald-looper-io");
        assert_eq!(worker.looper().thread_name(), Some("herald-looper-io"));
        assert_eq!(registry.get(worker.looper().thread_id()), Some(worker.looper().clone()));
        worker.quit_and_join().unwrap();
    }

    #[test]
    fn panic_in_dispatch_is_reported_on_join() {
        let registry = LooperRegistry::new();
        let worker = LooperThread::spawn_with("boom", LooperConfig::default(), &registry).unwrap();
        let dispatcher = worker.dispatcher();
        assert!(dispatcher.post(runnable(|| panic!("dispatch failed"))));

        let looper = worker.looper().clone();
        while !looper.queue().is_quitting() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!dispatcher.send_empty_message(1));

        match worker.join() {
            Err(LooperError::ThreadPanicked(message)) => assert_eq!(message, "dispatch failed"),
            other => panic!("unexpected join result: {other:?}"),
        }
    }
}
