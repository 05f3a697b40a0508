//! Thread-to-looper bindings.
//!
//! A registry maps each prepared thread to its [`Looper`] and remembers the
//! main looper. The process-wide instance is [`LooperRegistry::global`];
//! tests and embedders can create isolated registries with
//! [`LooperRegistry::new`].
//!
//! A binding lives as long as its thread: registering installs a
//! thread-local guard that unbinds the looper when the thread exits and shuts
//! it down, so later sends to it are refused.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread::{self, ThreadId};

use lazy_static::lazy_static;
use tracing::debug;

use crate::error::LooperError;
use crate::looper::Looper;

lazy_static! {
    static ref GLOBAL: LooperRegistry = LooperRegistry::new();
}

thread_local! {
    static BINDINGS: RefCell<Vec<Binding>> = const { RefCell::new(Vec::new()) };
}

#[derive(Default)]
struct RegistryState {
    loopers: HashMap<ThreadId, Looper>,
    main: Option<Looper>,
}

/// Shared map from thread to prepared looper.
#[derive(Clone, Default)]
pub struct LooperRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl LooperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by [`Looper::prepare`] and friends.
    pub fn global() -> LooperRegistry {
        GLOBAL.clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looper prepared on the calling thread.
    pub fn current(&self) -> Option<Looper> {
        self.get(thread::current().id())
    }

    pub fn get(&self, thread: ThreadId) -> Option<Looper> {
        self.read().loopers.get(&thread).cloned()
    }

    pub fn main(&self) -> Option<Looper> {
        self.read().main.clone()
    }

    pub fn len(&self) -> usize {
        self.read().loopers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().loopers.is_empty()
    }

    /// Bind `looper` to the calling thread, optionally as the main looper.
    pub(crate) fn register(&self, looper: &Looper, main: bool) -> Result<(), LooperError> {
        let thread = thread::current().id();
        {
            let mut state = self.write();
            if state.loopers.contains_key(&thread) {
                return Err(LooperError::AlreadyPrepared { thread });
            }
            if main && state.main.is_some() {
                return Err(LooperError::MainAlreadyPrepared);
            }
            state.loopers.insert(thread, looper.clone());
            if main {
                state.main = Some(looper.clone());
            }
        }

        let binding = Binding {
            registry: Arc::downgrade(&self.state),
            thread,
        };
        BINDINGS.with(|bindings| bindings.borrow_mut().push(binding));
        Ok(())
    }
}

impl fmt::Debug for LooperRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("LooperRegistry")
            .field("loopers", &state.loopers.len())
            .field("has_main", &state.main.is_some())
            .finish()
    }
}

/// Unbinds a thread's looper when the thread-local storage is torn down.
struct Binding {
    registry: Weak<RwLock<RegistryState>>,
    thread: ThreadId,
}

impl Drop for Binding {
    fn drop(&mut self) {
        let Some(shared) = self.registry.upgrade() else {
            return;
        };
        let (looper, main) = {
            let mut state = shared.write().unwrap_or_else(PoisonError::into_inner);
            let looper = state.loopers.remove(&self.thread);
            let is_main = state
                .main
                .as_ref()
                .is_some_and(|main| main.thread_id() == self.thread);
            let main = if is_main { state.main.take() } else { None };
            (looper, main)
        };
        // Shut down and dropped outside the registry lock.
        if let Some(looper) = &looper {
            let discarded = looper.shut_down();
            debug!(thread = ?self.thread, discarded, "Looper unbound from exiting thread");
        }
        drop((looper, main));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::looper::LooperState;

    #[test]
    fn binding_is_removed_when_thread_exits() {
        let registry = LooperRegistry::new();
        let r = registry.clone();
        thread::spawn(move || {
            Looper::builder().registry(&r).prepare().unwrap();
            assert_eq!(r.len(), 1);
            assert!(r.current().is_some());
        })
        .join()
        .unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn exiting_thread_shuts_its_looper_down() {
        let registry = LooperRegistry::new();
        let r = registry.clone();
        let looper = thread::spawn(move || {
            let looper = Looper::builder().registry(&r).prepare().unwrap();
            assert!(Dispatcher::for_looper(&looper).send_empty_message(7));
            looper
        })
        .join()
        .unwrap();

        assert_eq!(looper.state(), LooperState::Stopped);
        assert!(looper.queue().is_quitting());
        assert!(looper.queue().is_empty());
        assert_eq!(looper.pool().free_len(), 1);

        let dispatcher = Dispatcher::for_looper(&looper);
        assert!(!dispatcher.send_empty_message(1));
        assert!(!dispatcher.post(crate::runnable(|| {})));
        assert!(looper.queue().is_empty());
    }

    #[test]
    fn registries_are_isolated() {
        let a = LooperRegistry::new();
        let b = LooperRegistry::new();
        thread::spawn(move || {
            Looper::builder().registry(&a).prepare().unwrap();
            assert!(b.current().is_none());
            Looper::builder().registry(&b).prepare().unwrap();
            assert_eq!(a.len(), 1);
            assert_eq!(b.len(), 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn main_slot_is_released_with_its_thread() {
        let registry = LooperRegistry::new();
        let r = registry.clone();
        thread::spawn(move || {
            Looper::builder().registry(&r).main().prepare().unwrap();
            assert!(r.main().is_some());
        })
        .join()
        .unwrap();
        assert!(registry.main().is_none());
    }
}
