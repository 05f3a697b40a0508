//! Bounded free list of recycled messages.
//!
//! The pool is an explicit instance owned by whoever prepares a looper (or
//! shared between loopers by passing the same `Arc`). Its lock is never held
//! while the queue lock is held.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::config::{ExhaustionPolicy, PoolConfig};
use crate::error::PoolError;
use crate::message::Message;

#[derive(Default)]
struct FreeList {
    head: Option<Box<Message>>,
    len: usize,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Messages allocated because the free list was empty.
    pub allocated: usize,
    /// Messages returned to the free list.
    pub recycled: usize,
    /// Messages dropped on release because the free list was full.
    pub discarded: usize,
    /// Messages currently on the free list.
    pub free: usize,
}

/// Process- or looper-scoped pool of reusable messages.
pub struct MessagePool {
    free: Mutex<FreeList>,
    config: PoolConfig,
    allocated: AtomicUsize,
    recycled: AtomicUsize,
    discarded: AtomicUsize,
}

impl MessagePool {
    /// Create a pool, allocating `config.prefill` messages up front.
    pub fn new(config: PoolConfig) -> Self {
        let prefill = config.prefill.min(config.max_size);
        let mut free = FreeList::default();
        for _ in 0..prefill {
            let mut msg = Box::new(Message::new());
            msg.next = free.head.take();
            free.head = Some(msg);
            free.len += 1;
        }
        if prefill > 0 {
            debug!(prefill, max_size = config.max_size, "Message pool prefilled");
        }

        Self {
            free: Mutex::new(free),
            config,
            allocated: AtomicUsize::new(prefill),
            recycled: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FreeList> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop a cleared message off the free list, or allocate one when the
    /// policy allows it.
    pub fn acquire(&self) -> Result<Box<Message>, PoolError> {
        {
            let mut free = self.lock();
            if let Some(mut msg) = free.head.take() {
                free.head = msg.next.take();
                free.len -= 1;
                return Ok(msg);
            }
        }

        match self.config.exhaustion {
            ExhaustionPolicy::Allocate => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Ok(Box::new(Message::new()))
            }
            ExhaustionPolicy::Fail => Err(PoolError::Exhausted {
                max_size: self.config.max_size,
            }),
        }
    }

    /// Clear `msg` and push it on the free list if there is room; otherwise
    /// it is dropped.
    pub fn release(&self, mut msg: Box<Message>) {
        msg.clear_for_recycle();

        let mut free = self.lock();
        if free.len < self.config.max_size {
            msg.next = free.head.take();
            free.head = Some(msg);
            free.len += 1;
            drop(free);
            self.recycled.fetch_add(1, Ordering::Relaxed);
        } else {
            drop(free);
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Release every message unlinked by a removal pass.
    pub(crate) fn release_all(&self, removed: Vec<Box<Message>>) {
        for msg in removed {
            self.release(msg);
        }
    }

    /// Number of messages currently available for reuse.
    pub fn free_len(&self) -> usize {
        self.lock().len
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            free: self.free_len(),
        }
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl fmt::Debug for MessagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePool")
            .field("max_size", &self.config.max_size)
            .field("exhaustion", &self.config.exhaustion)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::payload;

    #[test]
    fn acquire_allocates_when_empty() {
        let pool = MessagePool::default();
        let msg = pool.acquire().unwrap();
        assert_eq!(msg.what, 0);
        assert_eq!(pool.stats().allocated, 1);
        assert_eq!(pool.free_len(), 0);
    }

    #[test]
    fn release_is_bounded() {
        let pool = MessagePool::new(PoolConfig {
            max_size: 2,
            ..Default::default()
        });
        for _ in 0..5 {
            pool.release(Box::new(Message::new()));
        }
        let stats = pool.stats();
        assert_eq!(stats.free, 2);
        assert_eq!(stats.recycled, 2);
        assert_eq!(stats.discarded, 3);
    }

    #[test]
    fn reacquired_message_is_cleared() {
        let pool = MessagePool::default();
        let mut msg = Box::new(Message::with_what(9));
        msg.arg1 = 4;
        msg.arg2 = 5;
        msg.obj = Some(payload(String::from("x")));
        msg.when = 1234;
        msg.in_flight = true;
        pool.release(msg);

        let msg = pool.acquire().unwrap();
        assert_eq!(msg.what, 0);
        assert_eq!(msg.arg1, 0);
        assert_eq!(msg.arg2, 0);
        assert!(msg.obj.is_none());
        assert_eq!(msg.when(), 0);
        assert!(!msg.is_in_flight());
        assert!(msg.next.is_none());
        assert_eq!(pool.stats().allocated, 0);
    }

    #[test]
    fn fail_policy_caps_in_flight_messages() {
        let pool = MessagePool::new(PoolConfig {
            max_size: 2,
            prefill: 2,
            exhaustion: ExhaustionPolicy::Fail,
        });
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert_eq!(pool.acquire().unwrap_err(), PoolError::Exhausted { max_size: 2 });

        pool.release(a);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn prefill_is_clamped_to_max_size() {
        let pool = MessagePool::new(PoolConfig {
            max_size: 3,
            prefill: 10,
            ..Default::default()
        });
        assert_eq!(pool.free_len(), 3);
    }
}
