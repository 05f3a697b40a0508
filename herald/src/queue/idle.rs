use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::error::panic_message;

/// Callback invoked when the looper runs out of due messages.
///
/// Return `true` to stay registered, `false` to be removed after this call.
pub trait IdleHandler: Send + Sync {
    fn queue_idle(&self) -> bool;
}

impl<F> IdleHandler for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn queue_idle(&self) -> bool {
        self()
    }
}

/// Shared handle used to register and later unregister an idle handler.
pub type IdleHandlerRef = Arc<dyn IdleHandler>;

/// Wrap a closure as an [`IdleHandlerRef`].
pub fn idle_handler<F>(f: F) -> IdleHandlerRef
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

pub(crate) fn same_handler(a: &IdleHandlerRef, b: &IdleHandlerRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Invoke one handler. A panic counts as "do not keep".
pub(crate) fn run_idle_handler(handler: &IdleHandlerRef) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.queue_idle())) {
        Ok(keep) => keep,
        Err(payload) => {
            error!(
                panic = %panic_message(payload.as_ref()),
                "Idle handler panicked; unregistering it"
            );
            false
        }
    }
}
