//! Cancellation tokens.

use crate::reset_lock::ResetLock;
use std::fmt;
use std::sync::Arc;

type CancelHandler = Box<dyn FnOnce() + Send>;

/// Handle that cancels a request, a subscription or a cache subscriber.
///
/// Cancelling is synchronous and idempotent; only the first call has an
/// effect. Clones share the same underlying action. Dropping a token does
/// **not** cancel: keep the token for as long as you want the work to live,
/// and call [`Cancellable::cancel`] to end it.
#[derive(Clone)]
pub struct Cancellable {
    handler: Arc<ResetLock<CancelHandler>>,
}

impl Cancellable {
    pub fn new(handler: impl FnOnce() + Send + 'static) -> Self {
        Self {
            handler: Arc::new(ResetLock::new(Box::new(handler))),
        }
    }

    /// A token with nothing to cancel.
    pub fn empty() -> Self {
        Self {
            handler: Arc::new(ResetLock::empty()),
        }
    }

    pub fn cancel(&self) {
        if let Some(handler) = self.handler.pop() {
            handler();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        !self.handler.is_set()
    }
}

impl fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellable")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
