use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::foundation::error::{RenderError, RenderResultT};

/// Cooperative cancellation signal shared between a caller and a running render.
///
/// Cloning shares the same flag. Once cancelled, a token stays cancelled.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return [`RenderError::Aborted`] when cancellation was requested.
    pub fn check(&self) -> RenderResultT<()> {
        if self.is_cancelled() {
            return Err(RenderError::Aborted);
        }
        Ok(())
    }
}
