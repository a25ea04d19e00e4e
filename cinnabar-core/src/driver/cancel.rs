use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{Error, Result};

/// Cooperative cancellation shared by the driver and its workers.
///
/// Workers check the token between compilation steps; a cancelled task
/// reports [`Error::Cancelled`] and the driver aggregates it like any
/// other failure.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the token has been cancelled.
    pub fn check(&self, group: usize) -> Result<()> {
        if self.is_cancelled() {
            tracing::debug!(group, "observed cancellation");
            return Err(Error::Cancelled { group });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let worker = token.clone();
        assert!(worker.check(3).is_ok());
        token.cancel();
        let err = worker.check(3).unwrap_err();
        assert!(err.is_cancelled());
    }
}
