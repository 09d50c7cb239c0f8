use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use groupexec_error::{ErrorKind, GroupExecError, Result};

/// Cooperative cancellation handle.
///
/// Cloned into every loop that can iterate over a large amount of data (sort
/// drains, hash fills, hash scans, spill reads). Tripping it makes the next
/// check fail with `ErrorKind::Cancelled`; no partial row is emitted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(GroupExecError::with_kind(
                "Query execution cancelled",
                ErrorKind::Cancelled,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_trips_after_cancel() {
        let token = CancelToken::new();
        token.check().unwrap();

        token.cancel();
        let err = token.check().unwrap_err();
        assert_eq!(ErrorKind::Cancelled, err.kind());
    }
}
