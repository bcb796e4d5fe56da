use tracing::warn;

use crate::error::ValidationError;

/// Sink for rule violations. Every violation is reported here before it is
/// returned to the caller.
pub trait ValidationListener: Send + Sync {
    /// `subject` is the hash of the operation or block that failed.
    fn on_error(&self, subject: &str, error: &ValidationError);
}

/// Logs violations through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl ValidationListener for TracingListener {
    fn on_error(&self, subject: &str, error: &ValidationError) {
        warn!(code = error.kind.code(), subject, "{}", error.message);
    }
}
