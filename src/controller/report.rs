//! Out-of-band error reporting.
//!
//! Per-key failures never cross the worker boundary. Errors that need
//! attention (dropped keys, a failed startup) go to an [`ErrorReporter`].

use opentelemetry::KeyValue;
use tracing::error;

use crate::error::Error;
use crate::telemetry::metrics;

pub trait ErrorReporter: Send + Sync + 'static {
    fn report(&self, error: &Error);
}

/// Logs the error and bumps `reconciler.errors.reported`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, err: &Error) {
        metrics::errors_reported().add(1, &[KeyValue::new("kind", err.kind())]);
        error!(kind = err.kind(), error = %err, "reconcile error");
    }
}

impl<F> ErrorReporter for F
where
    F: Fn(&Error) + Send + Sync + 'static,
{
    fn report(&self, error: &Error) {
        self(error)
    }
}
