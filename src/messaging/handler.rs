use futures::future::BoxFuture;

use crate::contracts::{Headers, ProcessingOutcome};

/// Eventual result of processing one delivery.
pub type ProcessingTask = BoxFuture<'static, ProcessingOutcome>;

/// Application logic invoked for each delivery.
///
/// `process` is called on the consumer's event loop and must return quickly:
/// slow work belongs inside the returned task, which runs on the worker pool.
/// An `Err` means the callback failed before it could produce a task, and is
/// settled like an unclassified failure.
#[cfg_attr(test, mockall::automock)]
pub trait RequestProcessor: Send + Sync {
    fn process(&self, body: String, headers: Headers) -> Result<ProcessingTask, ProcessingError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Processing callback failed: {0}")]
    Callback(String),
}
