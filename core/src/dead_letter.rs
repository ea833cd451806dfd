//! Dead-letter collaborator for events a projection could not decode.

use crate::event::StoredEvent;
use crate::projection::ProjectionError;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`DeadLetterSink::record`].
pub type DeadLetterFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ProjectionError>> + Send + 'a>>;

/// Records failed events so operators can inspect or replay them out of band.
pub trait DeadLetterSink: Send + Sync {
    /// Record `event` as failed for `view`.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::Storage`] if the record cannot be written. The
    /// runner then treats the batch as failed.
    fn record<'a>(&'a self, view: &'a str, event: &'a StoredEvent, reason: &'a str) -> DeadLetterFuture<'a>;
}
