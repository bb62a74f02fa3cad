//! The user-supplied reconcile callback.

use std::future::Future;

use crate::error::BoxError;
use crate::model::Event;

/// Called once per dispatched event with the object as currently cached.
///
/// `object` is `None` only for delete events whose object is already gone.
/// Invoked concurrently for distinct keys, never for the same key.
/// Returning an error schedules a retry with backoff.
pub trait Handler<O>: Send + Sync + 'static {
    fn handle(
        &self,
        event: Event,
        object: Option<O>,
    ) -> impl Future<Output = Result<(), BoxError>> + Send;
}

/// Handler built from an async closure. See [`handler_fn`].
#[derive(Debug, Clone)]
pub struct HandlerFn<F>(F);

/// Wrap `f` as a [`Handler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn(f)
}

impl<O, F, Fut> Handler<O> for HandlerFn<F>
where
    O: Send + 'static,
    F: Fn(Event, Option<O>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    fn handle(
        &self,
        event: Event,
        object: Option<O>,
    ) -> impl Future<Output = Result<(), BoxError>> + Send {
        (self.0)(event, object)
    }
}
