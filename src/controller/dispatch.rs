//! Sync logic: resolve the event against the cache, then call the handler.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::model::Event;
use crate::source::ObjectCache;

pub struct Dispatcher<C, H> {
    cache: Arc<C>,
    handler: Arc<H>,
}

impl<C, H> Dispatcher<C, H>
where
    C: ObjectCache,
    H: Handler<C::Object>,
{
    pub fn new(cache: Arc<C>, handler: Arc<H>) -> Self {
        Self { cache, handler }
    }

    /// Run the handler for `event` against the object as cached right now.
    ///
    /// A non-delete event whose object is missing fails with
    /// [`Error::InconsistentState`] and never reaches the handler. The
    /// handler runs in its own task so a panic comes back as
    /// [`Error::HandlerPanicked`] instead of taking the worker down.
    pub async fn sync(&self, event: &Event) -> Result<()> {
        let object = self
            .cache
            .get_by_key(&event.key)
            .map_err(|e| Error::Cache(format!("{}: {e}", event.key)))?;

        if object.is_none() && event.action.expects_object() {
            return Err(Error::InconsistentState {
                key: event.key.clone(),
                action: event.action,
            });
        }

        let handler = Arc::clone(&self.handler);
        let owned = event.clone();
        let outcome = tokio::spawn(async move { handler.handle(owned, object).await }).await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Handler(e)),
            Err(join) if join.is_panic() => Err(Error::HandlerPanicked {
                key: event.key.clone(),
            }),
            Err(join) => Err(Error::Other(format!(
                "handler task for {} cancelled: {join}",
                event.key
            ))),
        }
    }
}
