//! Boundaries to the outside world: the object cache the dispatcher reads
//! and the event source that feeds the work queue.
//!
//! Production deployments bring their own implementations. The in-memory
//! ones here back the tests and the `reconciler replay` command.

pub mod channel;
pub mod memory;

pub use channel::{Change, ChannelSource};
pub use memory::MemoryCache;

use std::future::Future;
use std::sync::Arc;

use crate::error::BoxError;
use crate::model::Event;
use crate::queue::WorkQueue;
use crate::shutdown::StopSignal;

/// Key to object lookup kept consistent with the event source.
pub trait ObjectCache: Send + Sync + 'static {
    type Object: Clone + Send + Sync + 'static;

    /// The object stored under `key`, or `None` if there is none.
    fn get_by_key(&self, key: &str) -> Result<Option<Self::Object>, BoxError>;

    /// True once the initial listing has been loaded.
    fn has_synced(&self) -> bool;
}

/// Watches an upstream system and pushes change events into the queue.
///
/// Implementations must update the cache for a key before sending its
/// event, and should return promptly once `stop` fires.
pub trait EventSource: Send + 'static {
    fn run(self, sink: EventSink, stop: StopSignal) -> impl Future<Output = ()> + Send;
}

/// Write-only handle onto the controller's work queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    queue: Arc<WorkQueue>,
}

impl EventSink {
    pub(crate) fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }

    /// Enqueue `event`. Coalesces with a pending event for the same key.
    pub fn send(&self, event: Event) {
        self.queue.add(event);
    }
}
