//! Event source driven by an in-process channel of object changes.
//!
//! Applies every change to a shared [`MemoryCache`] before emitting the
//! matching event, the same ordering an informer keeps between its store and
//! its handlers.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::model::{Action, Event};
use crate::shutdown::StopSignal;

use super::{EventSink, EventSource, MemoryCache};

/// One upstream change.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<O> {
    /// The object was created or modified.
    Upsert { key: String, object: O },
    /// The object was removed.
    Delete { key: String },
}

impl<O> Change<O> {
    pub fn upsert(key: impl Into<String>, object: O) -> Self {
        Change::Upsert {
            key: key.into(),
            object,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Change::Delete { key: key.into() }
    }
}

pub struct ChannelSource<O> {
    cache: Arc<MemoryCache<O>>,
    initial: Vec<Change<O>>,
    changes: mpsc::Receiver<Change<O>>,
}

impl<O> ChannelSource<O>
where
    O: Clone + Send + Sync + 'static,
{
    pub fn new(cache: Arc<MemoryCache<O>>, changes: mpsc::Receiver<Change<O>>) -> Self {
        Self {
            cache,
            initial: Vec::new(),
            changes,
        }
    }

    /// Changes applied before the cache is marked synced.
    pub fn with_initial(mut self, initial: Vec<Change<O>>) -> Self {
        self.initial = initial;
        self
    }

    fn apply(&self, change: Change<O>, sink: &EventSink) {
        let event = match change {
            Change::Upsert { key, object } => {
                let action = match self.cache.insert(key.clone(), object) {
                    Some(_) => Action::Update,
                    None => Action::Add,
                };
                Event::new(key, action)
            }
            Change::Delete { key } => {
                self.cache.remove(&key);
                Event::delete(key)
            }
        };
        debug!(key = %event.key, action = %event.action, "observed change");
        sink.send(event);
    }
}

impl<O> EventSource for ChannelSource<O>
where
    O: Clone + Send + Sync + 'static,
{
    fn run(mut self, sink: EventSink, stop: StopSignal) -> impl Future<Output = ()> + Send {
        async move {
            let initial = std::mem::take(&mut self.initial);
            let listed = initial.len();
            for change in initial {
                self.apply(change, &sink);
            }
            self.cache.mark_synced();
            info!(listed, "initial list applied, cache synced");

            loop {
                tokio::select! {
                    _ = stop.stopped() => break,
                    change = self.changes.recv() => match change {
                        Some(change) => self.apply(change, &sink),
                        None => {
                            debug!("change channel closed");
                            break;
                        }
                    },
                }
            }
        }
    }
}
