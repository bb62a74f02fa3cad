//! Worker loop: get → sync → retry or forget → done.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{Instrument, debug, info, warn};

use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::model::Event;
use crate::queue::{RetryDecision, WorkQueue};
use crate::source::ObjectCache;
use crate::telemetry::metrics;
use crate::telemetry::sync::{record_result, start_sync_span};

use super::dispatch::Dispatcher;
use super::report::ErrorReporter;

/// Releases the in-flight mark when dropped, whatever happened in between.
struct InFlight<'a> {
    queue: &'a WorkQueue,
    key: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

pub(crate) struct Worker<C, H> {
    pub(crate) id: usize,
    pub(crate) queue: Arc<WorkQueue>,
    pub(crate) dispatcher: Arc<Dispatcher<C, H>>,
    pub(crate) reporter: Arc<dyn ErrorReporter>,
}

impl<C, H> Worker<C, H>
where
    C: ObjectCache,
    H: Handler<C::Object>,
{
    /// Process items until the queue shuts down.
    pub(crate) async fn run(self) {
        debug!(worker = self.id, "worker started");
        while self.process_next_item().await {}
        info!(worker = self.id, "worker stopped");
    }

    async fn process_next_item(&self) -> bool {
        let Some(event) = self.queue.get().await else {
            return false;
        };

        let key = event.key.clone();
        // Retry bookkeeping happens before the key is released, so the key
        // is never observed as neither in flight nor scheduled.
        let _in_flight = InFlight {
            queue: &self.queue,
            key: &key,
        };

        let span = start_sync_span(&event, self.id);
        let started = Instant::now();
        let result = self.dispatcher.sync(&event).instrument(span.clone()).await;
        metrics::sync_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("action", event.action.to_string())],
        );

        let outcome = span.in_scope(|| self.handle_err(result, event));
        record_result(&span, outcome);
        true
    }

    /// Forget on success, requeue with backoff on failure, drop once the
    /// retry threshold is reached. Returns the outcome label.
    fn handle_err(&self, result: Result<()>, event: Event) -> &'static str {
        let action = KeyValue::new("action", event.action.to_string());

        let Err(err) = result else {
            self.queue.forget(&event.key);
            metrics::sync_total().add(1, &[action, KeyValue::new("result", "ok")]);
            return "ok";
        };

        let attempts = self.queue.num_requeues(&event.key);
        match self.queue.policy().decide(&event.key, attempts) {
            RetryDecision::Requeue(_) => {
                let key = event.key.clone();
                let delay = self.queue.add_rate_limited(event);
                warn!(
                    %key,
                    attempt = attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "error syncing"
                );
                metrics::queue_requeues().add(1, &[]);
                metrics::sync_total().add(1, &[action, KeyValue::new("result", "requeued")]);
                "requeued"
            }
            RetryDecision::GiveUp => {
                self.queue.forget(&event.key);
                let dropped = Error::GiveUp {
                    key: event.key,
                    retries: attempts,
                    source: Box::new(err),
                };
                self.reporter.report(&dropped);
                warn!(error = %dropped, "dropping out of the queue");
                metrics::queue_dropped().add(1, &[]);
                metrics::sync_total().add(1, &[action, KeyValue::new("result", "dropped")]);
                "dropped"
            }
        }
    }
}
