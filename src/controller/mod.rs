//! Controller lifecycle: start the event source, wait for the cache, run
//! the worker pool, shut down on the stop signal.

pub mod dispatch;
pub mod report;
mod worker;

pub use dispatch::Dispatcher;
pub use report::{ErrorReporter, LogReporter};

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::queue::{WorkQueue, deadline_after};
use crate::shutdown::{self, StopHandle, StopSignal};
use crate::source::{EventSink, EventSource, ObjectCache};

use worker::Worker;

/// How long a stopped event source gets to return before it is aborted.
const SOURCE_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    /// Wired up, not started.
    Created,
    /// Event source running, waiting for the cache to sync.
    Syncing,
    /// Workers processing the queue.
    Running,
    /// Queue shut down, waiting for workers to finish.
    Stopping,
    /// Terminal.
    Stopped,
}

impl ControllerState {
    pub fn can_transition_to(self, to: ControllerState) -> bool {
        use ControllerState::*;
        matches!(
            (self, to),
            (Created, Syncing)
                | (Syncing, Running)
                | (Syncing, Stopping)   // stopped or timed out before sync
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ControllerState::Stopped
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControllerState::Created => "created",
            ControllerState::Syncing => "syncing",
            ControllerState::Running => "running",
            ControllerState::Stopping => "stopping",
            ControllerState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Owns the work queue, the stop channel and the worker pool.
///
/// Nothing here is global, so several controllers can run in one process.
pub struct Controller<C, H, S> {
    id: Uuid,
    config: ControllerConfig,
    queue: Arc<WorkQueue>,
    cache: Arc<C>,
    dispatcher: Arc<Dispatcher<C, H>>,
    source: Mutex<Option<S>>,
    reporter: Arc<dyn ErrorReporter>,
    state: watch::Sender<ControllerState>,
    stop: StopHandle,
    stop_signal: StopSignal,
}

impl<C, H, S> Controller<C, H, S>
where
    C: ObjectCache,
    H: Handler<C::Object>,
    S: EventSource,
{
    pub fn new(config: ControllerConfig, cache: Arc<C>, source: S, handler: H) -> Self {
        let (stop, stop_signal) = shutdown::channel();
        let (state, _) = watch::channel(ControllerState::Created);
        Self {
            id: Uuid::new_v4(),
            queue: Arc::new(WorkQueue::new(config.retry)),
            dispatcher: Arc::new(Dispatcher::new(Arc::clone(&cache), Arc::new(handler))),
            cache,
            config,
            source: Mutex::new(Some(source)),
            reporter: Arc::new(LogReporter),
            state,
            stop,
            stop_signal,
        }
    }

    /// Replace the default [`LogReporter`].
    pub fn with_reporter(mut self, reporter: impl ErrorReporter) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Effective configuration, including any overrides applied at startup.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Resolves once the controller reaches `target` or stops.
    pub fn wait_for_state(
        &self,
        target: ControllerState,
    ) -> impl Future<Output = ControllerState> + Send + use<C, H, S> {
        let mut rx = self.state.subscribe();
        async move {
            let reached = rx
                .wait_for(|state| *state == target || state.is_terminal())
                .await
                .map(|state| *state);
            reached.unwrap_or(ControllerState::Stopped)
        }
    }

    /// Handle that stops this controller from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Request shutdown. Idempotent.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Consecutive failures recorded for `key`.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.queue.num_requeues(key)
    }

    /// True when nothing is queued, delayed, or in flight.
    pub fn is_idle(&self) -> bool {
        self.queue.is_idle()
    }

    fn transition(&self, to: ControllerState) -> Result<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if state.can_transition_to(to) {
                debug!(controller = %self.id, from = %state, %to, "controller transition");
                *state = to;
                true
            } else {
                result = Err(Error::InvalidTransition { from: *state, to });
                false
            }
        });
        result
    }

    /// Run the controller until it is stopped.
    ///
    /// Blocks until the cache has synced, then runs `threadiness` workers
    /// until the stop signal fires. In-flight syncs finish before this
    /// returns. Fails with [`Error::SyncTimeout`] if the stop signal (or the
    /// configured sync timeout) wins the race against the cache, and with
    /// [`Error::InvalidTransition`] if the controller was already started.
    pub async fn run(&self) -> Result<()> {
        self.config.validate()?;
        self.transition(ControllerState::Syncing)?;
        info!(
            controller = %self.id,
            threadiness = self.config.threadiness,
            "starting controller"
        );

        let source = self
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let source_task = source.map(|source| {
            let sink = EventSink::new(Arc::clone(&self.queue));
            tokio::spawn(
                source
                    .run(sink, self.stop_signal.clone())
                    .instrument(tracing::info_span!("event_source", controller = %self.id)),
            )
        });

        if let Err(err) = self.wait_for_cache_sync().await {
            self.reporter.report(&err);
            self.shut_down(JoinSet::new(), source_task).await;
            return Err(err);
        }
        if self.stop_signal.is_stopped() {
            info!(controller = %self.id, "stopped before workers started");
            self.shut_down(JoinSet::new(), source_task).await;
            return Ok(());
        }
        self.transition(ControllerState::Running)?;
        info!(controller = %self.id, "caches synced, starting workers");

        let mut workers = JoinSet::new();
        for id in 0..self.config.threadiness {
            let worker = Worker {
                id,
                queue: Arc::clone(&self.queue),
                dispatcher: Arc::clone(&self.dispatcher),
                reporter: Arc::clone(&self.reporter),
            };
            workers.spawn(worker.run());
        }

        self.stop_signal.stopped().await;
        info!(controller = %self.id, "stopping controller");
        self.shut_down(workers, source_task).await;
        Ok(())
    }

    /// Poll the cache until it reports synced.
    async fn wait_for_cache_sync(&self) -> Result<()> {
        let deadline = self.config.sync_timeout.map(deadline_after);
        let mut ticker = tokio::time::interval(self.config.sync_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.cache.has_synced() {
                return Ok(());
            }
            if self.stop_signal.is_stopped() {
                return Err(Error::SyncTimeout);
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.stop_signal.stopped() => {}
                _ = sleep_until_opt(deadline) => {
                    if !self.cache.has_synced() {
                        return Err(Error::SyncTimeout);
                    }
                }
            }
        }
    }

    async fn shut_down(&self, mut workers: JoinSet<()>, source: Option<JoinHandle<()>>) {
        if let Err(err) = self.transition(ControllerState::Stopping) {
            warn!(controller = %self.id, error = %err, "unexpected state during shutdown");
        }
        self.stop.stop();
        self.queue.shut_down();

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(controller = %self.id, error = %err, "worker task failed");
            }
        }

        if let Some(mut task) = source {
            match tokio::time::timeout(SOURCE_SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(controller = %self.id, error = %err, "event source task failed")
                }
                Err(_) => {
                    warn!(controller = %self.id, "event source ignored stop, aborting");
                    task.abort();
                }
            }
        }

        if let Err(err) = self.transition(ControllerState::Stopped) {
            warn!(controller = %self.id, error = %err, "unexpected state during shutdown");
        }
        info!(controller = %self.id, "controller stopped");
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
