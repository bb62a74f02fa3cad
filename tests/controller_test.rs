//! Integration tests for the controller: startup gate, worker pool, retry
//! and give-up, shutdown.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reconciler::config::ControllerConfig;
use reconciler::error::{BoxError, Error};
use reconciler::model::{Action, Event};
use reconciler::queue::RetryPolicy;
use reconciler::shutdown::StopSignal;
use reconciler::source::{Change, ChannelSource, EventSink, EventSource, MemoryCache, ObjectCache};
use reconciler::{Controller, ControllerState, handler_fn};
use tokio::sync::mpsc;
use tokio::time::timeout;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn fast_config(threadiness: usize, retry_threshold: u32) -> ControllerConfig {
    ControllerConfig {
        threadiness,
        retry: RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(20),
            retry_threshold,
        ),
        sync_poll_interval: Duration::from_millis(5),
        sync_timeout: None,
    }
}

/// Sends a fixed list of events, then idles until stopped.
struct ScriptedSource {
    events: Vec<Event>,
}

impl ScriptedSource {
    fn new(events: Vec<Event>) -> Self {
        Self { events }
    }
}

impl EventSource for ScriptedSource {
    fn run(self, sink: EventSink, stop: StopSignal) -> impl Future<Output = ()> + Send {
        async move {
            for event in self.events {
                sink.send(event);
            }
            stop.stopped().await;
        }
    }
}

/// Wraps a [`MemoryCache`] and counts lookups.
struct CountingCache {
    inner: MemoryCache<String>,
    lookups: AtomicUsize,
}

impl CountingCache {
    fn synced_with(entries: &[(&str, &str)]) -> Arc<Self> {
        let inner = MemoryCache::synced();
        for (key, object) in entries {
            inner.insert(*key, object.to_string());
        }
        Arc::new(Self {
            inner,
            lookups: AtomicUsize::new(0),
        })
    }
}

impl ObjectCache for CountingCache {
    type Object = String;

    fn get_by_key(&self, key: &str) -> Result<Option<String>, BoxError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.get_by_key(key)
    }

    fn has_synced(&self) -> bool {
        self.inner.has_synced()
    }
}

type Reported = Arc<Mutex<Vec<String>>>;

fn collecting_reporter() -> (impl Fn(&Error) + Send + Sync + 'static, Reported) {
    let reported: Reported = Arc::default();
    let sink = Arc::clone(&reported);
    let reporter = move |err: &Error| {
        sink.lock().unwrap().push(format!("{}: {err}", err.kind()));
    };
    (reporter, reported)
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn finish<T>(task: tokio::task::JoinHandle<T>) -> T {
    timeout(Duration::from_secs(5), task)
        .await
        .expect("controller did not stop")
        .expect("controller task panicked")
}

// ---------------------------------------------------------------------------
// End-to-end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_sync_runs_handler_once_and_forgets_key() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = handler_fn({
        let calls = Arc::clone(&calls);
        move |_event: Event, object: Option<String>| {
            let calls = Arc::clone(&calls);
            async move {
                assert_eq!(object.as_deref(), Some("obj-a"));
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        }
    });
    let (reporter, reported) = collecting_reporter();
    let cache = CountingCache::synced_with(&[("a", "obj-a")]);
    let controller = Arc::new(
        Controller::new(
            fast_config(2, 5),
            cache,
            ScriptedSource::new(vec![Event::add("a")]),
            handler,
        )
        .with_reporter(reporter),
    );

    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run().await }
    });

    eventually("handler call", || calls.load(Ordering::SeqCst) == 1).await;
    eventually("idle queue", || controller.is_idle()).await;
    controller.stop();
    finish(run).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(controller.num_requeues("a"), 0);
    assert!(reported.lock().unwrap().is_empty());
    assert_eq!(controller.state(), ControllerState::Stopped);
}

#[tokio::test]
async fn missing_object_is_retried_then_dropped() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = handler_fn({
        let calls = Arc::clone(&calls);
        move |_event: Event, _object: Option<String>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        }
    });
    let (reporter, reported) = collecting_reporter();
    let cache = CountingCache::synced_with(&[]);
    let controller = Arc::new(
        Controller::new(
            fast_config(1, 5),
            Arc::clone(&cache),
            ScriptedSource::new(vec![Event::update("b")]),
            handler,
        )
        .with_reporter(reporter),
    );

    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run().await }
    });

    eventually("drop report", || !reported.lock().unwrap().is_empty()).await;
    eventually("idle queue", || controller.is_idle()).await;
    controller.stop();
    finish(run).await.unwrap();

    // One initial attempt plus five retries.
    assert_eq!(cache.lookups.load(Ordering::SeqCst), 6);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(controller.num_requeues("b"), 0);

    let reported = reported.lock().unwrap();
    assert_eq!(reported.len(), 1);
    assert!(reported[0].starts_with("give_up"), "{}", reported[0]);
    assert!(reported[0].contains("does not exist in update event"));
    assert!(reported[0].contains("after 5 retries"), "{}", reported[0]);
}

#[tokio::test]
async fn failing_handler_is_retried_exactly_threshold_times() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = handler_fn({
        let calls = Arc::clone(&calls);
        move |_event: Event, _object: Option<String>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), BoxError>("always broken".into())
            }
        }
    });
    let (reporter, reported) = collecting_reporter();
    let controller = Arc::new(
        Controller::new(
            fast_config(3, 3),
            CountingCache::synced_with(&[("c", "obj-c")]),
            ScriptedSource::new(vec![Event::update("c")]),
            handler,
        )
        .with_reporter(reporter),
    );

    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run().await }
    });

    eventually("drop report", || !reported.lock().unwrap().is_empty()).await;
    eventually("idle queue", || controller.is_idle()).await;
    controller.stop();
    finish(run).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(controller.num_requeues("c"), 0);
    assert_eq!(reported.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn transient_failure_recovers_without_report() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = handler_fn({
        let calls = Arc::clone(&calls);
        move |_event: Event, _object: Option<String>| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err::<(), BoxError>("not yet".into());
                }
                Ok(())
            }
        }
    });
    let (reporter, reported) = collecting_reporter();
    let controller = Arc::new(
        Controller::new(
            fast_config(1, 5),
            CountingCache::synced_with(&[("d", "obj-d")]),
            ScriptedSource::new(vec![Event::add("d")]),
            handler,
        )
        .with_reporter(reporter),
    );

    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run().await }
    });

    eventually("third call", || calls.load(Ordering::SeqCst) >= 3).await;
    eventually("idle queue", || controller.is_idle()).await;
    controller.stop();
    finish(run).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(controller.num_requeues("d"), 0);
    assert!(reported.lock().unwrap().is_empty());
}

#[tokio::test]
async fn handler_panic_is_retried_like_an_error() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = handler_fn({
        let calls = Arc::clone(&calls);
        move |_event: Event, _object: Option<String>| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first attempt explodes");
                }
                Ok::<(), BoxError>(())
            }
        }
    });
    let controller = Arc::new(Controller::new(
        fast_config(1, 5),
        CountingCache::synced_with(&[("p", "obj-p")]),
        ScriptedSource::new(vec![Event::update("p")]),
        handler,
    ));

    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run().await }
    });

    eventually("second call", || calls.load(Ordering::SeqCst) >= 2).await;
    eventually("idle queue", || controller.is_idle()).await;
    controller.stop();
    finish(run).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(controller.num_requeues("p"), 0);
}

// ---------------------------------------------------------------------------
// Startup gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn workers_wait_for_cache_sync() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = handler_fn({
        let calls = Arc::clone(&calls);
        move |_event: Event, _object: Option<String>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        }
    });
    let cache = Arc::new(MemoryCache::new());
    cache.insert("a", "obj-a".to_string());
    let controller = Arc::new(Controller::new(
        fast_config(2, 5),
        Arc::clone(&cache),
        ScriptedSource::new(vec![Event::add("a")]),
        handler,
    ));

    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run().await }
    });

    eventually("syncing state", || controller.state() == ControllerState::Syncing).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(controller.state(), ControllerState::Syncing);

    cache.mark_synced();
    let state = timeout(
        Duration::from_secs(5),
        controller.wait_for_state(ControllerState::Running),
    )
    .await
    .unwrap();
    assert_eq!(state, ControllerState::Running);
    eventually("handler call", || calls.load(Ordering::SeqCst) == 1).await;

    controller.stop();
    finish(run).await.unwrap();
}

#[tokio::test]
async fn stop_before_sync_aborts_with_sync_timeout() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = handler_fn({
        let calls = Arc::clone(&calls);
        move |_event: Event, _object: Option<String>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        }
    });
    let (reporter, reported) = collecting_reporter();
    let cache: Arc<MemoryCache<String>> = Arc::new(MemoryCache::new());
    let controller = Arc::new(
        Controller::new(
            fast_config(2, 5),
            cache,
            ScriptedSource::new(vec![Event::delete("a")]),
            handler,
        )
        .with_reporter(reporter),
    );

    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run().await }
    });

    eventually("syncing state", || controller.state() == ControllerState::Syncing).await;
    controller.stop();
    let result = finish(run).await;

    assert!(matches!(result, Err(Error::SyncTimeout)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(controller.state(), ControllerState::Stopped);
    let reported = reported.lock().unwrap();
    assert_eq!(reported.len(), 1);
    assert!(reported[0].starts_with("sync_timeout"));
}

#[tokio::test]
async fn configured_sync_timeout_fails_startup() {
    let handler = handler_fn(|_event: Event, _object: Option<String>| async {
        Ok::<(), BoxError>(())
    });
    let mut config = fast_config(1, 5);
    config.sync_timeout = Some(Duration::from_millis(30));
    let cache: Arc<MemoryCache<String>> = Arc::new(MemoryCache::new());
    let controller = Controller::new(config, cache, ScriptedSource::new(vec![]), handler);

    let result = timeout(Duration::from_secs(5), controller.run())
        .await
        .expect("sync timeout did not fire");

    assert!(matches!(result, Err(Error::SyncTimeout)));
    assert_eq!(controller.state(), ControllerState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_before_run_starts_no_workers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = handler_fn({
        let calls = Arc::clone(&calls);
        move |_event: Event, _object: Option<String>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        }
    });
    let events = (0..20).map(|i| Event::update(format!("k{i}"))).collect();
    let controller = Controller::new(
        fast_config(4, 5),
        CountingCache::synced_with(&[("k0", "v")]),
        ScriptedSource::new(events),
        handler,
    );

    controller.stop();
    let result = timeout(Duration::from_secs(5), controller.run())
        .await
        .expect("controller did not stop");

    assert!(result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(controller.state(), ControllerState::Stopped);
}

#[tokio::test]
async fn unbounded_sync_timeout_still_starts() {
    let handler = handler_fn(|_event: Event, _object: Option<String>| async {
        Ok::<(), BoxError>(())
    });
    let mut config = fast_config(1, 5);
    config.sync_timeout = Some(Duration::MAX);
    let controller = Arc::new(Controller::new(
        config,
        CountingCache::synced_with(&[]),
        ScriptedSource::new(vec![]),
        handler,
    ));

    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run().await }
    });
    let state = timeout(
        Duration::from_secs(5),
        controller.wait_for_state(ControllerState::Running),
    )
    .await
    .unwrap();
    assert_eq!(state, ControllerState::Running);
    assert_eq!(controller.config().sync_timeout, Some(Duration::MAX));

    controller.stop();
    finish(run).await.unwrap();
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_run_is_rejected() {
    let handler = handler_fn(|_event: Event, _object: Option<String>| async {
        Ok::<(), BoxError>(())
    });
    let controller = Arc::new(Controller::new(
        fast_config(1, 5),
        CountingCache::synced_with(&[]),
        ScriptedSource::new(vec![]),
        handler,
    ));

    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run().await }
    });
    timeout(
        Duration::from_secs(5),
        controller.wait_for_state(ControllerState::Running),
    )
    .await
    .unwrap();

    let second = controller.run().await;
    assert!(matches!(
        second,
        Err(Error::InvalidTransition {
            from: ControllerState::Running,
            to: ControllerState::Syncing,
        })
    ));

    controller.stop();
    controller.stop();
    finish(run).await.unwrap();

    let after_stop = controller.run().await;
    assert!(matches!(after_stop, Err(Error::InvalidTransition { .. })));
}

#[tokio::test]
async fn zero_threadiness_is_rejected() {
    let handler = handler_fn(|_event: Event, _object: Option<String>| async {
        Ok::<(), BoxError>(())
    });
    let controller = Controller::new(
        fast_config(0, 5),
        CountingCache::synced_with(&[]),
        ScriptedSource::new(vec![]),
        handler,
    );

    assert!(matches!(controller.run().await, Err(Error::Config(_))));
    assert_eq!(controller.state(), ControllerState::Created);
}

#[tokio::test]
async fn shutdown_lets_in_flight_sync_finish_and_starts_nothing_new() {
    let started = Arc::new(Mutex::new(Vec::<String>::new()));
    let slow_finished = Arc::new(AtomicBool::new(false));
    let handler = handler_fn({
        let started = Arc::clone(&started);
        let slow_finished = Arc::clone(&slow_finished);
        move |event: Event, _object: Option<String>| {
            let started = Arc::clone(&started);
            let slow_finished = Arc::clone(&slow_finished);
            async move {
                started.lock().unwrap().push(event.key.clone());
                if event.key == "slow" {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    slow_finished.store(true, Ordering::SeqCst);
                }
                Ok::<(), BoxError>(())
            }
        }
    });
    let cache = CountingCache::synced_with(&[("slow", "s"), ("next-1", "n"), ("next-2", "n")]);
    let controller = Arc::new(Controller::new(
        fast_config(1, 5),
        cache,
        ScriptedSource::new(vec![
            Event::update("slow"),
            Event::update("next-1"),
            Event::update("next-2"),
        ]),
        handler,
    ));

    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run().await }
    });

    eventually("slow sync to start", || {
        started.lock().unwrap().iter().any(|k| k == "slow")
    })
    .await;
    controller.stop();
    finish(run).await.unwrap();

    assert!(slow_finished.load(Ordering::SeqCst));
    assert_eq!(started.lock().unwrap().as_slice(), ["slow"]);
    assert_eq!(controller.state(), ControllerState::Stopped);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

/// Sends bursts of updates for a few keys with pauses in between.
struct BurstySource {
    keys: usize,
    rounds: usize,
}

impl EventSource for BurstySource {
    fn run(self, sink: EventSink, stop: StopSignal) -> impl Future<Output = ()> + Send {
        async move {
            for round in 0..self.rounds {
                for k in 0..self.keys {
                    sink.send(Event::update(format!("key-{k}")));
                }
                if round % 5 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
            stop.stopped().await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_key_is_never_synced_concurrently() {
    const KEYS: usize = 4;

    let active = Arc::new(Mutex::new(HashSet::<String>::new()));
    let overlap = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = handler_fn({
        let active = Arc::clone(&active);
        let overlap = Arc::clone(&overlap);
        let calls = Arc::clone(&calls);
        move |event: Event, _object: Option<String>| {
            let active = Arc::clone(&active);
            let overlap = Arc::clone(&overlap);
            let calls = Arc::clone(&calls);
            async move {
                if !active.lock().unwrap().insert(event.key.clone()) {
                    overlap.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                active.lock().unwrap().remove(&event.key);
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        }
    });
    let entries: Vec<(String, String)> = (0..KEYS)
        .map(|k| (format!("key-{k}"), "obj".to_string()))
        .collect();
    let cache = MemoryCache::synced();
    for (key, object) in entries {
        cache.insert(key, object);
    }
    let controller = Arc::new(Controller::new(
        fast_config(8, 5),
        Arc::new(cache),
        BurstySource {
            keys: KEYS,
            rounds: 50,
        },
        handler,
    ));

    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run().await }
    });

    eventually("some syncs", || calls.load(Ordering::SeqCst) >= KEYS).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    eventually("idle queue", || controller.is_idle()).await;
    controller.stop();
    finish(run).await.unwrap();

    assert!(!overlap.load(Ordering::SeqCst), "a key was synced concurrently");
}

#[tokio::test]
async fn two_controllers_run_side_by_side() {
    fn counting(calls: &Arc<AtomicUsize>) -> impl reconciler::Handler<String> {
        let calls = Arc::clone(calls);
        handler_fn(move |_event: Event, _object: Option<String>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        })
    }

    let first_calls = Arc::new(AtomicUsize::new(0));
    let second_calls = Arc::new(AtomicUsize::new(0));
    let first = Arc::new(Controller::new(
        fast_config(1, 5),
        CountingCache::synced_with(&[("a", "1")]),
        ScriptedSource::new(vec![Event::add("a")]),
        counting(&first_calls),
    ));
    let second = Arc::new(Controller::new(
        fast_config(1, 5),
        CountingCache::synced_with(&[("a", "2"), ("b", "2")]),
        ScriptedSource::new(vec![Event::add("a"), Event::add("b")]),
        counting(&second_calls),
    ));
    assert_ne!(first.id(), second.id());

    let runs: Vec<_> = [Arc::clone(&first), Arc::clone(&second)]
        .into_iter()
        .map(|controller| tokio::spawn(async move { controller.run().await }))
        .collect();

    eventually("first handler", || first_calls.load(Ordering::SeqCst) == 1).await;
    eventually("second handler", || second_calls.load(Ordering::SeqCst) == 2).await;

    first.stop();
    let first_state = timeout(
        Duration::from_secs(5),
        first.wait_for_state(ControllerState::Stopped),
    )
    .await
    .unwrap();
    assert_eq!(first_state, ControllerState::Stopped);
    assert_eq!(second.state(), ControllerState::Running);
    second.stop();
    for run in runs {
        finish(run).await.unwrap();
    }
}

// ---------------------------------------------------------------------------
// Channel-backed source
// ---------------------------------------------------------------------------

#[tokio::test]
async fn channel_source_keeps_cache_ahead_of_events() {
    let seen = Arc::new(Mutex::new(Vec::<(Action, Option<String>)>::new()));
    let handler = handler_fn({
        let seen = Arc::clone(&seen);
        move |event: Event, object: Option<String>| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push((event.action, object));
                Ok::<(), BoxError>(())
            }
        }
    });
    let cache = Arc::new(MemoryCache::new());
    let (tx, rx) = mpsc::channel(8);
    let source = ChannelSource::new(Arc::clone(&cache), rx)
        .with_initial(vec![Change::upsert("a", "v1".to_string())]);
    let controller = Arc::new(Controller::new(fast_config(1, 5), cache, source, handler));

    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run().await }
    });

    eventually("initial add", || seen.lock().unwrap().len() == 1).await;
    tx.send(Change::upsert("a", "v2".to_string())).await.unwrap();
    eventually("update", || seen.lock().unwrap().len() == 2).await;
    tx.send(Change::delete("a")).await.unwrap();
    eventually("delete", || seen.lock().unwrap().len() == 3).await;

    controller.stop();
    finish(run).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        seen.as_slice(),
        [
            (Action::Add, Some("v1".to_string())),
            (Action::Update, Some("v2".to_string())),
            (Action::Delete, None),
        ]
    );
}
