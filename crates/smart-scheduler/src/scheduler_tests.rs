use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use market_core::MarketError;
use tokio_util::sync::CancellationToken;

use crate::events::{EventKind, SchedulerEvent};
use crate::scheduler::{SchedulerConfig, SmartScheduler};
use crate::task::{TaskHandler, TaskType};

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        dispatch_interval: Duration::from_millis(10),
        adjust_interval: Duration::from_secs(3_600),
        cache_warmup_interval: Duration::from_secs(3_600),
        data_cleanup_interval: Duration::from_secs(3_600),
        performance_update_interval: Duration::from_secs(3_600),
        ..SchedulerConfig::default()
    }
}

/// Records the `p` field of each payload it sees, optionally holding the
/// worker slot for a while.
struct Recorder {
    seen: Arc<Mutex<Vec<i64>>>,
    hold: Duration,
}

#[async_trait]
impl TaskHandler for Recorder {
    async fn handle(
        &self,
        payload: &serde_json::Value,
        _token: &CancellationToken,
    ) -> Result<(), MarketError> {
        self.seen
            .lock()
            .unwrap()
            .push(payload["p"].as_i64().unwrap_or(-1));
        tokio::time::sleep(self.hold).await;
        Ok(())
    }
}

async fn wait_until(mut probe: impl FnMut() -> bool, budget: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    probe()
}

// S4: priorities [3, 9, 5] with one worker slot start as [9, 5, 3].
#[tokio::test]
async fn priorities_dispatch_highest_first() {
    let mut config = fast_config();
    config.max_concurrent_tasks = 1;
    let root = CancellationToken::new();
    let scheduler = SmartScheduler::new(config, &root);

    let seen = Arc::new(Mutex::new(Vec::new()));
    for priority in [3u8, 9, 5] {
        let handler = Arc::new(Recorder {
            seen: seen.clone(),
            hold: Duration::from_millis(30),
        });
        scheduler
            .submit(
                TaskType::Backtest,
                priority,
                serde_json::json!({ "p": priority }),
                handler,
            )
            .unwrap();
    }

    scheduler.start();
    assert!(
        wait_until(|| seen.lock().unwrap().len() == 3, Duration::from_secs(5)).await,
        "tasks did not all run"
    );
    assert_eq!(*seen.lock().unwrap(), vec![9, 5, 3]);
    scheduler.stop();
}

#[tokio::test]
async fn equal_priorities_run_fifo() {
    let mut config = fast_config();
    config.max_concurrent_tasks = 1;
    let root = CancellationToken::new();
    let scheduler = SmartScheduler::new(config, &root);

    let seen = Arc::new(Mutex::new(Vec::new()));
    for marker in [1i64, 2, 3, 4] {
        let handler = Arc::new(Recorder {
            seen: seen.clone(),
            hold: Duration::from_millis(10),
        });
        scheduler
            .submit(
                TaskType::DataFetch,
                5,
                serde_json::json!({ "p": marker }),
                handler,
            )
            .unwrap();
    }

    scheduler.start();
    assert!(wait_until(|| seen.lock().unwrap().len() == 4, Duration::from_secs(5)).await);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
    scheduler.stop();
}

// Property 8: the k-th retry waits at least 2^(k-1) seconds.
#[tokio::test(start_paused = true)]
async fn retries_back_off_exponentially_at_lower_priority() {
    let root = CancellationToken::new();
    let scheduler = SmartScheduler::new(fast_config(), &root);

    let attempts: Arc<Mutex<Vec<tokio::time::Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let outcome: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

    struct FailTwice {
        attempts: Arc<Mutex<Vec<tokio::time::Instant>>>,
        counter: AtomicU32,
        outcome: Arc<Mutex<Vec<i64>>>,
    }

    #[async_trait]
    impl TaskHandler for FailTwice {
        async fn handle(
            &self,
            _payload: &serde_json::Value,
            _token: &CancellationToken,
        ) -> Result<(), MarketError> {
            self.attempts.lock().unwrap().push(tokio::time::Instant::now());
            let attempt = self.counter.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Err(MarketError::UpstreamUnavailable("flaky".into()))
            } else {
                self.outcome.lock().unwrap().push(1);
                Ok(())
            }
        }
    }

    let handler = Arc::new(FailTwice {
        attempts: attempts.clone(),
        counter: AtomicU32::new(0),
        outcome: outcome.clone(),
    });

    scheduler.start();
    scheduler
        .submit(TaskType::DataFetch, 8, serde_json::json!({}), handler)
        .unwrap();

    assert!(
        wait_until(|| outcome.lock().unwrap().len() == 1, Duration::from_secs(120)).await,
        "task never succeeded"
    );

    let times = attempts.lock().unwrap().clone();
    assert_eq!(times.len(), 3);
    assert!(times[1] - times[0] >= Duration::from_secs(1));
    assert!(times[2] - times[1] >= Duration::from_secs(2));
    scheduler.stop();
}

#[tokio::test]
async fn exhausted_retries_emit_task_failed() {
    let mut config = fast_config();
    config.default_max_retries = 0;
    let root = CancellationToken::new();
    let scheduler = SmartScheduler::new(config, &root);

    struct AlwaysFails;
    #[async_trait]
    impl TaskHandler for AlwaysFails {
        async fn handle(
            &self,
            _payload: &serde_json::Value,
            _token: &CancellationToken,
        ) -> Result<(), MarketError> {
            Err(MarketError::Internal("nope".into()))
        }
    }

    let failed = Arc::new(Mutex::new(Vec::new()));
    let failed_sink = failed.clone();
    scheduler.on_event(
        EventKind::TaskFailed,
        Arc::new(move |event| {
            if let SchedulerEvent::TaskFailed { id, .. } = event {
                failed_sink.lock().unwrap().push(id);
            }
        }),
    );

    scheduler.start();
    let id = scheduler
        .submit(TaskType::Backtest, 5, serde_json::json!({}), Arc::new(AlwaysFails))
        .unwrap();

    assert!(wait_until(|| !failed.lock().unwrap().is_empty(), Duration::from_secs(5)).await);
    assert_eq!(failed.lock().unwrap()[0], id);

    let stats = scheduler.stats();
    assert_eq!(stats.per_type[&TaskType::Backtest].failed, 1);
    assert_eq!(
        stats.per_type[&TaskType::Backtest].last_error.as_deref(),
        Some("Internal error: nope")
    );
    scheduler.stop();
}

#[tokio::test]
async fn expired_tasks_are_dropped_not_run() {
    let mut config = fast_config();
    config.default_deadline = Duration::from_millis(30);
    let root = CancellationToken::new();
    let scheduler = SmartScheduler::new(config, &root);

    let expired = Arc::new(Mutex::new(Vec::new()));
    let expired_sink = expired.clone();
    scheduler.on_event(
        EventKind::TaskExpired,
        Arc::new(move |event| {
            if let SchedulerEvent::TaskExpired { id, .. } = event {
                expired_sink.lock().unwrap().push(id);
            }
        }),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(Recorder {
        seen: seen.clone(),
        hold: Duration::ZERO,
    });

    // Enqueue before starting, then let the deadline lapse.
    let id = scheduler
        .submit(TaskType::CacheWarmup, 5, serde_json::json!({"p": 1}), handler)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    scheduler.start();

    assert!(wait_until(|| !expired.lock().unwrap().is_empty(), Duration::from_secs(5)).await);
    assert_eq!(expired.lock().unwrap()[0], id);
    assert!(seen.lock().unwrap().is_empty());
    scheduler.stop();
}

#[tokio::test]
async fn lifecycle_events_flow_through_the_bus() {
    let root = CancellationToken::new();
    let scheduler = SmartScheduler::new(fast_config(), &root);

    let kinds = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        EventKind::TaskScheduled,
        EventKind::TaskStarted,
        EventKind::TaskCompleted,
    ] {
        let sink = kinds.clone();
        scheduler.on_event(
            kind,
            Arc::new(move |event| {
                sink.lock().unwrap().push(event.kind());
            }),
        );
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    scheduler.start();
    scheduler
        .submit(
            TaskType::Recommendation,
            5,
            serde_json::json!({"p": 1}),
            Arc::new(Recorder {
                seen: seen.clone(),
                hold: Duration::ZERO,
            }),
        )
        .unwrap();

    assert!(
        wait_until(|| kinds.lock().unwrap().len() >= 3, Duration::from_secs(5)).await,
        "expected scheduled/started/completed events"
    );
    let observed = kinds.lock().unwrap().clone();
    assert!(observed.contains(&EventKind::TaskScheduled));
    assert!(observed.contains(&EventKind::TaskStarted));
    assert!(observed.contains(&EventKind::TaskCompleted));
    scheduler.stop();
}

#[tokio::test]
async fn delayed_submission_waits_then_runs() {
    let root = CancellationToken::new();
    let scheduler = SmartScheduler::new(fast_config(), &root);

    let delayed_events = Arc::new(Mutex::new(Vec::new()));
    let sink = delayed_events.clone();
    scheduler.on_event(
        EventKind::TaskScheduledDelayed,
        Arc::new(move |event| {
            sink.lock().unwrap().push(event.kind());
        }),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    scheduler.start();
    scheduler.submit_delayed(
        TaskType::DataCleanup,
        5,
        serde_json::json!({"p": 7}),
        Arc::new(Recorder {
            seen: seen.clone(),
            hold: Duration::ZERO,
        }),
        Duration::from_millis(30),
    );

    assert!(wait_until(|| seen.lock().unwrap().len() == 1, Duration::from_secs(5)).await);
    assert_eq!(delayed_events.lock().unwrap().len(), 1);
    scheduler.stop();
}

#[tokio::test]
async fn full_queue_rejects_submissions() {
    let mut config = fast_config();
    config.queue_capacity = 1;
    let root = CancellationToken::new();
    let scheduler = SmartScheduler::new(config, &root);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = || {
        Arc::new(Recorder {
            seen: seen.clone(),
            hold: Duration::ZERO,
        })
    };

    // Not started: nothing drains the channel.
    scheduler
        .submit(TaskType::Backtest, 5, serde_json::json!({"p": 1}), handler())
        .unwrap();
    let second = scheduler.submit(TaskType::Backtest, 5, serde_json::json!({"p": 2}), handler());
    assert!(matches!(second, Err(MarketError::Internal(_))));
}

#[tokio::test]
async fn periodic_handlers_fire_on_their_timer() {
    let mut config = fast_config();
    config.cache_warmup_interval = Duration::from_millis(25);
    let root = CancellationToken::new();
    let scheduler = SmartScheduler::new(config, &root);

    let seen = Arc::new(Mutex::new(Vec::new()));
    scheduler.set_periodic_handler(
        TaskType::CacheWarmup,
        Arc::new(Recorder {
            seen: seen.clone(),
            hold: Duration::ZERO,
        }),
    );

    scheduler.start();
    assert!(
        wait_until(|| seen.lock().unwrap().len() >= 2, Duration::from_secs(5)).await,
        "periodic task should have fired repeatedly"
    );
    scheduler.stop();
}

#[tokio::test]
async fn stop_cancels_running_tasks_without_completion_events() {
    let root = CancellationToken::new();
    let scheduler = SmartScheduler::new(fast_config(), &root);

    let completed = Arc::new(Mutex::new(Vec::new()));
    let sink = completed.clone();
    scheduler.on_event(
        EventKind::TaskCompleted,
        Arc::new(move |event| {
            sink.lock().unwrap().push(event.kind());
        }),
    );

    struct WaitsForCancel {
        started: Arc<Mutex<Vec<i64>>>,
    }
    #[async_trait]
    impl TaskHandler for WaitsForCancel {
        async fn handle(
            &self,
            _payload: &serde_json::Value,
            token: &CancellationToken,
        ) -> Result<(), MarketError> {
            self.started.lock().unwrap().push(1);
            token.cancelled().await;
            Err(MarketError::Cancelled)
        }
    }

    let started = Arc::new(Mutex::new(Vec::new()));
    scheduler.start();
    scheduler
        .submit(
            TaskType::Backtest,
            9,
            serde_json::json!({}),
            Arc::new(WaitsForCancel {
                started: started.clone(),
            }),
        )
        .unwrap();

    assert!(wait_until(|| !started.lock().unwrap().is_empty(), Duration::from_secs(5)).await);
    scheduler.stop();

    assert!(
        wait_until(|| scheduler.stats().running == 0, Duration::from_secs(5)).await,
        "running tasks should drain after stop"
    );
    assert!(completed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn adjustment_grows_an_idle_pool_and_shortens_the_cadence() {
    let mut config = fast_config();
    config.adjust_interval = Duration::from_millis(20);
    config.performance_update_interval = Duration::from_secs(300);
    let root = CancellationToken::new();
    let scheduler = SmartScheduler::new(config, &root);

    scheduler.start();
    assert!(
        wait_until(
            || scheduler.stats().pool_size > 10
                && scheduler.performance_update_interval() < Duration::from_secs(300),
            Duration::from_secs(5)
        )
        .await,
        "idle load should grow the pool and shorten the interval"
    );
    scheduler.stop();
}
