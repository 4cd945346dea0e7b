//! Background precomputation of cache entries.
//!
//! Tasks live in the distributed store: a bounded list is the job queue,
//! two sets (`queued`, `active`) suppress duplicates, and completed task
//! records expire after one hour. Without a distributed tier there is
//! nothing to drain, so enqueueing is a no-op.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{QueryShape, RecommendationCache, TASK_RECORD_PREFIX, TASK_RECORD_TTL_SECS};

const QUEUE_KEY: &str = "rec:precompute:queue";
const QUEUED_SET_KEY: &str = "rec:precompute:queued";
const ACTIVE_SET_KEY: &str = "rec:precompute:active";
const QUEUE_BOUND: isize = 1_000;
const IDLE_POLL: Duration = Duration::from_millis(500);

impl RecommendationCache {
    /// Schedule a shape for background materialisation. Suppressed when
    /// the same task is already queued or being worked on.
    pub(crate) async fn enqueue_precompute(&self, shape: &QueryShape) {
        let Some(mut conn) = self.redis_conn() else {
            return;
        };
        let key = shape.cache_key();

        let queued: bool = conn.sismember(QUEUED_SET_KEY, &key).await.unwrap_or(false);
        let active: bool = conn.sismember(ACTIVE_SET_KEY, &key).await.unwrap_or(false);
        if queued || active {
            return;
        }

        let payload = match serde_json::to_string(shape) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Precompute task serialisation failed: {e}");
                return;
            }
        };

        let added: i64 = conn.sadd(QUEUED_SET_KEY, &key).await.unwrap_or(0);
        if added == 0 {
            return; // raced with another enqueue
        }

        let pushed: Result<(), _> = conn.lpush(QUEUE_KEY, payload).await;
        if let Err(e) = pushed {
            tracing::warn!("Precompute enqueue failed for {key}: {e}");
            let _: Result<(), _> = conn.srem(QUEUED_SET_KEY, &key).await;
            return;
        }
        let _: Result<(), _> = conn.ltrim(QUEUE_KEY, 0, QUEUE_BOUND - 1).await;

        self.precompute_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Spawn `count` workers draining the precompute queue until the
    /// token fires. Workers run the same compute path as synchronous
    /// requests and write both cache tiers plus the task record.
    pub fn spawn_precompute_workers(
        self: &Arc<Self>,
        count: usize,
        token: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let Some(_) = self.redis_conn() else {
            tracing::info!("No distributed cache; precompute workers not started");
            return Vec::new();
        };

        (0..count.max(1))
            .map(|worker_id| {
                let cache = self.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    tracing::debug!("Precompute worker {worker_id} started");
                    loop {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            drained = cache.drain_one() => {
                                if !drained {
                                    tokio::select! {
                                        _ = token.cancelled() => break,
                                        _ = tokio::time::sleep(IDLE_POLL) => {}
                                    }
                                }
                            }
                        }
                    }
                    tracing::debug!("Precompute worker {worker_id} stopped");
                })
            })
            .collect()
    }

    /// Pop and execute one task. Returns false when the queue was empty.
    async fn drain_one(self: &Arc<Self>) -> bool {
        let Some(mut conn) = self.redis_conn() else {
            return false;
        };

        let payload: Option<String> = conn.rpop(QUEUE_KEY, None).await.unwrap_or(None);
        let Some(payload) = payload else {
            return false;
        };

        let shape: QueryShape = match serde_json::from_str(&payload) {
            Ok(shape) => shape,
            Err(e) => {
                tracing::warn!("Dropping malformed precompute task: {e}");
                return true;
            }
        };
        let key = shape.cache_key();

        let _: Result<(), _> = conn.srem(QUEUED_SET_KEY, &key).await;
        let _: Result<i64, _> = conn.sadd(ACTIVE_SET_KEY, &key).await;

        match (self.compute_fn())(shape.clone()).await {
            Ok(value) => {
                self.store(&shape, value.clone()).await;

                // Task record: lets a later miss find the completed work;
                // reaped by TTL after an hour.
                if let Ok(json) = serde_json::to_string(&value) {
                    let record_key = format!("{TASK_RECORD_PREFIX}{key}");
                    let result: Result<(), _> =
                        conn.set_ex(&record_key, json, TASK_RECORD_TTL_SECS).await;
                    if let Err(e) = result {
                        tracing::warn!("Task record write failed for {key}: {e}");
                    }
                }
            }
            Err(e) => tracing::warn!("Precompute task for {key} failed: {e}"),
        }

        let _: Result<(), _> = conn.srem(ACTIVE_SET_KEY, &key).await;
        true
    }
}
