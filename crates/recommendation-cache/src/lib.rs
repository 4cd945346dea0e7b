pub mod precompute;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use market_core::MarketError;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const LOCAL_TTL_SECS: i64 = 300; // 5 minutes
const PERSONALISED_TTL_SECS: u64 = 600; // 10 minutes
const GLOBAL_TTL_SECS: u64 = 900; // 15 minutes
const DEFAULT_LOCAL_CAPACITY: usize = 1_000;

pub(crate) const TASK_RECORD_PREFIX: &str = "rec:task:";
pub(crate) const TASK_RECORD_TTL_SECS: u64 = 3_600;

/// The canonical shape of a recommendation query. Equal shapes always map
/// to the same cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryShape {
    #[serde(default)]
    pub user_id: Option<i64>,
    pub kind: String,
    pub limit: u32,
    pub min_score: f64,
    pub time_range_hours: u32,
    pub sort_by: String,
}

impl QueryShape {
    /// Stable SHA-256 digest over the canonical field order, prefixed so
    /// per-user invalidation is a prefix scan.
    pub fn cache_key(&self) -> String {
        let canonical = format!(
            "{}|{}|{}|{:.4}|{}|{}",
            self.user_id.map_or("global".to_string(), |u| u.to_string()),
            self.kind,
            self.limit,
            self.min_score,
            self.time_range_hours,
            self.sort_by
        );
        let digest = Sha256::digest(canonical.as_bytes());
        let hash = hex::encode(&digest[..16]);

        match self.user_id {
            Some(user_id) => format!("rec:u{user_id}:{hash}"),
            None => format!("rec:g:{hash}"),
        }
    }

    /// Personalised results go stale faster than global ones.
    pub fn ttl_secs(&self) -> u64 {
        if self.user_id.is_some() {
            PERSONALISED_TTL_SECS
        } else {
            GLOBAL_TTL_SECS
        }
    }
}

/// Async computation the cache falls back to on a full miss.
pub type ComputeFn = Arc<
    dyn Fn(QueryShape) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, MarketError>> + Send>>
        + Send
        + Sync,
>;

struct LocalEntry {
    value: serde_json::Value,
    cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RecommendationCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub precompute_enqueued: u64,
}

/// Two-tier recommendation result cache.
///
/// Tier one is a bounded in-process map evicted LRU-by-timestamp; tier
/// two is an optional Redis database. A full miss computes synchronously
/// through `compute` and enqueues a precompute task so the next miss on
/// the same shape is already materialised.
pub struct RecommendationCache {
    local: DashMap<String, LocalEntry>,
    local_capacity: usize,
    redis: Option<ConnectionManager>,
    compute: ComputeFn,
    hits: AtomicU64,
    misses: AtomicU64,
    pub(crate) precompute_enqueued: AtomicU64,
}

/// Open the distributed tier. Absence is tolerated everywhere, so this
/// returns `None` (with a warning) on any failure.
pub async fn connect_redis(url: &str, db_index: u32) -> Option<ConnectionManager> {
    let full_url = if url.rsplit('/').next().is_some_and(|tail| tail.parse::<u32>().is_ok()) {
        url.to_string()
    } else {
        format!("{}/{db_index}", url.trim_end_matches('/'))
    };

    let client = match redis::Client::open(full_url) {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!("Invalid Redis URL, distributed cache disabled: {e}");
            return None;
        }
    };

    match ConnectionManager::new(client).await {
        Ok(manager) => Some(manager),
        Err(e) => {
            tracing::warn!("Redis unreachable, distributed cache disabled: {e}");
            None
        }
    }
}

impl RecommendationCache {
    pub fn new(compute: ComputeFn) -> Self {
        Self {
            local: DashMap::new(),
            local_capacity: DEFAULT_LOCAL_CAPACITY,
            redis: None,
            compute,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            precompute_enqueued: AtomicU64::new(0),
        }
    }

    pub fn with_redis(mut self, redis: Option<ConnectionManager>) -> Self {
        self.redis = redis;
        self
    }

    pub fn with_local_capacity(mut self, capacity: usize) -> Self {
        self.local_capacity = capacity.max(1);
        self
    }

    pub(crate) fn redis_conn(&self) -> Option<ConnectionManager> {
        self.redis.clone()
    }

    pub(crate) fn compute_fn(&self) -> ComputeFn {
        self.compute.clone()
    }

    /// Full lookup path: local → distributed → completed precompute task
    /// → synchronous compute (which also schedules a precompute task).
    pub async fn get_or_compute(
        self: &Arc<Self>,
        shape: &QueryShape,
    ) -> Result<serde_json::Value, MarketError> {
        let key = shape.cache_key();
        let now = Utc::now();

        if let Some(entry) = self.local.get(&key) {
            if now - entry.cached_at < Duration::seconds(LOCAL_TTL_SECS) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.value.clone());
            }
        }

        if let Some(value) = self.fetch_distributed(&key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.store_local(&key, value.clone(), now);
            return Ok(value);
        }

        if let Some(value) = self.fetch_task_record(&key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.store_local(&key, value.clone(), now);
            return Ok(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = (self.compute)(shape.clone()).await?;
        self.store(shape, value.clone()).await;
        self.enqueue_precompute(shape).await;

        Ok(value)
    }

    /// Lookup without computing; `None` is an ordinary miss.
    pub async fn peek(&self, shape: &QueryShape) -> Option<serde_json::Value> {
        let key = shape.cache_key();
        if let Some(entry) = self.local.get(&key) {
            if Utc::now() - entry.cached_at < Duration::seconds(LOCAL_TTL_SECS) {
                return Some(entry.value.clone());
            }
        }
        self.fetch_distributed(&key).await
    }

    /// Write both tiers (used by the synchronous path and the workers).
    pub(crate) async fn store(&self, shape: &QueryShape, value: serde_json::Value) {
        let key = shape.cache_key();
        self.store_local(&key, value.clone(), Utc::now());

        if let Some(mut conn) = self.redis_conn() {
            match serde_json::to_string(&value) {
                Ok(payload) => {
                    let result: Result<(), _> = conn.set_ex(&key, payload, shape.ttl_secs()).await;
                    if let Err(e) = result {
                        tracing::warn!("Distributed cache write failed for {key}: {e}");
                    }
                }
                Err(e) => tracing::warn!("Cache payload serialisation failed: {e}"),
            }
        }
    }

    fn store_local(&self, key: &str, value: serde_json::Value, now: DateTime<Utc>) {
        self.local.insert(
            key.to_string(),
            LocalEntry {
                value,
                cached_at: now,
            },
        );

        // LRU-by-timestamp bound: evict the stalest entry when over.
        while self.local.len() > self.local_capacity {
            let oldest = self
                .local
                .iter()
                .min_by_key(|e| e.value().cached_at)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.local.remove(&key);
                }
                None => break,
            }
        }
    }

    async fn fetch_distributed(&self, key: &str) -> Option<serde_json::Value> {
        let mut conn = self.redis_conn()?;
        let payload: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| tracing::debug!("Distributed cache read failed for {key}: {e}"))
            .ok()
            .flatten();
        serde_json::from_str(&payload?).ok()
    }

    async fn fetch_task_record(&self, key: &str) -> Option<serde_json::Value> {
        let mut conn = self.redis_conn()?;
        let record_key = format!("{TASK_RECORD_PREFIX}{key}");
        let payload: Option<String> = conn.get(&record_key).await.ok().flatten();
        serde_json::from_str(&payload?).ok()
    }

    /// Drop every cached result belonging to one user, in both tiers.
    pub async fn invalidate_user(&self, user_id: i64) {
        let prefix = format!("rec:u{user_id}:");
        self.local.retain(|key, _| !key.starts_with(&prefix));

        if let Some(mut conn) = self.redis_conn() {
            let pattern = format!("{prefix}*");
            let keys: Vec<String> = conn.keys(&pattern).await.unwrap_or_default();
            if !keys.is_empty() {
                let result: Result<(), _> = conn.del(keys).await;
                if let Err(e) = result {
                    tracing::warn!("Distributed invalidation failed for user {user_id}: {e}");
                }
            }
        }
    }

    /// Pre-populate a list of query shapes concurrently.
    pub async fn warmup(self: &Arc<Self>, shapes: Vec<QueryShape>) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(4));
        let mut handles = Vec::with_capacity(shapes.len());

        for shape in shapes {
            let cache = self.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                if let Err(e) = cache.get_or_compute(&shape).await {
                    tracing::warn!("Warmup failed for {}: {e}", shape.cache_key());
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn stats(&self) -> RecommendationCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        RecommendationCacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            precompute_enqueued: self.precompute_enqueued.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn shape(user_id: Option<i64>) -> QueryShape {
        QueryShape {
            user_id,
            kind: "trend".into(),
            limit: 20,
            min_score: 60.0,
            time_range_hours: 24,
            sort_by: "score".into(),
        }
    }

    fn counting_cache(counter: Arc<AtomicU32>) -> Arc<RecommendationCache> {
        let compute: ComputeFn = Arc::new(move |shape: QueryShape| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!({ "kind": shape.kind, "results": [1, 2, 3] }))
            })
        });
        Arc::new(RecommendationCache::new(compute))
    }

    #[test]
    fn equal_shapes_share_a_key_and_users_are_prefixed() {
        assert_eq!(shape(None).cache_key(), shape(None).cache_key());
        assert_ne!(shape(None).cache_key(), shape(Some(7)).cache_key());
        assert!(shape(Some(7)).cache_key().starts_with("rec:u7:"));
        assert!(shape(None).cache_key().starts_with("rec:g:"));
    }

    #[test]
    fn ttl_policy_separates_personalised_from_global() {
        assert_eq!(shape(Some(1)).ttl_secs(), 600);
        assert_eq!(shape(None).ttl_secs(), 900);
    }

    #[tokio::test]
    async fn second_lookup_is_a_local_hit() {
        let counter = Arc::new(AtomicU32::new(0));
        let cache = counting_cache(counter.clone());

        cache.get_or_compute(&shape(None)).await.unwrap();
        cache.get_or_compute(&shape(None)).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    // S6: set, invalidate the owning user, then a lookup misses.
    #[tokio::test]
    async fn user_invalidation_forces_recompute() {
        let counter = Arc::new(AtomicU32::new(0));
        let cache = counting_cache(counter.clone());
        let user_shape = shape(Some(42));

        cache.get_or_compute(&user_shape).await.unwrap();
        cache.invalidate_user(42).await;
        cache.get_or_compute(&user_shape).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidation_is_scoped_to_the_user() {
        let counter = Arc::new(AtomicU32::new(0));
        let cache = counting_cache(counter.clone());

        cache.get_or_compute(&shape(None)).await.unwrap();
        cache.get_or_compute(&shape(Some(42))).await.unwrap();
        cache.invalidate_user(42).await;

        // The global entry is untouched.
        cache.get_or_compute(&shape(None)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn local_tier_is_bounded_by_lru() {
        let counter = Arc::new(AtomicU32::new(0));
        let compute: ComputeFn = {
            let counter = counter.clone();
            Arc::new(move |_shape| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!(1))
                })
            })
        };
        let cache = Arc::new(RecommendationCache::new(compute).with_local_capacity(2));

        for user in 1..=3 {
            cache.get_or_compute(&shape(Some(user))).await.unwrap();
        }
        assert_eq!(cache.local.len(), 2);
    }

    #[tokio::test]
    async fn warmup_populates_concurrently() {
        let counter = Arc::new(AtomicU32::new(0));
        let cache = counting_cache(counter.clone());

        let shapes: Vec<QueryShape> = (1..=5).map(|u| shape(Some(u))).collect();
        cache.warmup(shapes.clone()).await;

        assert_eq!(counter.load(Ordering::SeqCst), 5);
        for s in &shapes {
            assert!(cache.peek(s).await.is_some());
        }
    }
}
