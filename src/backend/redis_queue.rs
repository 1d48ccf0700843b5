//! Redis-backed queue statistics.
//!
//! Reads queues laid out as Redis lists, the layout used by list-based
//! worker queues (LPUSH to enqueue, BRPOPLPUSH to dequeue):
//!
//! - `{queue}`: waiting jobs, newest on the left, oldest on the right
//! - `{queue}:stats`: hash with `completed`, `failed`, `jobs_per_minute`
//! - `{queue}:delayed`: sorted set of job ids scored by their due time (ms)
//!
//! Each waiting job is a JSON document carrying a `created_at` RFC 3339
//! timestamp; the age of the rightmost entry is the queue latency. Moving
//! due entries out of `{queue}:delayed` is the broker's job.

use std::sync::Arc;

use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{QueueBackend, QueueStats};
use crate::clock::{system_clock, Clock};
use crate::error::MonitoringFault;

/// Queue backend reading list-based Redis queues.
pub struct RedisQueueBackend {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    clock: Arc<dyn Clock>,
}

impl RedisQueueBackend {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns a `MonitoringFault` (with an empty queue name) if the
    /// connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, MonitoringFault> {
        let client = ::redis::Client::open(redis_url)
            .map_err(|e| MonitoringFault::new("", format!("Redis connection failed: {}", e)))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| MonitoringFault::new("", format!("Redis connection failed: {}", e)))?;

        Ok(Self::from_connection(redis))
    }

    /// Creates a backend from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            clock: system_clock(),
        }
    }

    fn stats_key(queue: &str) -> String {
        format!("{}:stats", queue)
    }

    fn delayed_key(queue: &str) -> String {
        format!("{}:delayed", queue)
    }
}

/// Age in milliseconds of a serialized job, from its `created_at` field.
///
/// Jobs without a parseable timestamp count as brand new.
pub(crate) fn job_age_ms(job_json: &str, now: DateTime<Utc>) -> u64 {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(job_json) else {
        return 0;
    };
    value
        .get("created_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|created| (now - created.with_timezone(&Utc)).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}

/// Failed / (completed + failed), or 0 when nothing finished yet.
pub(crate) fn error_rate(completed: u64, failed: u64) -> f64 {
    let total = completed.saturating_add(failed);
    if total == 0 {
        0.0
    } else {
        failed as f64 / total as f64
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn get_queue_snapshot(&self, queue: &str) -> Result<QueueStats, MonitoringFault> {
        let mut conn = self.redis.clone();

        let (depth, oldest, (completed, failed, jobs_per_minute)): (
            u64,
            Option<String>,
            (Option<u64>, Option<u64>, Option<f64>),
        ) = ::redis::pipe()
            .llen(queue)
            .lindex(queue, -1)
            .cmd("HMGET")
            .arg(Self::stats_key(queue))
            .arg("completed")
            .arg("failed")
            .arg("jobs_per_minute")
            .query_async(&mut conn)
            .await
            .map_err(|e| MonitoringFault::new(queue, e.to_string()))?;

        let latency_ms = oldest
            .as_deref()
            .map(|job| job_age_ms(job, self.clock.now()))
            .unwrap_or(0);

        let stats = QueueStats {
            depth,
            latency_ms,
            error_rate: error_rate(completed.unwrap_or(0), failed.unwrap_or(0)),
            jobs_per_minute: jobs_per_minute.unwrap_or(0.0),
        };
        debug!(queue, depth, latency_ms, "Fetched Redis queue snapshot");

        Ok(stats)
    }

    async fn requeue_with_delay(
        &self,
        queue: &str,
        job_id: &str,
        delay_ms: u64,
    ) -> Result<(), MonitoringFault> {
        let mut conn = self.redis.clone();
        let due_ms = self.clock.now_ms().saturating_add(delay_ms);

        conn.zadd::<_, _, _, ()>(Self::delayed_key(queue), job_id, due_ms)
            .await
            .map_err(|e| MonitoringFault::new(queue, e.to_string()))?;

        Ok(())
    }
}
