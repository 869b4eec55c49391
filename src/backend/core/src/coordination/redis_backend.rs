//! Redis-backed slot counters shared by every scheduler instance.
//!
//! Key layout: `{key_prefix}slots:{job_type}` holds the number of running jobs of
//! that type across all instances. Reserve and release are Lua scripts so the
//! check-and-increment is atomic on the server.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tracing::{debug, info};

use super::{CoordinationBackend, SlotCounts};
use crate::config::CoordinationConfig;
use crate::error::{ErrorCode, ErrorContext, Result, WorkqError};

const RESERVE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current < tonumber(ARGV[1]) then
    redis.call('INCR', KEYS[1])
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current > 0 then
    return redis.call('DECR', KEYS[1])
end
return 0
"#;

/// Distributed coordination backend.
pub struct RedisBackend {
    conn: ConnectionManager,
    key_prefix: String,
    command_timeout: Duration,
    slot_ttl: Duration,
    reserve: Script,
    release: Script,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("key_prefix", &self.key_prefix)
            .field("command_timeout", &self.command_timeout)
            .field("slot_ttl", &self.slot_ttl)
            .finish()
    }
}

impl RedisBackend {
    /// Connect and verify reachability with a PING.
    pub async fn connect(config: &CoordinationConfig) -> Result<Self> {
        let url = config.redis_url.as_deref().ok_or_else(|| {
            WorkqError::invalid_config("coordination.redis_url is required for the Redis backend")
        })?;

        let client = redis::Client::open(url).with_error_code(ErrorCode::InvalidConfiguration)?;

        let mut conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await??;

        let _: String = tokio::time::timeout(
            config.connect_timeout,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await??;

        info!(key_prefix = %config.key_prefix, "Redis coordination backend connected");

        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            command_timeout: config.connect_timeout,
            slot_ttl: config.slot_ttl,
            reserve: Script::new(RESERVE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    /// Build the counter key for a type.
    pub fn slot_key(key_prefix: &str, job_type: &str) -> String {
        format!("{}slots:{}", key_prefix, job_type)
    }

    fn key(&self, job_type: &str) -> String {
        Self::slot_key(&self.key_prefix, job_type)
    }
}

#[async_trait]
impl CoordinationBackend for RedisBackend {
    async fn reserve_slot(&self, job_type: &str, max: usize) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.reserve.key(self.key(job_type));
        invocation
            .arg(max as u64)
            .arg(self.slot_ttl.as_millis() as u64);

        let reserved: i64 =
            tokio::time::timeout(self.command_timeout, invocation.invoke_async(&mut conn)).await??;

        debug!(job_type = %job_type, max, reserved = reserved == 1, "Redis slot reservation");
        Ok(reserved == 1)
    }

    async fn release_slot(&self, job_type: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let invocation = self.release.key(self.key(job_type));
        let _remaining: i64 =
            tokio::time::timeout(self.command_timeout, invocation.invoke_async(&mut conn)).await??;
        Ok(())
    }

    async fn read_counts(&self, job_type: &str) -> Result<SlotCounts> {
        let mut conn = self.conn.clone();
        let running: Option<i64> = tokio::time::timeout(
            self.command_timeout,
            redis::cmd("GET").arg(self.key(job_type)).query_async(&mut conn),
        )
        .await??;

        Ok(SlotCounts {
            running: running.unwrap_or(0).max(0) as usize,
        })
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = tokio::time::timeout(
            self.command_timeout,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await??;
        Ok(())
    }

    fn is_distributed(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_key_layout() {
        assert_eq!(RedisBackend::slot_key("workq:", "analysis"), "workq:slots:analysis");
    }

    #[tokio::test]
    async fn test_connect_requires_url() {
        let config = CoordinationConfig::default();
        let err = RedisBackend::connect(&config).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_store_fails() {
        let config = CoordinationConfig {
            redis_url: Some("redis://127.0.0.1:1".to_string()),
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        assert!(RedisBackend::connect(&config).await.is_err());
    }

    /// Needs a live server: `WORKQ_TEST_REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_reserve_and_release_against_redis() {
        let url = std::env::var("WORKQ_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let config = CoordinationConfig {
            redis_url: Some(url),
            key_prefix: format!("workq-test-{}:", uuid::Uuid::new_v4()),
            ..Default::default()
        };
        let backend = RedisBackend::connect(&config).await.unwrap();

        assert!(backend.reserve_slot("analysis", 1).await.unwrap());
        assert!(!backend.reserve_slot("analysis", 1).await.unwrap());
        assert_eq!(backend.read_counts("analysis").await.unwrap().running, 1);

        backend.release_slot("analysis").await.unwrap();
        backend.release_slot("analysis").await.unwrap();
        assert_eq!(backend.read_counts("analysis").await.unwrap().running, 0);
    }
}
