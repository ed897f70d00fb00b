//! Lease-based named locks backed by Redis.
//!
//! Cooperating orchestrator processes that share one backing store use this
//! provider so that the device-map and usage-collection locks exclude each
//! other across processes. A lock is a key written with `SET NX PX`; the
//! value is a per-acquisition token so that only the holder can delete it.
//! The lease TTL bounds how long a crashed holder can block others; a live
//! holder keeps extending it until the guard is dropped.

use crate::lock::{Held, LockError, LockGuard, LockProvider};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Deletes the key only if it still carries our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Extends the key's TTL only if it still carries our token.
const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// How often a held lease is extended; a third of its TTL.
pub fn renew_interval(lease_ttl: Duration) -> Duration {
    (lease_ttl / 3).max(Duration::from_millis(10))
}

/// Configuration for [`RedisLockProvider`].
#[derive(Debug, Clone)]
pub struct RedisLockConfig {
    /// Redis connection URL
    pub url: String,
    /// Lease time-to-live
    pub lease_ttl: Duration,
    /// Delay between acquisition attempts
    pub retry_backoff: Duration,
    /// Identifier of this orchestrator instance (logged with each lease)
    pub owner_id: String,
}

impl Default for RedisLockConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            lease_ttl: Duration::from_secs(180),
            retry_backoff: Duration::from_millis(100),
            owner_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// A held lease; released when dropped.
pub(crate) struct Lease {
    key: String,
    token: String,
    connection: ConnectionManager,
    renewal: tokio::task::JoinHandle<()>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.renewal.abort();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        let mut connection = self.connection.clone();

        // Drop cannot await; the release runs on the current runtime. If no
        // runtime is available the lease simply expires after its TTL.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let released: redis::RedisResult<i64> = redis::Script::new(RELEASE_SCRIPT)
                        .key(&key)
                        .arg(&token)
                        .invoke_async(&mut connection)
                        .await;
                    match released {
                        Ok(1) => debug!(key = %key, "Released lease"),
                        Ok(_) => warn!(key = %key, "Lease already expired or taken over"),
                        Err(e) => warn!(key = %key, error = %e, "Failed to release lease"),
                    }
                });
            }
            Err(_) => warn!(key = %key, "No runtime to release lease, waiting for TTL"),
        }
    }
}

/// Keeps extending a lease until aborted or until the key is no longer ours.
fn spawn_renewal(
    key: String,
    token: String,
    lease_ttl: Duration,
    mut connection: ConnectionManager,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let every = renew_interval(lease_ttl);
        loop {
            tokio::time::sleep(every).await;
            let renewed: redis::RedisResult<i64> = redis::Script::new(RENEW_SCRIPT)
                .key(&key)
                .arg(&token)
                .arg(lease_ttl.as_millis() as u64)
                .invoke_async(&mut connection)
                .await;
            match renewed {
                Ok(1) => debug!(key = %key, "Renewed lease"),
                Ok(_) => {
                    warn!(key = %key, "Lease lost before release, stopping renewal");
                    return;
                }
                Err(e) => warn!(key = %key, error = %e, "Failed to renew lease"),
            }
        }
    })
}

/// Lock provider shared by cooperating processes through Redis.
pub struct RedisLockProvider {
    config: RedisLockConfig,
    connection: ConnectionManager,
}

impl RedisLockProvider {
    /// Connects to Redis.
    pub async fn connect(config: RedisLockConfig) -> Result<Self, LockError> {
        let backend_err = |e: redis::RedisError| LockError::Backend {
            name: config.url.clone(),
            message: e.to_string(),
        };

        let client = redis::Client::open(config.url.as_str()).map_err(backend_err)?;
        let connection = ConnectionManager::new(client).await.map_err(backend_err)?;

        info!(url = %config.url, owner = %config.owner_id, "Connected lock backend");
        Ok(Self { config, connection })
    }

    /// Returns the Redis key used for lock `name`.
    pub fn redis_key(name: &str) -> String {
        format!("extnet:lock:{}", name)
    }

    async fn try_set(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut connection = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(self.config.lease_ttl.as_millis() as u64)
            .query_async(&mut connection)
            .await
            .map_err(|e| LockError::Backend {
                name: key.to_string(),
                message: e.to_string(),
            })?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl LockProvider for RedisLockProvider {
    async fn acquire(&self, name: &str, wait: Duration) -> Result<LockGuard, LockError> {
        let key = Self::redis_key(name);
        let token = format!("{}:{}", self.config.owner_id, uuid::Uuid::new_v4());
        let deadline = Instant::now() + wait;

        loop {
            if self.try_set(&key, &token).await? {
                debug!(lock = %name, owner = %self.config.owner_id, "Acquired lease");
                let renewal = spawn_renewal(
                    key.clone(),
                    token.clone(),
                    self.config.lease_ttl,
                    self.connection.clone(),
                );
                let lease = Lease {
                    key,
                    token,
                    connection: self.connection.clone(),
                    renewal,
                };
                return Ok(LockGuard::new(name, Held::Lease(lease)));
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(lock = %name, wait_ms = wait.as_millis() as u64, "Lease wait expired");
                return Err(LockError::Timeout {
                    name: name.to_string(),
                    waited: wait,
                });
            }
            tokio::time::sleep(self.config.retry_backoff.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_key() {
        assert_eq!(
            RedisLockProvider::redis_key("device-map-mutation"),
            "extnet:lock:device-map-mutation"
        );
    }

    #[test]
    fn test_default_config() {
        let config = RedisLockConfig::default();
        assert_eq!(config.lease_ttl, Duration::from_secs(180));
        assert!(!config.owner_id.is_empty());
    }

    #[test]
    fn test_renew_interval_is_a_third_of_ttl() {
        assert_eq!(renew_interval(Duration::from_secs(180)), Duration::from_secs(60));
        assert_eq!(renew_interval(Duration::from_millis(3)), Duration::from_millis(10));
    }
}
