use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::MultiplexedConnection};
use tracing::{debug, info};

use crate::clients::lock::{Lease, LeaseLock, LockError};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Lease lock over `SET key token NX PX ttl`; release deletes the key only
/// while it still holds our token.
pub struct RedisLock {
    connection: MultiplexedConnection,
    release_script: Script,
}

impl RedisLock {
    pub async fn connect(redis_url: &str) -> Result<Self, Error> {
        info!("Connecting to Redis...");

        let client =
            Client::open(redis_url).map_err(|_| anyhow!("Failed to create redis client"))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|_| anyhow!("Failed to connect to redis client"))?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }
}

#[async_trait]
impl LeaseLock for RedisLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let lease = Lease::new(key, ttl);
        let mut connection = self.connection.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(&lease.key)
            .arg(&lease.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut connection)
            .await?;

        if reply.is_none() {
            debug!(key = %key, "Lock already held elsewhere");
            return Ok(None);
        }

        debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
        Ok(Some(lease))
    }

    async fn release(&self, lease: &Lease) -> Result<bool, LockError> {
        let mut connection = self.connection.clone();

        let deleted: i64 = self
            .release_script
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut connection)
            .await?;

        debug!(key = %lease.key, released = deleted == 1, "Lock release attempted");
        Ok(deleted == 1)
    }

    async fn health_check(&self) -> Result<(), LockError> {
        let mut connection = self.connection.clone();
        connection.ping::<String>().await?;
        Ok(())
    }
}
