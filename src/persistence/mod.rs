//! Redis-backed leases for instances that do not share a filesystem

use crate::node::{LeaseError, LeaseStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};

const KEY_PREFIX: &str = "cryptopump:lease:";

/// Leases as Redis string keys holding the renewal time in milliseconds
pub struct RedisLeaseStore {
    conn: ConnectionManager,
}

impl RedisLeaseStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self, LeaseError> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| LeaseError::Timeout)??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    fn key(name: &str) -> String {
        format!("{}{}", KEY_PREFIX, name)
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn create_if_absent(&self, name: &str) -> Result<bool, LeaseError> {
        let mut conn = self.conn.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(Self::key(name))
            .arg(Utc::now().timestamp_millis())
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(created.is_some())
    }

    async fn stat(&self, name: &str) -> Result<Option<DateTime<Utc>>, LeaseError> {
        let mut conn = self.conn.clone();
        let millis: Option<i64> = conn.get(Self::key(name)).await?;
        Ok(millis.and_then(DateTime::<Utc>::from_timestamp_millis))
    }

    async fn touch(&self, name: &str) -> Result<(), LeaseError> {
        let mut conn = self.conn.clone();
        // XX: renewing must not resurrect a lease another node reclaimed
        let _: Option<String> = redis::cmd("SET")
            .arg(Self::key(name))
            .arg(Utc::now().timestamp_millis())
            .arg("XX")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), LeaseError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::key(name)).await?;
        Ok(())
    }
}
