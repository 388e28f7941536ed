//! Named leases: create-if-absent, stat, touch, delete

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("lease backend timed out")]
    Timeout,
}

/// Lease primitive shared by every instance trading the same account
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create the lease; `false` when it already exists
    async fn create_if_absent(&self, name: &str) -> Result<bool, LeaseError>;

    /// Last renewal time, `None` when the lease does not exist
    async fn stat(&self, name: &str) -> Result<Option<DateTime<Utc>>, LeaseError>;

    /// Set the renewal time to now
    async fn touch(&self, name: &str) -> Result<(), LeaseError>;

    /// Remove the lease; removing a missing lease is not an error
    async fn delete(&self, name: &str) -> Result<(), LeaseError>;
}

/// Leases as `<name>.lock` files, renewal time is the file mtime
pub struct FileLease {
    dir: PathBuf,
}

impl FileLease {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", name))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl LeaseStore for FileLease {
    async fn create_if_absent(&self, name: &str) -> Result<bool, LeaseError> {
        let created = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path(name))
            .await;
        match created {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, name: &str) -> Result<Option<DateTime<Utc>>, LeaseError> {
        match tokio::fs::metadata(self.path(name)).await {
            Ok(meta) => Ok(Some(DateTime::<Utc>::from(meta.modified()?))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn touch(&self, name: &str) -> Result<(), LeaseError> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.path(name))
            .await?;
        let file = file.into_std().await;
        tokio::task::spawn_blocking(move || file.set_modified(SystemTime::now()))
            .await
            .map_err(std::io::Error::other)??;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), LeaseError> {
        match tokio::fs::remove_file(self.path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local leases, for tests and single-instance runs
#[derive(Default)]
pub struct MemoryLease {
    leases: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryLease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the lease was last renewed at `at`
    pub fn set_renewed_at(&self, name: &str, at: DateTime<Utc>) {
        self.lock().insert(name.to_string(), at);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LeaseStore for MemoryLease {
    async fn create_if_absent(&self, name: &str) -> Result<bool, LeaseError> {
        let mut leases = self.lock();
        if leases.contains_key(name) {
            return Ok(false);
        }
        leases.insert(name.to_string(), Utc::now());
        Ok(true)
    }

    async fn stat(&self, name: &str) -> Result<Option<DateTime<Utc>>, LeaseError> {
        Ok(self.lock().get(name).copied())
    }

    async fn touch(&self, name: &str) -> Result<(), LeaseError> {
        if let Some(at) = self.lock().get_mut(name) {
            *at = Utc::now();
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), LeaseError> {
        self.lock().remove(name);
        Ok(())
    }
}
