//! Master election and cycle locks over a shared lease store
//!
//! Several instances may share one exchange account. Exactly one of them
//! (the MASTER) runs the notification bot and sends fault alerts; the rest
//! are SLAVEs. The role follows a single named lease that the master
//! renews on every poll. A lease nobody renewed for
//! [`LEASE_STALE_SECS`] is treated as abandoned.

pub mod lease;

pub use lease::{FileLease, LeaseError, LeaseStore, MemoryLease};

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Unrenewed leases older than this are reclaimable
pub const LEASE_STALE_SECS: i64 = 100;

pub const MASTER_LEASE: &str = "master";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Master => "MASTER",
            Role::Slave => "SLAVE",
        })
    }
}

pub struct NodeCoordinator {
    store: Arc<dyn LeaseStore>,
    /// Testnet instances never claim the lease
    sandbox: bool,
    master: AtomicBool,
}

impl NodeCoordinator {
    pub fn new(store: Arc<dyn LeaseStore>, sandbox: bool) -> Self {
        Self {
            store,
            sandbox,
            master: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> Role {
        if self.master.load(Ordering::SeqCst) {
            Role::Master
        } else {
            Role::Slave
        }
    }

    pub fn is_master(&self) -> bool {
        self.role() == Role::Master
    }

    pub async fn poll(&self) -> Role {
        self.poll_at(Utc::now()).await
    }

    /// One election step, judged against the clock reading `now`
    pub async fn poll_at(&self, now: DateTime<Utc>) -> Role {
        if self.sandbox {
            self.master.store(false, Ordering::SeqCst);
            return Role::Slave;
        }

        if self.is_master() {
            if let Err(e) = self.store.touch(MASTER_LEASE).await {
                tracing::warn!(error = %e, "Master lease renewal failed");
            }
            return Role::Master;
        }

        let renewed_at = match self.store.stat(MASTER_LEASE).await {
            Ok(renewed_at) => renewed_at,
            Err(e) => {
                tracing::warn!(error = %e, "Master lease unreadable");
                return Role::Slave;
            }
        };

        match renewed_at {
            None => match self.store.create_if_absent(MASTER_LEASE).await {
                Ok(true) => {
                    self.master.store(true, Ordering::SeqCst);
                    tracing::info!("👑 Node role: MASTER");
                    Role::Master
                }
                Ok(false) => Role::Slave,
                Err(e) => {
                    tracing::warn!(error = %e, "Master lease creation failed");
                    Role::Slave
                }
            },
            Some(at) if now - at > Duration::seconds(LEASE_STALE_SECS) => {
                tracing::info!(renewed_at = %at, "Reclaiming abandoned master lease");
                if let Err(e) = self.store.delete(MASTER_LEASE).await {
                    tracing::warn!(error = %e, "Stale master lease not removed");
                }
                Role::Slave
            }
            Some(_) => Role::Slave,
        }
    }

    /// Give up the master lease if held
    pub async fn release(&self) {
        if !self.master.swap(false, Ordering::SeqCst) {
            return;
        }
        match self.store.delete(MASTER_LEASE).await {
            Ok(()) => tracing::info!("Master lease released"),
            Err(e) => tracing::warn!(error = %e, "Master lease release failed"),
        }
    }
}

/// Exclusive claim on a cycle id for the life of the process
///
/// Unlike the master lease, a cycle lock never goes stale: a crashed
/// instance's cycle stays locked until an operator removes the lock.
pub struct CycleLock {
    store: Arc<dyn LeaseStore>,
    thread_id: String,
}

impl CycleLock {
    /// `None` when another instance already holds the cycle
    pub async fn acquire(
        store: Arc<dyn LeaseStore>,
        thread_id: &str,
    ) -> Result<Option<Self>, LeaseError> {
        if store.create_if_absent(thread_id).await? {
            Ok(Some(Self {
                store,
                thread_id: thread_id.to_string(),
            }))
        } else {
            Ok(None)
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub async fn release(&self) -> Result<(), LeaseError> {
        self.store.delete(&self.thread_id).await
    }
}
