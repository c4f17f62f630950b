//! Pooled SSH transport sessions, keyed by remote identity.
//!
//! Establishing an authenticated session costs round-trips, so sessions are
//! reused across jobs targeting the same identity. Checkouts are exclusive:
//! a transport handed to a worker is not shared until it is released. The
//! per-identity cap bounds concurrent sessions against a single host while
//! leaving distinct identities free to proceed in parallel.
//!
//! Idle sessions are closed by a periodic sweep once they outlive the idle
//! timeout, and a checkout that cannot get a slot within the acquire
//! timeout fails with a retryable error instead of hanging.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::paste::client::{Transport, TransportFactory};
use crate::paste::config::{EngineConfig, SWEEP_INTERVAL};
use crate::paste::error::TransferError;
use crate::paste::types::{ConnectionIdentity, RemoteTarget};

struct IdleTransport {
    transport: Box<dyn Transport>,
    last_used: Instant,
}

/// Checkout slots and parked sessions for one identity.
struct IdentitySlots {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleTransport>>,
}

/// An exclusively checked-out transport.
///
/// The slot permit travels with the connection: releasing or discarding it
/// (or just dropping it on an error path) frees the slot, so a cancelled
/// worker can never leave a checkout stranded.
pub struct PooledConnection {
    transport: Box<dyn Transport>,
    identity: ConnectionIdentity,
    permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }
}

/// Reusable authenticated sessions with per-identity concurrency caps.
pub struct ConnectionPool {
    factory: Arc<dyn TransportFactory>,
    per_identity_limit: usize,
    acquire_timeout: std::time::Duration,
    idle_timeout: std::time::Duration,
    slots: DashMap<ConnectionIdentity, Arc<IdentitySlots>>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn TransportFactory>, config: &EngineConfig) -> Self {
        Self {
            factory,
            per_identity_limit: config.per_identity_limit,
            acquire_timeout: config.acquire_timeout(),
            idle_timeout: config.idle_timeout(),
            slots: DashMap::new(),
        }
    }

    /// Check out a transport for `target`, reusing an idle session when one
    /// is fresh enough and connecting otherwise.
    ///
    /// Blocks while the identity is at its concurrency cap, up to the
    /// acquire timeout; timing out is a retryable failure.
    pub async fn acquire(&self, target: &RemoteTarget) -> Result<PooledConnection, TransferError> {
        let identity = target.identity.clone();
        let slots = self
            .slots
            .entry(identity.clone())
            .or_insert_with(|| {
                Arc::new(IdentitySlots {
                    semaphore: Arc::new(Semaphore::new(self.per_identity_limit)),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone();

        let permit =
            tokio::time::timeout(self.acquire_timeout, slots.semaphore.clone().acquire_owned())
                .await
                .map_err(|_| {
                    TransferError::Timeout(format!(
                        "No free connection slot for {} within {:?}",
                        identity, self.acquire_timeout
                    ))
                })?
                .map_err(|_| TransferError::Cancelled)?;

        // Newest idle session first; anything past the idle window is
        // closed rather than reused.
        let (reused, stale) = {
            let mut idle = slots.idle.lock().await;
            let mut stale = Vec::new();
            let mut reused = None;
            while let Some(entry) = idle.pop() {
                if entry.last_used.elapsed() < self.idle_timeout {
                    reused = Some(entry.transport);
                    break;
                }
                stale.push(entry.transport);
            }
            (reused, stale)
        };
        for mut transport in stale {
            transport.close().await;
        }

        let transport = match reused {
            Some(transport) => {
                trace!(identity = %identity, "Reusing idle transfer session");
                transport
            }
            // On connect failure the permit drops with this frame, freeing
            // the slot for the retry.
            None => self.factory.connect(target).await?,
        };

        Ok(PooledConnection {
            transport,
            identity,
            permit,
        })
    }

    /// Return a healthy connection to the pool for reuse.
    pub async fn release(&self, conn: PooledConnection) {
        let PooledConnection {
            transport,
            identity,
            permit,
        } = conn;

        if let Some(slots) = self.slots.get(&identity).map(|entry| entry.value().clone()) {
            slots.idle.lock().await.push(IdleTransport {
                transport,
                last_used: Instant::now(),
            });
        }
        // Freeing the slot after parking the session lets the next waiter
        // find it idle.
        drop(permit);
    }

    /// Close a connection instead of returning it. Used after I/O errors,
    /// when the session's health is unknown.
    pub async fn discard(&self, conn: PooledConnection) {
        let PooledConnection {
            mut transport,
            identity,
            permit,
        } = conn;
        debug!(identity = %identity, "Discarding transfer session after failure");
        transport.close().await;
        drop(permit);
    }

    /// Close idle sessions older than the idle timeout.
    pub async fn sweep_idle(&self) {
        let all: Vec<Arc<IdentitySlots>> = self
            .slots
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for slots in all {
            let expired = {
                let mut idle = slots.idle.lock().await;
                let mut kept = Vec::new();
                let mut expired = Vec::new();
                for entry in idle.drain(..) {
                    if entry.last_used.elapsed() < self.idle_timeout {
                        kept.push(entry);
                    } else {
                        expired.push(entry.transport);
                    }
                }
                *idle = kept;
                expired
            };
            for mut transport in expired {
                transport.close().await;
            }
        }
    }

    /// Close every parked session. Called on engine shutdown; checked-out
    /// connections are closed by their owning workers.
    pub async fn close_all(&self) {
        let all: Vec<Arc<IdentitySlots>> = self
            .slots
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for slots in all {
            let parked: Vec<Box<dyn Transport>> = {
                let mut idle = slots.idle.lock().await;
                idle.drain(..).map(|entry| entry.transport).collect()
            };
            for mut transport in parked {
                transport.close().await;
            }
        }
    }

    /// Run the idle sweep on an interval until the token fires.
    pub fn spawn_sweeper(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let pool = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => pool.sweep_idle().await,
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) async fn idle_count(&self, identity: &ConnectionIdentity) -> usize {
        match self.slots.get(identity) {
            Some(slots) => slots.idle.lock().await.len(),
            None => 0,
        }
    }
}
