//! Connection pool - one lazily-established session per host.
//!
//! # Overview
//!
//! The pool owns at most one [`RemoteSession`] per configured host. Sessions
//! are created on first [`ConnectionPool::acquire`] and reused afterwards.
//! A session that stopped reporting ready, or that sat unused past the idle
//! window, is closed and replaced transparently.
//!
//! # Connect Coalescing
//!
//! Each host has a slot guarded by an async mutex. The first caller for an
//! unconnected host connects while holding the slot; concurrent callers for
//! the same host wait on the slot and then reuse the fresh session, so a
//! burst of requests never opens more than one connection. Different hosts
//! never contend.
//!
//! # Idle Eviction
//!
//! [`ConnectionPool::start_eviction`] runs a sweep every 60 seconds that
//! closes sessions idle for longer than the configured window. A session
//! with a live [`SessionLease`] is in use and never counts as idle, however
//! long its command runs. Slots busy with a connect or acquire are skipped
//! until the next sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{HostConfig, OutpostConfig};
use crate::error::{RemoteError, Result};
use crate::transport::{Connector, RemoteSession};

/// Upper bound for authentication and handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the idle sweep runs.
pub const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

struct PooledSession {
    session: Arc<dyn RemoteSession>,
    last_used: Arc<Mutex<Instant>>,
    /// One extra strong reference per outstanding lease.
    leases: Arc<()>,
}

impl PooledSession {
    fn new(session: Arc<dyn RemoteSession>) -> Self {
        Self {
            session,
            last_used: Arc::new(Mutex::new(Instant::now())),
            leases: Arc::new(()),
        }
    }

    fn idle_for(&self) -> Duration {
        lock(&self.last_used).elapsed()
    }

    fn in_use(&self) -> bool {
        Arc::strong_count(&self.leases) > 1
    }

    /// Unused past `window`. A leased session is never idle.
    fn is_idle(&self, window: Duration) -> bool {
        !self.in_use() && self.idle_for() > window
    }

    fn lease(&self) -> SessionLease {
        let lease = SessionLease {
            session: Arc::clone(&self.session),
            last_used: Arc::clone(&self.last_used),
            _in_use: Arc::clone(&self.leases),
        };
        lease.touch();
        lease
    }
}

/// A borrowed session handed out by the pool.
///
/// While any lease (or clone of one) is alive the pool treats the session as
/// in use and will not evict it for idleness. Call [`SessionLease::touch`]
/// after using it so the idle clock restarts from the end of the command.
#[derive(Clone)]
pub struct SessionLease {
    session: Arc<dyn RemoteSession>,
    last_used: Arc<Mutex<Instant>>,
    _in_use: Arc<()>,
}

impl SessionLease {
    pub fn session(&self) -> &Arc<dyn RemoteSession> {
        &self.session
    }

    /// Mark the session as used now.
    pub fn touch(&self) {
        *lock(&self.last_used) = Instant::now();
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<PooledSession>>>;

pub struct ConnectionPool {
    hosts: HashMap<String, HostConfig>,
    connector: Arc<dyn Connector>,
    idle_window: Duration,
    connect_timeout: Duration,
    slots: Mutex<HashMap<String, Slot>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionPool {
    pub fn new(
        hosts: HashMap<String, HostConfig>,
        connector: Arc<dyn Connector>,
        idle_window: Duration,
    ) -> Self {
        Self {
            hosts,
            connector,
            idle_window,
            connect_timeout: CONNECT_TIMEOUT,
            slots: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn from_config(config: &OutpostConfig, connector: Arc<dyn Connector>) -> Self {
        Self::new(config.hosts.clone(), connector, config.idle_timeout())
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Configured host identifiers, sorted.
    pub fn host_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.hosts.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn host_config(&self, host_id: &str) -> Option<&HostConfig> {
        self.hosts.get(host_id)
    }

    fn slot(&self, host_id: &str) -> Slot {
        let mut slots = lock(&self.slots);
        Arc::clone(slots.entry(host_id.to_string()).or_default())
    }

    fn existing_slot(&self, host_id: &str) -> Option<Slot> {
        lock(&self.slots).get(host_id).cloned()
    }

    /// Get a ready session for `host_id`, connecting if needed.
    ///
    /// # Errors
    ///
    /// - `UnknownHost` if the host is not configured
    /// - `ConnectTimeout` if the handshake exceeds the connect timeout
    /// - `TransportError` for any other connection failure
    pub async fn acquire(&self, host_id: &str) -> Result<SessionLease> {
        let host = self
            .hosts
            .get(host_id)
            .ok_or_else(|| RemoteError::UnknownHost(host_id.to_string()))?;

        let slot = self.slot(host_id);
        let mut entry = slot.lock().await;

        if let Some(pooled) = entry.as_ref() {
            if pooled.session.is_ready() && !pooled.is_idle(self.idle_window) {
                return Ok(pooled.lease());
            }
            log::debug!("Discarding stale session for {host_id}");
        }
        if let Some(stale) = entry.take() {
            stale.session.close().await;
        }

        let session =
            match tokio::time::timeout(self.connect_timeout, self.connector.connect(host_id, host))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    log::warn!("Connection to {host_id} timed out");
                    return Err(RemoteError::ConnectTimeout {
                        host: host_id.to_string(),
                        after: self.connect_timeout,
                    });
                }
            };

        let pooled = PooledSession::new(session);
        let lease = pooled.lease();
        *entry = Some(pooled);
        Ok(lease)
    }

    /// Whether a ready session for `host_id` is held right now.
    ///
    /// Never connects. A host whose slot is busy (connect in flight) reports
    /// `false`.
    pub fn is_connected(&self, host_id: &str) -> bool {
        let Some(slot) = self.existing_slot(host_id) else {
            return false;
        };
        let connected = match slot.try_lock() {
            Ok(entry) => entry
                .as_ref()
                .map(|pooled| pooled.session.is_ready())
                .unwrap_or(false),
            Err(_) => false,
        };
        connected
    }

    /// Drop the session for `host_id` so the next acquire reconnects.
    pub async fn invalidate(&self, host_id: &str) {
        let Some(slot) = self.existing_slot(host_id) else {
            return;
        };
        let pooled = slot.lock().await.take();
        if let Some(pooled) = pooled {
            log::info!("Dropping session for {host_id}");
            pooled.session.close().await;
        }
    }

    /// Close sessions unused for longer than the idle window. Sessions with
    /// a command in flight are left alone.
    ///
    /// Returns how many sessions were closed.
    pub async fn evict_idle(&self) -> usize {
        let slots: Vec<(String, Slot)> = lock(&self.slots)
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut evicted = 0;
        for (host_id, slot) in slots {
            let Ok(mut entry) = slot.try_lock() else {
                continue;
            };
            let expired = entry
                .as_ref()
                .map(|pooled| !pooled.session.is_ready() || pooled.is_idle(self.idle_window))
                .unwrap_or(false);
            if !expired {
                continue;
            }
            if let Some(pooled) = entry.take() {
                log::info!(
                    "Evicting idle session for {host_id} (idle {}s)",
                    pooled.idle_for().as_secs()
                );
                pooled.session.close().await;
                evicted += 1;
            }
        }
        evicted
    }

    /// Spawn the periodic idle sweep. Replaces any previous sweep task.
    ///
    /// The task holds a weak reference and exits once the pool is dropped.
    pub fn start_eviction(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                let evicted = pool.evict_idle().await;
                if evicted > 0 {
                    log::debug!("Idle sweep closed {evicted} session(s)");
                }
            }
        });

        if let Some(previous) = lock(&self.sweeper).replace(handle) {
            previous.abort();
        }
    }

    /// Close every session and stop the idle sweep.
    pub async fn close_all(&self) {
        if let Some(sweeper) = lock(&self.sweeper).take() {
            sweeper.abort();
        }

        let slots: Vec<Slot> = lock(&self.slots).drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            let pooled = slot.lock().await.take();
            if let Some(pooled) = pooled {
                pooled.session.close().await;
            }
        }
        log::info!("Connection pool closed");
    }
}

// ============================================================================
// TESTS
// ============================================================================
