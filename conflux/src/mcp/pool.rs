//! Connection pool for MCP transports.
//!
//! Entries are keyed by `(endpoint descriptor, auth class)` so credentialed
//! and unauthenticated traffic never share a connection. Each entry tracks a
//! busy count and a last-used stamp; eviction and sweeping only ever touch
//! idle entries. Acquired connections are returned as guards whose drop path
//! releases the entry, so the busy count returns to zero on success,
//! timeout, and error alike.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

use super::handle::{McpAuth, McpHandle};
use super::transport::{Connector, McpTransport};

/// Coarse auth bucket for pool keying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthClass {
    /// No credentials attached.
    None,
    /// Bearer or OAuth credentials attached.
    Credentialed,
}

impl AuthClass {
    /// Classify an optional auth config.
    #[must_use]
    pub const fn of(auth: Option<&McpAuth>) -> Self {
        match auth {
            Some(_) => Self::Credentialed,
            None => Self::None,
        }
    }
}

/// Key for pool entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// Endpoint descriptor: URL for HTTP, `command args…` for STDIO.
    pub descriptor: String,
    /// Auth bucket.
    pub auth_class: AuthClass,
}

impl PoolKey {
    /// Build the key for a handle with the effective auth applied.
    #[must_use]
    pub fn for_handle(handle: &McpHandle, auth: Option<&McpAuth>) -> Self {
        Self {
            descriptor: handle.transport.descriptor(),
            auth_class: AuthClass::of(auth),
        }
    }
}

struct Entry {
    transport: Arc<dyn McpTransport>,
    busy_count: u32,
    last_used: Instant,
}

/// Pool tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Maximum number of live entries.
    pub max_entries: usize,
    /// Idle age after which the sweeper closes an entry.
    pub idle_timeout: Duration,
    /// Interval between sweeps.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_entries: 32,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct PoolInner {
    entries: Mutex<HashMap<PoolKey, Entry>>,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PoolInner {
    fn release(&self, key: &PoolKey) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.busy_count = entry.busy_count.saturating_sub(1);
            entry.last_used = Instant::now();
        }
    }

    /// Remove the least-recently-used idle entry, returning its transport
    /// for the caller to close. `None` when every entry is busy.
    fn evict_lru_idle(
        entries: &mut HashMap<PoolKey, Entry>,
    ) -> Option<(PoolKey, Arc<dyn McpTransport>)> {
        let victim = entries
            .iter()
            .filter(|(_, e)| e.busy_count == 0)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone())?;
        let entry = entries.remove(&victim)?;
        Some((victim, entry.transport))
    }
}

/// A checked-out pooled transport. Dropping it releases the pool slot.
pub struct PooledConnection {
    inner: Arc<PoolInner>,
    key: PoolKey,
    transport: Arc<dyn McpTransport>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = dyn McpTransport;

    fn deref(&self) -> &Self::Target {
        &*self.transport
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.inner.release(&self.key);
    }
}

/// Process-wide pool of reusable MCP transports.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("entries", &self.len())
            .field("max", &self.inner.config.max_entries)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create a pool backed by the given connector.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                entries: Mutex::new(HashMap::new()),
                config,
                connector,
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Acquire a transport for the handle, reusing a pooled entry when one
    /// exists for the `(descriptor, auth class)` key.
    pub async fn acquire(
        &self,
        handle: &McpHandle,
        auth: Option<&McpAuth>,
        auth_header: Option<&str>,
    ) -> Result<PooledConnection> {
        self.ensure_sweeper();
        let key = PoolKey::for_handle(handle, auth);

        let evicted = {
            let mut entries = self.inner.entries.lock();
            if let Some(entry) = entries.get_mut(&key) {
                entry.busy_count += 1;
                entry.last_used = Instant::now();
                return Ok(PooledConnection {
                    inner: Arc::clone(&self.inner),
                    key,
                    transport: Arc::clone(&entry.transport),
                });
            }

            if entries.len() >= self.inner.config.max_entries {
                let Some(victim) = PoolInner::evict_lru_idle(&mut entries) else {
                    return Err(Error::mcp_connection(format!(
                        "connection pool exhausted ({} busy entries)",
                        entries.len()
                    )));
                };
                Some(victim)
            } else {
                None
            }
        };

        if let Some((victim_key, transport)) = evicted {
            debug!(descriptor = %victim_key.descriptor, "evicting idle pool entry");
            tokio::spawn(async move { transport.close().await });
        }

        let transport = self
            .inner
            .connector
            .connect(&handle.transport, auth_header)
            .await?;

        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(&key) {
            // Another task connected the same endpoint while we were; use
            // the pooled one and discard ours.
            entry.busy_count += 1;
            entry.last_used = Instant::now();
            let surplus = Arc::clone(&transport);
            tokio::spawn(async move { surplus.close().await });
            return Ok(PooledConnection {
                inner: Arc::clone(&self.inner),
                key,
                transport: Arc::clone(&entry.transport),
            });
        }

        if entries.len() >= self.inner.config.max_entries
            && PoolInner::evict_lru_idle(&mut entries).is_none()
        {
            let surplus = Arc::clone(&transport);
            tokio::spawn(async move { surplus.close().await });
            return Err(Error::mcp_connection(format!(
                "connection pool exhausted ({} busy entries)",
                entries.len()
            )));
        }

        entries.insert(
            key.clone(),
            Entry {
                transport: Arc::clone(&transport),
                busy_count: 1,
                last_used: Instant::now(),
            },
        );
        Ok(PooledConnection {
            inner: Arc::clone(&self.inner),
            key,
            transport,
        })
    }

    /// Close every idle entry older than the configured idle timeout.
    pub async fn sweep(&self) {
        sweep_expired(&self.inner).await;
    }

    /// Close every entry, busy or not, and stop the sweeper. Close errors
    /// are logged and swallowed; shutdown always completes.
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.sweeper.lock().take() {
            task.abort();
        }
        let drained: Vec<(PoolKey, Arc<dyn McpTransport>)> = {
            let mut entries = self.inner.entries.lock();
            entries.drain().map(|(k, e)| (k, e.transport)).collect()
        };
        for (key, transport) in drained {
            transport.close().await;
            debug!(descriptor = %key.descriptor, "closed pool entry on shutdown");
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Whether the pool has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Sum of busy counts across entries.
    #[must_use]
    pub fn busy_total(&self) -> u32 {
        self.inner
            .entries
            .lock()
            .values()
            .map(|e| e.busy_count)
            .sum()
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let interval = self.inner.config.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                sweep_expired(&inner).await;
            }
        }));
    }
}

async fn sweep_expired(inner: &Arc<PoolInner>) {
    let now = Instant::now();
    let expired: Vec<(PoolKey, Arc<dyn McpTransport>)> = {
        let mut entries = inner.entries.lock();
        let keys: Vec<PoolKey> = entries
            .iter()
            .filter(|(_, e)| e.busy_count == 0 && now - e.last_used > inner.config.idle_timeout)
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| entries.remove(&k).map(|e| (k, e.transport)))
            .collect()
    };

    for (key, transport) in expired {
        debug!(descriptor = %key.descriptor, "sweeping idle pool entry");
        transport.close().await;
    }
}
