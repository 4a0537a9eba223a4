//! Process-local pool of Event Hubs clients, one per connection string.
//!
//! `borrow` is idempotent per connection string: subsequent borrows return a
//! handle on the same underlying client. The connection is torn down when
//! the last borrower drops its handle, or immediately through
//! [`ClientConnectionPool::force_close`] (used by the reactor-closed
//! recovery so the next borrow dials fresh).

use std::fmt::Debug;
use std::sync::Arc;

use hashbrown::HashMap;
use observability_deps::tracing::{debug, warn};
use parking_lot::Mutex;

use crate::config::EventHubsConf;
use crate::core::{EventHubClient, EventHubsError};

/// Builds a client for a configuration. Construction must not perform I/O;
/// transports dial lazily on first use.
pub type ClientFactory =
    Arc<dyn Fn(&EventHubsConf) -> Result<Arc<dyn EventHubClient>, EventHubsError> + Send + Sync>;

#[derive(Debug)]
struct PoolEntry {
    client: Arc<dyn EventHubClient>,
    borrows: usize,
}

#[derive(Debug)]
struct PoolInner {
    clients: Mutex<HashMap<String, PoolEntry>>,
}

/// The pool. Shared by every receiver on a worker.
pub struct ClientConnectionPool {
    factory: ClientFactory,
    inner: Arc<PoolInner>,
}

impl Debug for ClientConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnectionPool")
            .field("clients", &self.inner.clients.lock().len())
            .finish_non_exhaustive()
    }
}

impl ClientConnectionPool {
    pub fn new(factory: ClientFactory) -> Self {
        Self {
            factory,
            inner: Arc::new(PoolInner {
                clients: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Borrow the shared client for `conf`, creating it on first use.
    pub fn borrow(&self, conf: &EventHubsConf) -> Result<PooledClient, EventHubsError> {
        let key = conf.connection_string().to_lowercase();
        let mut clients = self.inner.clients.lock();

        let entry = match clients.entry(key.clone()) {
            hashbrown::hash_map::Entry::Occupied(o) => o.into_mut(),
            hashbrown::hash_map::Entry::Vacant(v) => {
                debug!(
                    event_hub = conf.event_hub_name().unwrap_or_default(),
                    "creating pooled client"
                );
                let client = (self.factory)(conf)?;
                v.insert(PoolEntry { client, borrows: 0 })
            }
        };
        entry.borrows += 1;

        Ok(PooledClient {
            client: Arc::clone(&entry.client),
            key,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Tear down the connection for `conf` immediately.
    ///
    /// Outstanding [`PooledClient`] handles stay usable until dropped, but
    /// the next [`borrow`](Self::borrow) creates a fresh client.
    pub fn force_close(&self, conf: &EventHubsConf) {
        let key = conf.connection_string().to_lowercase();
        let entry = self.inner.clients.lock().remove(&key);
        if let Some(entry) = entry {
            warn!(borrows = entry.borrows, "force-closing pooled client");
            close_client(entry.client);
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.inner.clients.lock().len()
    }
}

/// Borrowed handle on a pooled client. Returns the borrow on drop.
#[derive(Debug)]
pub struct PooledClient {
    client: Arc<dyn EventHubClient>,
    key: String,
    inner: Arc<PoolInner>,
}

impl PooledClient {
    /// The shared client.
    pub fn client(&self) -> &Arc<dyn EventHubClient> {
        &self.client
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        let mut clients = self.inner.clients.lock();
        // the entry may have been force-closed and replaced; only account
        // against the client this handle was borrowed from
        if let Some(entry) = clients.get_mut(&self.key) {
            if Arc::ptr_eq(&entry.client, &self.client) {
                entry.borrows -= 1;
                if entry.borrows == 0 {
                    let entry = clients.remove(&self.key);
                    drop(clients);
                    if let Some(entry) = entry {
                        close_client(entry.client);
                    }
                }
            }
        }
    }
}

/// Best-effort asynchronous teardown. Outside a runtime the connection is
/// simply dropped with the handle.
fn close_client(client: Arc<dyn EventHubClient>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(e) = client.close().await {
                warn!(e=%e, "failed to close pooled client");
            }
        });
    }
}
