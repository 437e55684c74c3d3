//! Live clients of one listener.
//!
//! Lookups are linear scans under a single mutex.  Connection counts are
//! bounded (hundreds) and lookups are rare compared to I/O, so a `Vec` is
//! simpler than maintaining secondary indexes.  The mutex is never held
//! across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use devlink_core::Endpoint;
use tokio::time::Instant;
use tracing::debug;

use crate::application::InstructionPool;
use crate::infrastructure::network::client::{Client, SocketId};

#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<Vec<Arc<Client>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `client`.  Returns `false` if its socket id is already present.
    pub fn add(&self, client: Arc<Client>) -> bool {
        let mut clients = self.lock();
        if clients.iter().any(|c| c.id() == client.id()) {
            return false;
        }
        clients.push(client);
        true
    }

    pub fn remove(&self, id: SocketId) -> Option<Arc<Client>> {
        let mut clients = self.lock();
        let index = clients.iter().position(|c| c.id() == id)?;
        Some(clients.remove(index))
    }

    pub fn get(&self, id: SocketId) -> Option<Arc<Client>> {
        self.lock().iter().find(|c| c.id() == id).cloned()
    }

    /// The open client connected from `endpoint`.
    pub fn find(&self, endpoint: &Endpoint) -> Option<Arc<Client>> {
        self.lock()
            .iter()
            .find(|c| !c.is_closed() && c.endpoint() == endpoint)
            .cloned()
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.find(endpoint).is_some()
    }

    pub fn get_client_pool(&self, endpoint: &Endpoint) -> Option<InstructionPool> {
        self.find(endpoint).and_then(|c| c.pool())
    }

    /// Operator-initiated close of the client at `endpoint`.
    pub fn close_by_endpoint(&self, endpoint: &Endpoint) -> bool {
        match self.find(endpoint) {
            Some(client) => {
                client.set_close_manually();
                true
            }
            None => false,
        }
    }

    /// Number of registered clients, closed ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of clients that are still open.
    pub fn open_count(&self) -> usize {
        self.lock().iter().filter(|c| !c.is_closed()).count()
    }

    /// Endpoints of every open client.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.lock()
            .iter()
            .filter(|c| !c.is_closed())
            .map(|c| c.endpoint().clone())
            .collect()
    }

    /// Every registered client, for sending outside the lock.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.lock().clone()
    }

    /// Marks closed clients for deletion and removes those whose close is at
    /// least `grace` old and whose receive side has stopped.
    pub fn sweep(&self, now: Instant, grace: Duration) -> Vec<Arc<Client>> {
        let mut reaped = Vec::new();
        self.lock().retain(|client| {
            if !client.is_closed() {
                return true;
            }
            client.mark_for_deletion();
            let expired = client.closed_for(now).is_some_and(|age| age >= grace);
            if expired && !client.is_receiving() {
                debug!("reaping client {} (socket {})", client.endpoint(), client.id());
                reaped.push(Arc::clone(client));
                false
            } else {
                true
            }
        });
        reaped
    }

    /// Closes and removes every client.
    pub fn close_all(&self) -> Vec<Arc<Client>> {
        let clients: Vec<Arc<Client>> = self.lock().drain(..).collect();
        for client in &clients {
            client.set_close_manually();
        }
        clients
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Client>>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::network::client::{ClientReceiver, ClientSender, ReceiverRole};
    use devlink_core::Framing;

    fn client(id: SocketId, port: u16) -> Arc<Client> {
        let receiver =
            ClientReceiver::new(ReceiverRole::Server, Endpoint::new("127.0.0.1", port), Framing::Raw)
                .unwrap();
        Arc::new(Client::new(id, receiver, ClientSender::stream(tokio::io::sink())))
    }

    #[test]
    fn test_registry_rejects_duplicate_socket_ids() {
        let registry = ClientRegistry::new();
        assert!(registry.add(client(1, 4000)));
        assert!(!registry.add(client(1, 4001)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_find_ignores_closed_clients() {
        let registry = ClientRegistry::new();
        let c = client(1, 4000);
        registry.add(Arc::clone(&c));
        let endpoint = Endpoint::new("127.0.0.1", 4000);
        assert!(registry.contains(&endpoint));

        assert!(registry.close_by_endpoint(&endpoint));

        assert!(!registry.contains(&endpoint));
        assert!(c.closed_manually());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn test_sweep_waits_for_grace_period() {
        // Arrange
        let registry = ClientRegistry::new();
        let c = client(1, 4000);
        registry.add(Arc::clone(&c));
        registry.add(client(2, 4001));
        c.close();
        let closed_at = Instant::now();
        let grace = Duration::from_millis(200);

        // Act / Assert: too early, only flagged for deletion.
        assert!(registry.sweep(closed_at + Duration::from_millis(50), grace).is_empty());
        assert!(c.is_deleted());
        assert_eq!(registry.len(), 2);

        // After the grace period the closed client is reaped; the open one stays.
        let reaped = registry.sweep(closed_at + Duration::from_millis(250), grace);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id(), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(2).is_some());
    }

    #[test]
    fn test_close_all_empties_registry() {
        let registry = ClientRegistry::new();
        registry.add(client(1, 4000));
        registry.add(client(2, 4001));

        let closed = registry.close_all();

        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|c| c.is_closed()));
        assert!(registry.is_empty());
    }
}
