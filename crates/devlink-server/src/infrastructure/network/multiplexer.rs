//! Readiness multiplexer for plain-TCP connections.
//!
//! One task waits on readiness for every registered read half at once.  When
//! a socket becomes readable the task looks the socket id up in the
//! registration table and, if it is still registered, drains the available
//! bytes into that client's receiver.
//!
//! Membership changes and shutdown wake the task through a [`Notify`], the
//! async equivalent of a self-pipe: the task is never left blocked in the
//! readiness wait after teardown has begun.
//!
//! Removing a client drops its cancellation sender, which resolves the
//! socket's pending readiness future, so a socket id never maps to a stale
//! receiver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::infrastructure::network::client::{Client, SocketId, READ_CHUNK};

struct Registration {
    client: Arc<Client>,
    // Dropping the sender cancels the socket's readiness wait.
    _cancel: oneshot::Sender<()>,
}

struct Pending {
    id: SocketId,
    read: OwnedReadHalf,
    cancel: oneshot::Receiver<()>,
}

enum Readiness {
    Readable(Pending),
    Cancelled(SocketId),
    Failed(SocketId, std::io::Error),
}

struct MuxShared {
    name: String,
    entries: Mutex<HashMap<SocketId, Registration>>,
    incoming: Mutex<Vec<Pending>>,
    wake: Notify,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one multiplexer task.  Cheap to clone.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

impl Multiplexer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(MuxShared {
                name: name.into(),
                entries: Mutex::new(HashMap::new()),
                incoming: Mutex::new(Vec::new()),
                wake: Notify::new(),
                running: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Spawns the multiplexer task.  Idempotent.
    pub fn start(&self) {
        let mut task = self.shared.lock_task();
        if task.is_some() {
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);
        *task = Some(tokio::spawn(run(Arc::clone(&self.shared))));
        debug!("multiplexer {}: started", self.shared.name);
    }

    /// Wakes the task, waits for it to exit, and drops every registration.
    pub async fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake.notify_one();
        let task = self.shared.lock_task().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let dropped = {
            let mut entries = self.shared.lock_entries();
            let count = entries.len();
            entries.clear();
            count
        };
        self.shared.lock_incoming().clear();
        info!(
            "multiplexer {}: stopped ({dropped} registration(s) dropped)",
            self.shared.name
        );
    }

    /// Registers `client` with its read half.  Returns `false` if the socket
    /// id is already registered.
    pub fn add_client(&self, client: Arc<Client>, read: OwnedReadHalf) -> bool {
        let id = client.id();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let mut entries = self.shared.lock_entries();
            if entries.contains_key(&id) {
                return false;
            }
            entries.insert(
                id,
                Registration {
                    client,
                    _cancel: cancel_tx,
                },
            );
        }
        self.shared.lock_incoming().push(Pending {
            id,
            read,
            cancel: cancel_rx,
        });
        self.shared.wake.notify_one();
        true
    }

    /// Unregisters a socket.  Returns `false` if it was not registered.
    pub fn remove_client(&self, id: SocketId) -> bool {
        let removed = self.shared.lock_entries().remove(&id);
        removed.is_some()
    }

    pub fn contains(&self, id: SocketId) -> bool {
        self.shared.lock_entries().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.shared.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("name", &self.shared.name)
            .field("running", &self.is_running())
            .field("registered", &self.len())
            .finish()
    }
}

impl MuxShared {
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<SocketId, Registration>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_incoming(&self) -> MutexGuard<'_, Vec<Pending>> {
        self.incoming.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn client(&self, id: SocketId) -> Option<Arc<Client>> {
        self.lock_entries().get(&id).map(|r| Arc::clone(&r.client))
    }

    /// Drops the registration and lets the client finish its lifecycle.
    fn release(&self, id: SocketId) {
        let registration = self.lock_entries().remove(&id);
        if let Some(registration) = registration {
            registration.client.finish_receiving();
        }
    }
}

fn wait_readable(mut pending: Pending) -> BoxFuture<'static, Readiness> {
    async move {
        tokio::select! {
            _ = &mut pending.cancel => Readiness::Cancelled(pending.id),
            ready = pending.read.readable() => match ready {
                Ok(()) => Readiness::Readable(pending),
                Err(e) => Readiness::Failed(pending.id, e),
            },
        }
    }
    .boxed()
}

async fn run(shared: Arc<MuxShared>) {
    let mut waits: FuturesUnordered<BoxFuture<'static, Readiness>> = FuturesUnordered::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        let adopted: Vec<Pending> = shared.lock_incoming().drain(..).collect();
        for pending in adopted {
            waits.push(wait_readable(pending));
        }

        let readiness = tokio::select! {
            _ = shared.wake.notified() => continue,
            Some(readiness) = waits.next(), if !waits.is_empty() => readiness,
        };

        match readiness {
            Readiness::Cancelled(id) => trace!("multiplexer {}: socket {id} removed", shared.name),
            Readiness::Failed(id, e) => {
                debug!("multiplexer {}: socket {id} failed: {e}", shared.name);
                shared.release(id);
            }
            Readiness::Readable(pending) => {
                let Some(client) = shared.client(pending.id) else {
                    continue;
                };
                if drain_socket(&pending.read, &client, &mut buf) {
                    waits.push(wait_readable(pending));
                } else {
                    shared.release(pending.id);
                }
            }
        }
    }
}

/// Forwards everything currently readable.  Returns `false` on EOF or error.
fn drain_socket(read: &OwnedReadHalf, client: &Client, buf: &mut [u8]) -> bool {
    loop {
        match read.try_read(buf) {
            Ok(0) => return false,
            Ok(n) => {
                client.process_received_buffer(&buf[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
            Err(e) => {
                debug!("client {}: read error: {e}", client.endpoint());
                return false;
            }
        }
    }
}
