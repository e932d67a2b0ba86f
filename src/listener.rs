//! Single-connection local TCP listeners
//!
//! Both local sockets (control and audio relay) serve exactly one client at a
//! time. Accepting a new client closes the previous one, and the owner can
//! force the current client closed through [`ConnectionSlot::close_current`],
//! after which the listener simply keeps accepting.

use crate::sync::lock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Handle to one accepted connection
///
/// `closed` is cancelled when the connection is replaced by a newer one or
/// forced closed by the owner.
#[derive(Debug, Clone)]
pub struct Lease {
    generation: u64,
    pub closed: CancellationToken,
}

impl Lease {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Tracks the one live connection of a listener
///
/// Installing a new connection cancels the previous lease, which tells the
/// previous connection's task to close its socket.
#[derive(Debug, Default)]
pub struct ConnectionSlot {
    current: Mutex<Option<Lease>>,
    generation: AtomicU64,
}

impl ConnectionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> MutexGuard<'_, Option<Lease>> {
        lock(&self.current)
    }

    /// Register a newly accepted connection, closing the previous one
    pub fn install(&self) -> Lease {
        let lease = Lease {
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            closed: CancellationToken::new(),
        };
        if let Some(previous) = self.current().replace(lease.clone()) {
            previous.closed.cancel();
        }
        lease
    }

    /// Force the current connection closed; the listener keeps accepting
    pub fn close_current(&self) {
        if let Some(current) = self.current().take() {
            current.closed.cancel();
        }
    }

    /// Forget `lease` if it is still the current connection
    pub fn release(&self, lease: &Lease) {
        let mut guard = self.current();
        if guard.as_ref().map(|c| c.generation) == Some(lease.generation) {
            guard.take();
        }
    }

    /// Generation of the live connection, if any
    pub fn current_generation(&self) -> Option<u64> {
        self.current().as_ref().map(|c| c.generation)
    }

    /// Whether a connection is currently installed
    pub fn is_occupied(&self) -> bool {
        self.current().is_some()
    }
}

/// Per-connection behavior of a single-connection listener
#[async_trait::async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve `stream` until it ends or `lease.closed` is cancelled
    async fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, lease: Lease);
}

/// Bind a listener on the local interface
pub async fn bind_local(address: &str, port: u16) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind((address, port)).await?;
    tracing::debug!("Bound {}:{}", address, port);
    Ok(listener)
}

/// Accept loop shared by the control channel and the audio relay
///
/// Runs until `shutdown` is cancelled, then closes the live connection.
pub async fn serve_single<H: ConnectionHandler>(
    name: &'static str,
    listener: TcpListener,
    slot: Arc<ConnectionSlot>,
    handler: Arc<H>,
    shutdown: CancellationToken,
) {
    match listener.local_addr() {
        Ok(addr) => tracing::info!("{} listening on {}", name, addr),
        Err(_) => tracing::info!("{} listening", name),
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if slot.is_occupied() {
                        tracing::info!("{}: new client {} replaces the current one", name, peer);
                    } else {
                        tracing::info!("{}: accepted connection from {}", name, peer);
                    }
                    let lease = slot.install();
                    let handler = handler.clone();
                    let slot = slot.clone();
                    tokio::spawn(async move {
                        handler.serve(stream, peer, lease.clone()).await;
                        slot.release(&lease);
                        tracing::debug!("{}: connection from {} closed", name, peer);
                    });
                }
                Err(e) => {
                    tracing::warn!("{}: accept failed: {}", name, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    slot.close_current();
    tracing::debug!("{} stopped", name);
}
