//! Audio relay socket
//!
//! A single-connection TCP listener that stands in for the microphone and
//! speaker when audio is routed over the network. The connected client
//! writes raw capture PCM and receives raw playback PCM; the format is
//! fixed out of band (mono, 16-bit, 16 kHz both ways).

use crate::audio::{InputDevice, OutputDevice, DATA_RATE};
use crate::error::{AudioError, RelayError};
use crate::listener::{self, ConnectionHandler, ConnectionSlot, Lease};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Read buffer size of the relay input in bytes
pub const RELAY_BUFFER_SIZE: usize = 16_000;

/// Shared handle to the audio relay
#[derive(Clone)]
pub struct AudioRelay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    slot: Arc<ConnectionSlot>,
    reader: Mutex<Option<(u64, OwnedReadHalf)>>,
    writer: Mutex<Option<(u64, OwnedWriteHalf)>>,
}

impl Default for AudioRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioRelay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RelayInner {
                slot: Arc::new(ConnectionSlot::new()),
                reader: Mutex::new(None),
                writer: Mutex::new(None),
            }),
        }
    }

    /// Run the accept loop until `shutdown` is cancelled
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        listener::serve_single(
            "Audio relay",
            listener,
            self.inner.slot.clone(),
            self.inner.clone(),
            shutdown,
        )
        .await;
    }

    /// Whether a client is connected
    pub fn has_connection(&self) -> bool {
        self.inner.slot.is_occupied()
    }

    /// Close the current client; the listener goes back to accepting
    pub fn close_current(&self) {
        self.inner.slot.close_current();
    }

    /// Read relayed capture bytes
    ///
    /// A timeout yields `Ok(0)`. End of stream or a socket error closes the
    /// connection and also yields `Ok(0)`; the next read reports `NotConnected`.
    pub async fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, RelayError> {
        let mut guard = self.inner.reader.lock().await;
        let (generation, reader) = guard.as_mut().ok_or(RelayError::NotConnected)?;

        match tokio::time::timeout(timeout, reader.read(buf)).await {
            Err(_) => Ok(0),
            Ok(Ok(0)) => {
                tracing::info!("Audio relay client closed the connection");
                let generation = *generation;
                guard.take();
                drop(guard);
                self.close_generation(generation);
                Ok(0)
            }
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => {
                tracing::warn!("Error reading from audio relay: {}", e);
                let generation = *generation;
                guard.take();
                drop(guard);
                self.close_generation(generation);
                Ok(0)
            }
        }
    }

    /// Discard any capture bytes already received
    pub async fn clear_input(&self) {
        let guard = self.inner.reader.lock().await;
        let Some((_, reader)) = guard.as_ref() else {
            return;
        };

        let mut buffer = [0u8; 4096];
        let mut cleared = 0usize;
        loop {
            match reader.try_read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => cleared += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }

        if cleared > 0 {
            tracing::debug!("Cleared {} bytes of audio relay input", cleared);
        }
    }

    /// Send playback bytes to the client
    pub async fn write(&self, bytes: &[u8]) -> Result<(), RelayError> {
        let mut guard = self.inner.writer.lock().await;
        let (generation, writer) = guard.as_mut().ok_or(RelayError::NotConnected)?;

        if let Err(e) = writer.write_all(bytes).await {
            let generation = *generation;
            guard.take();
            drop(guard);
            self.close_generation(generation);
            return Err(RelayError::Io(e));
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), RelayError> {
        let mut guard = self.inner.writer.lock().await;
        let (_, writer) = guard.as_mut().ok_or(RelayError::NotConnected)?;
        writer.flush().await?;
        Ok(())
    }

    fn close_generation(&self, generation: u64) {
        if self.inner.slot.current_generation() == Some(generation) {
            self.inner.slot.close_current();
        }
    }
}

#[async_trait::async_trait]
impl ConnectionHandler for RelayInner {
    async fn serve(self: Arc<Self>, stream: TcpStream, _peer: SocketAddr, lease: Lease) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Audio relay: set_nodelay failed: {}", e);
        }

        let generation = lease.generation();
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some((generation, read_half));
        *self.writer.lock().await = Some((generation, write_half));

        lease.closed.cancelled().await;

        // A newer connection may already own the halves
        {
            let mut reader = self.reader.lock().await;
            if reader.as_ref().map(|(g, _)| *g) == Some(generation) {
                reader.take();
            }
        }
        let mut writer = self.writer.lock().await;
        if writer.as_ref().map(|(g, _)| *g) == Some(generation) {
            if let Some((_, mut half)) = writer.take() {
                let _ = half.shutdown().await;
            }
        }
    }
}

/// Capture device reading from the relay client
pub struct RelayInput {
    relay: AudioRelay,
}

impl RelayInput {
    /// Fails if no client is connected
    pub fn open(relay: AudioRelay) -> Result<Self, AudioError> {
        if !relay.has_connection() {
            return Err(AudioError::SourceNotAvailable(
                "no client connected to the audio relay".to_string(),
            ));
        }
        Ok(Self { relay })
    }
}

#[async_trait::async_trait]
impl InputDevice for RelayInput {
    fn buffer_size(&self) -> usize {
        RELAY_BUFFER_SIZE
    }

    fn data_rate(&self) -> usize {
        DATA_RATE
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, AudioError> {
        self.relay.read(buf, timeout).await.map_err(|e| match e {
            RelayError::NotConnected => AudioError::SourceNotAvailable(e.to_string()),
            RelayError::Io(io) => AudioError::Connection(io.to_string()),
        })
    }

    async fn drain(&mut self) {
        self.relay.clear_input().await;
    }

    async fn release(&mut self) {}
}

/// Playback device writing to the relay client
///
/// Without a connected client, audio is discarded and logged.
pub struct RelayOutput {
    relay: AudioRelay,
    discarding: bool,
}

impl RelayOutput {
    pub fn new(relay: AudioRelay) -> Self {
        Self {
            relay,
            discarding: false,
        }
    }
}

#[async_trait::async_trait]
impl OutputDevice for RelayOutput {
    fn available(&self) -> usize {
        usize::MAX
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<usize, AudioError> {
        match self.relay.write(bytes).await {
            Ok(()) => {
                self.discarding = false;
            }
            Err(e) => {
                if !self.discarding {
                    tracing::warn!("Audio relay unavailable, discarding playback audio: {}", e);
                    self.discarding = true;
                }
                tracing::trace!("Discarded {} bytes of playback audio", bytes.len());
            }
        }
        Ok(bytes.len())
    }

    async fn flush(&mut self) {}

    async fn drain(&mut self) {
        if let Err(RelayError::Io(e)) = self.relay.flush().await {
            tracing::debug!("Audio relay flush failed: {}", e);
        }
    }

    async fn close(&mut self) {}
}
