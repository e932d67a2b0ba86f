//! Local control channel
//!
//! A line protocol on a loopback TCP port that lets an external controller
//! (or a test harness) start captures, route audio, and observe status.
//! One controller at a time; a new connection replaces the old one.
//!
//! ```text
//! -> OK 1.0.0                (greeting)
//! -> micWakeUpAllowed        (status push)
//! -> serverConnectionReady   (status push, 800ms later)
//! <- RM
//! -> OK 1.0.0
//! <- EXIT
//! -> DONE
//! ```

use crate::audio::{InputSource, OutputTarget};
use crate::listener::{self, ConnectionHandler, ConnectionSlot, Lease};
use crate::state::ConnectionState;
use crate::sync::lock;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Reply to EXIT
pub const DONE: &str = "DONE";

/// Reply to anything unrecognized
pub const UNKNOWN_COMMAND: &str = "?";

/// Pause between the wake status and the connection status pushed on connect
const CONNECT_STATUS_DELAY: Duration = Duration::from_millis(800);

/// Version reported in `OK` replies
pub fn client_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Commands a controller can send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Nothing to do (greeting or unrecognized input)
    None,
    /// RM: capture from the microphone
    ReadMicrophone,
    /// RAS: capture from the audio relay
    ReadAudioSocket,
    /// OS: play responses on the speaker
    OutputToSpeaker,
    /// OAS: play responses to the audio relay
    OutputToAudioSocket,
    /// finishedPlaying: the controller finished playing the response itself
    FinishedPlaying,
    /// EXIT: end the control connection
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtocolState {
    Waiting,
    AcceptCommand,
}

/// Per-connection command parser
#[derive(Debug)]
pub struct ControlProtocol {
    state: ProtocolState,
    ok_reply: String,
}

impl ControlProtocol {
    pub fn new(version: &str) -> Self {
        Self {
            state: ProtocolState::Waiting,
            ok_reply: format!("OK {}", version),
        }
    }

    /// Process one input line (None for the initial greeting)
    ///
    /// Returns the command to run and the reply to send.
    pub fn process(&mut self, input: Option<&str>) -> (ControlCommand, String) {
        match self.state {
            ProtocolState::Waiting => {
                self.state = ProtocolState::AcceptCommand;
                (ControlCommand::None, self.ok_reply.clone())
            }
            ProtocolState::AcceptCommand => {
                let input = input.unwrap_or("").trim();
                tracing::info!("Control received: \"{}\"", input);

                let command = parse_command(input);
                let reply = match command {
                    ControlCommand::None => UNKNOWN_COMMAND.to_string(),
                    ControlCommand::Exit => {
                        self.state = ProtocolState::Waiting;
                        DONE.to_string()
                    }
                    _ => self.ok_reply.clone(),
                };
                (command, reply)
            }
        }
    }
}

fn parse_command(input: &str) -> ControlCommand {
    const COMMANDS: [(&str, ControlCommand); 6] = [
        ("RM", ControlCommand::ReadMicrophone),
        ("RAS", ControlCommand::ReadAudioSocket),
        ("OS", ControlCommand::OutputToSpeaker),
        ("OAS", ControlCommand::OutputToAudioSocket),
        ("finishedPlaying", ControlCommand::FinishedPlaying),
        ("EXIT", ControlCommand::Exit),
    ];

    COMMANDS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(input))
        .map(|(_, command)| *command)
        .unwrap_or(ControlCommand::None)
}

/// Unsolicited status lines pushed to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPush {
    MicClose,
    MicOpen,
    WakeUpAllowed,
    WakeUpNotAllowed,
    PlaybackResume,
    PlaybackStop,
    VolumeDown,
    VolumeUp,
    VolumeMute,
    VolumeUnmute,
    ServerConnected,
    ServerConnecting,
    ServerConnectionReady,
    ServerNotConnected,
}

impl StatusPush {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusPush::MicClose => "micClose",
            StatusPush::MicOpen => "micOpen",
            StatusPush::WakeUpAllowed => "micWakeUpAllowed",
            StatusPush::WakeUpNotAllowed => "micWakeUpNotAllowed",
            StatusPush::PlaybackResume => "playbackResume",
            StatusPush::PlaybackStop => "playbackStop",
            StatusPush::VolumeDown => "volumeDown",
            StatusPush::VolumeUp => "volumeUp",
            StatusPush::VolumeMute => "volumeMute",
            StatusPush::VolumeUnmute => "volumeUnmute",
            StatusPush::ServerConnected => "serverConnected",
            StatusPush::ServerConnecting => "serverConnecting",
            StatusPush::ServerConnectionReady => "serverConnectionReady",
            StatusPush::ServerNotConnected => "serverNotConnected",
        }
    }

    /// Push announcing a connection state
    pub fn for_state(state: ConnectionState) -> Self {
        match state {
            ConnectionState::NotConnected | ConnectionState::Closing => {
                StatusPush::ServerNotConnected
            }
            ConnectionState::Connecting => StatusPush::ServerConnecting,
            ConnectionState::Connected => StatusPush::ServerConnected,
            ConnectionState::Ready => StatusPush::ServerConnectionReady,
        }
    }

    /// Push announcing the wake gate
    pub fn for_wake_gate(allowed: bool) -> Self {
        if allowed {
            StatusPush::WakeUpAllowed
        } else {
            StatusPush::WakeUpNotAllowed
        }
    }
}

impl std::fmt::Display for StatusPush {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for status pushes
pub trait StatusSink: Send + Sync {
    fn push(&self, status: StatusPush);
}

/// Session operations reachable from the control channel
#[async_trait::async_trait]
pub trait ControlHandler: Send + Sync + 'static {
    /// Start a capture from `source`; false if the session refused
    async fn on_wakeup_trigger(&self, source: InputSource) -> bool;

    /// Route playback to `target`
    async fn set_output_target(&self, target: OutputTarget) -> bool;

    /// The controller finished playing the current response
    async fn finished_playing(&self) -> bool;

    /// Current wake gate status
    fn wake_status(&self) -> StatusPush;

    /// Current connection status
    fn connection_status(&self) -> StatusPush;

    /// The controller left; drop the audio relay client so it can reconnect
    fn recycle_audio_relay(&self);
}

/// Shared handle to the control channel
#[derive(Clone)]
pub struct ControlChannel {
    inner: Arc<ControlInner>,
}

struct ControlInner {
    slot: Arc<ConnectionSlot>,
    version: String,
    /// Line writer of the live controller, tagged with its lease generation
    writer: Mutex<Option<(u64, mpsc::UnboundedSender<String>)>>,
}

impl ControlInner {
    fn writer(&self) -> MutexGuard<'_, Option<(u64, mpsc::UnboundedSender<String>)>> {
        lock(&self.writer)
    }
}

/// Listener-side state for one serve loop
struct ControlConnections {
    inner: Arc<ControlInner>,
    handler: Arc<dyn ControlHandler>,
}

impl ControlChannel {
    pub fn new(version: &str) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                slot: Arc::new(ConnectionSlot::new()),
                version: version.to_string(),
                writer: Mutex::new(None),
            }),
        }
    }

    /// Run the accept loop until `shutdown` is cancelled
    pub async fn serve(
        &self,
        listener: TcpListener,
        handler: Arc<dyn ControlHandler>,
        shutdown: CancellationToken,
    ) {
        let connections = Arc::new(ControlConnections {
            inner: self.inner.clone(),
            handler,
        });
        listener::serve_single(
            "Control channel",
            listener,
            self.inner.slot.clone(),
            connections,
            shutdown,
        )
        .await;
    }

    /// Whether a controller is connected
    pub fn has_connection(&self) -> bool {
        self.inner.slot.is_occupied()
    }
}

impl StatusSink for ControlChannel {
    fn push(&self, status: StatusPush) {
        if let Some((_, tx)) = self.inner.writer().as_ref() {
            tracing::debug!("Control push: {}", status);
            let _ = tx.send(status.as_str().to_string());
        }
    }
}

#[async_trait::async_trait]
impl ConnectionHandler for ControlConnections {
    async fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, lease: Lease) {
        let _ = stream.set_nodelay(true);
        let (read_half, mut write_half) = stream.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.inner.writer() = Some((lease.generation(), tx.clone()));

        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let mut protocol = ControlProtocol::new(&self.inner.version);
        let (_, greeting) = protocol.process(None);
        let _ = tx.send(greeting);
        let _ = tx.send(self.handler.wake_status().to_string());

        let ended_by_controller = tokio::select! {
            _ = lease.closed.cancelled() => false,
            _ = tokio::time::sleep(CONNECT_STATUS_DELAY) => {
                let _ = tx.send(self.handler.connection_status().to_string());
                self.read_commands(read_half, &mut protocol, &tx, &lease).await
            }
        };

        {
            let mut writer_slot = self.inner.writer();
            if writer_slot.as_ref().map(|(g, _)| *g) == Some(lease.generation()) {
                writer_slot.take();
            }
        }
        drop(tx);
        let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;

        if ended_by_controller {
            tracing::debug!("Controller {} left, recycling audio relay", peer);
            self.handler.recycle_audio_relay();
        }
    }
}

impl ControlConnections {
    /// Read and run commands; true if the controller ended the session itself
    async fn read_commands(
        &self,
        read_half: tokio::net::tcp::OwnedReadHalf,
        protocol: &mut ControlProtocol,
        tx: &mpsc::UnboundedSender<String>,
        lease: &Lease,
    ) -> bool {
        let mut lines = BufReader::new(read_half).lines();

        loop {
            let line = tokio::select! {
                _ = lease.closed.cancelled() => return false,
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => return true,
                Err(e) => {
                    tracing::warn!("Control read failed: {}", e);
                    return false;
                }
            };

            let (command, reply) = protocol.process(Some(&line));
            let accepted = match command {
                ControlCommand::ReadMicrophone => {
                    self.handler.on_wakeup_trigger(InputSource::Microphone).await
                }
                ControlCommand::ReadAudioSocket => {
                    self.handler.on_wakeup_trigger(InputSource::Relay).await
                }
                ControlCommand::OutputToSpeaker => {
                    self.handler.set_output_target(OutputTarget::Speaker).await
                }
                ControlCommand::OutputToAudioSocket => {
                    self.handler.set_output_target(OutputTarget::Relay).await
                }
                ControlCommand::FinishedPlaying => self.handler.finished_playing().await,
                ControlCommand::Exit => true,
                ControlCommand::None => false,
            };

            if !accepted {
                tracing::info!(
                    "Command cannot currently be carried out: {:?} ('{}')",
                    command,
                    line.trim()
                );
            }

            let _ = tx.send(reply);

            if command == ControlCommand::Exit {
                tracing::debug!("Controller exited");
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_then_commands() {
        let mut protocol = ControlProtocol::new("1.2.3");
        assert_eq!(
            protocol.process(None),
            (ControlCommand::None, "OK 1.2.3".to_string())
        );
        assert_eq!(
            protocol.process(Some("RM")),
            (ControlCommand::ReadMicrophone, "OK 1.2.3".to_string())
        );
        assert_eq!(
            protocol.process(Some("oas")),
            (ControlCommand::OutputToAudioSocket, "OK 1.2.3".to_string())
        );
        assert_eq!(
            protocol.process(Some("FINISHEDPLAYING")),
            (ControlCommand::FinishedPlaying, "OK 1.2.3".to_string())
        );
    }

    #[test]
    fn test_unknown_command() {
        let mut protocol = ControlProtocol::new("1.0.0");
        protocol.process(None);
        assert_eq!(
            protocol.process(Some("PLAY")),
            (ControlCommand::None, "?".to_string())
        );
        assert_eq!(
            protocol.process(Some("")),
            (ControlCommand::None, "?".to_string())
        );
    }

    #[test]
    fn test_exit_returns_to_waiting() {
        let mut protocol = ControlProtocol::new("1.0.0");
        protocol.process(None);
        assert_eq!(
            protocol.process(Some("exit")),
            (ControlCommand::Exit, "DONE".to_string())
        );
        // Next input is treated as a new greeting
        assert_eq!(
            protocol.process(Some("RM")),
            (ControlCommand::None, "OK 1.0.0".to_string())
        );
    }

    #[test]
    fn test_trailing_carriage_return_ignored() {
        let mut protocol = ControlProtocol::new("1.0.0");
        protocol.process(None);
        assert_eq!(protocol.process(Some("RAS\r")).0, ControlCommand::ReadAudioSocket);
    }

    #[test]
    fn test_status_push_wire_names() {
        assert_eq!(StatusPush::WakeUpAllowed.to_string(), "micWakeUpAllowed");
        assert_eq!(StatusPush::VolumeDown.as_str(), "volumeDown");
        assert_eq!(
            StatusPush::for_state(ConnectionState::Ready),
            StatusPush::ServerConnectionReady
        );
        assert_eq!(
            StatusPush::for_state(ConnectionState::Closing),
            StatusPush::ServerNotConnected
        );
        assert_eq!(StatusPush::for_wake_gate(false), StatusPush::WakeUpNotAllowed);
    }

    #[test]
    fn test_push_without_controller_is_dropped() {
        let channel = ControlChannel::new("1.0.0");
        channel.push(StatusPush::MicOpen);
        assert!(!channel.has_connection());
    }
}
