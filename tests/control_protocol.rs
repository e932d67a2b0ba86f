//! Control channel over a real loopback socket

mod common;

use common::{FakeTokens, Harness};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use voxclient::audio::{InputSource, OutputTarget};
use voxclient::control::{ControlChannel, ControlHandler, StatusPush, StatusSink};
use voxclient::listener::bind_local;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingHandler {
    calls: Mutex<Vec<String>>,
    recycled: AtomicBool,
}

impl RecordingHandler {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl ControlHandler for RecordingHandler {
    async fn on_wakeup_trigger(&self, source: InputSource) -> bool {
        self.record(format!("wake {}", source));
        false
    }

    async fn set_output_target(&self, target: OutputTarget) -> bool {
        self.record(format!("output {}", target));
        true
    }

    async fn finished_playing(&self) -> bool {
        self.record("finished".to_string());
        true
    }

    fn wake_status(&self) -> StatusPush {
        StatusPush::WakeUpNotAllowed
    }

    fn connection_status(&self) -> StatusPush {
        StatusPush::ServerNotConnected
    }

    fn recycle_audio_relay(&self) {
        self.recycled.store(true, Ordering::SeqCst);
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    async fn line(&mut self) -> Option<String> {
        tokio::time::timeout(REPLY_TIMEOUT, self.lines.next_line())
            .await
            .expect("no line from the control channel")
            .unwrap()
    }

    async fn send(&mut self, command: &str) {
        self.writer
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .unwrap();
    }

    /// Greeting plus the two status lines sent on connect
    async fn handshake(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        for _ in 0..3 {
            lines.push(self.line().await.unwrap());
        }
        lines
    }
}

async fn start(
    version: &str,
    handler: Arc<dyn ControlHandler>,
) -> (ControlChannel, u16, CancellationToken) {
    let listener = bind_local("127.0.0.1", 0).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let channel = ControlChannel::new(version);
    let shutdown = CancellationToken::new();

    let serving = channel.clone();
    let token = shutdown.clone();
    tokio::spawn(async move { serving.serve(listener, handler, token).await });

    (channel, port, shutdown)
}

#[tokio::test]
async fn test_command_replies_and_pushes() {
    let handler = Arc::new(RecordingHandler::default());
    let (channel, port, shutdown) = start("9.9.9", handler.clone()).await;

    let mut client = Client::connect(port).await;
    assert_eq!(
        client.handshake().await,
        vec!["OK 9.9.9", "micWakeUpNotAllowed", "serverNotConnected"]
    );

    // Refused by the handler, still acknowledged
    client.send("RM").await;
    assert_eq!(client.line().await.unwrap(), "OK 9.9.9");

    client.send("OAS").await;
    assert_eq!(client.line().await.unwrap(), "OK 9.9.9");

    client.send("finishedPlaying").await;
    assert_eq!(client.line().await.unwrap(), "OK 9.9.9");

    client.send("launch rockets").await;
    assert_eq!(client.line().await.unwrap(), "?");

    channel.push(StatusPush::MicOpen);
    assert_eq!(client.line().await.unwrap(), "micOpen");

    assert_eq!(
        handler.calls(),
        vec!["wake microphone", "output audio relay", "finished"]
    );

    client.send("EXIT").await;
    assert_eq!(client.line().await.unwrap(), "DONE");
    assert_eq!(client.line().await, None);

    assert!(common::wait_for(REPLY_TIMEOUT, || handler.recycled.load(Ordering::SeqCst)).await);
    shutdown.cancel();
}

#[tokio::test]
async fn test_new_controller_replaces_old() {
    let handler = Arc::new(RecordingHandler::default());
    let (channel, port, shutdown) = start("1.0.0", handler.clone()).await;

    let mut first = Client::connect(port).await;
    first.handshake().await;

    let mut second = Client::connect(port).await;
    assert_eq!(second.handshake().await[0], "OK 1.0.0");

    // The replaced controller is disconnected and gets no more pushes
    assert_eq!(first.line().await, None);
    channel.push(StatusPush::PlaybackStop);
    assert_eq!(second.line().await.unwrap(), "playbackStop");

    // Replacement is not the controller leaving on its own
    assert!(!handler.recycled.load(Ordering::SeqCst));
    assert!(channel.has_connection());
    shutdown.cancel();
}

#[tokio::test]
async fn test_wake_request_while_not_ready_starts_nothing() {
    let h = Harness::new(FakeTokens::ok("tok"));
    let (_channel, port, shutdown) = start("2.0.0", h.session.clone()).await;

    let mut client = Client::connect(port).await;
    assert_eq!(
        client.handshake().await,
        vec!["OK 2.0.0", "micWakeUpNotAllowed", "serverNotConnected"]
    );

    client.send("RM").await;
    assert_eq!(client.line().await.unwrap(), "OK 2.0.0");

    client.send("RAS").await;
    assert_eq!(client.line().await.unwrap(), "OK 2.0.0");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.devices.inputs_opened(), 0);
    shutdown.cancel();
}
