//! In-memory collaborators for driving a SessionManager without a network,
//! audio hardware or a token endpoint

#![allow(dead_code)]

use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use voxclient::audio::feedback::SilentPrompts;
use voxclient::audio::{AudioDevices, InputDevice, InputSource, OutputDevice, OutputTarget};
use voxclient::config::ServerConfig;
use voxclient::control::{StatusPush, StatusSink};
use voxclient::error::{AudioError, TokenError};
use voxclient::relay::AudioRelay;
use voxclient::session::{
    ConnectRequest, Connector, EventSender, LinkEvent, LinkHandle, Outbound, SessionDeps,
    SessionManager, TokenProvider,
};
use voxclient::status::ConsoleIndicator;

/// Connector that records requests and lets the test play the server
#[derive(Default)]
pub struct FakeConnector {
    requests: Mutex<Vec<ConnectRequest>>,
    events: Mutex<Option<EventSender>>,
    outbound: Mutex<Vec<mpsc::UnboundedReceiver<Outbound>>>,
    sent: Mutex<Vec<Outbound>>,
}

impl FakeConnector {
    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Deliver `event` as if it came from the newest connection
    pub fn emit(&self, event: LinkEvent) {
        let epoch = self
            .requests
            .lock()
            .unwrap()
            .last()
            .map(|r| r.epoch)
            .expect("no connect request yet");
        let events = self.events.lock().unwrap();
        events
            .as_ref()
            .expect("no event sender")
            .send((epoch, event))
            .unwrap();
    }

    /// Deliver a server action given as JSON
    pub fn server_says(&self, action: Value) {
        self.emit(LinkEvent::Message(action.to_string()));
    }

    /// Every frame the client queued so far, across all connections
    pub fn sent(&self) -> Vec<Outbound> {
        let mut sent = self.sent.lock().unwrap();
        for rx in self.outbound.lock().unwrap().iter_mut() {
            while let Ok(frame) = rx.try_recv() {
                sent.push(frame);
            }
        }
        sent.clone()
    }

    /// Text frames decoded as JSON
    pub fn sent_actions(&self) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter_map(|frame| match frame {
                Outbound::Text(text) => serde_json::from_str(&text).ok(),
                Outbound::Close { .. } => None,
            })
            .collect()
    }

    /// Sent actions named `name`
    pub fn sent_named(&self, name: &str) -> Vec<Value> {
        self.sent_actions()
            .into_iter()
            .filter(|a| a["action"] == name)
            .collect()
    }
}

impl Connector for FakeConnector {
    fn connect(&self, request: ConnectRequest, events: EventSender) -> LinkHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.requests.lock().unwrap().push(request);
        *self.events.lock().unwrap() = Some(events);
        self.outbound.lock().unwrap().push(rx);
        LinkHandle::new(tx)
    }
}

/// Token provider returning a fixed answer
pub struct FakeTokens {
    pub result: Mutex<Result<String, u16>>,
    pub calls: AtomicUsize,
}

impl FakeTokens {
    pub fn ok(token: &str) -> Self {
        Self {
            result: Mutex::new(Ok(token.to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn rejecting(status: u16) -> Self {
        Self {
            result: Mutex::new(Err(status)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TokenProvider for FakeTokens {
    async fn fetch_token(&self) -> Result<String, TokenError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &*self.result.lock().unwrap() {
            Ok(token) => Ok(token.clone()),
            Err(status) => Err(TokenError::Authentication { status: *status }),
        }
    }
}

/// Input that never produces audio
pub struct SilentInput {
    reads: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl InputDevice for SilentInput {
    fn buffer_size(&self) -> usize {
        16_000
    }

    fn data_rate(&self) -> usize {
        32_000
    }

    async fn read(&mut self, _buf: &mut [u8], _timeout: Duration) -> Result<usize, AudioError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    async fn drain(&mut self) {}

    async fn release(&mut self) {}
}

/// What inputs opened by [`FakeDevices`] produce
#[derive(Debug, Clone, Copy, Default)]
pub enum InputMode {
    /// Every read comes back empty
    #[default]
    Silent,
    /// Every read returns `chunk` bytes after waiting `every`
    Streaming { chunk: usize, every: Duration },
}

/// Input producing numbered chunks at a steady pace
///
/// Each chunk is filled with its read number (mod 251), so a test can tell
/// chunks apart after they went over the wire.
pub struct StreamingInput {
    chunk: usize,
    every: Duration,
    reads: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl InputDevice for StreamingInput {
    fn buffer_size(&self) -> usize {
        self.chunk
    }

    fn data_rate(&self) -> usize {
        32_000
    }

    async fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, AudioError> {
        if !self.every.is_zero() {
            tokio::time::sleep(self.every).await;
        }
        let index = self.reads.fetch_add(1, Ordering::SeqCst);
        let n = self.chunk.min(buf.len());
        buf[..n].fill((index % 251) as u8);
        Ok(n)
    }

    async fn drain(&mut self) {}

    async fn release(&mut self) {}
}

/// Output that accepts everything immediately
pub struct RecordingOutput {
    written: Arc<Mutex<Vec<u8>>>,
}

#[async_trait::async_trait]
impl OutputDevice for RecordingOutput {
    fn available(&self) -> usize {
        64 * 1024
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<usize, AudioError> {
        self.written.lock().unwrap().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    async fn flush(&mut self) {}

    async fn drain(&mut self) {}

    async fn close(&mut self) {}
}

#[derive(Default)]
pub struct FakeDevices {
    pub input: Mutex<InputMode>,
    pub inputs_opened: AtomicUsize,
    pub outputs_opened: AtomicUsize,
    pub reads: Arc<AtomicUsize>,
    pub written: Arc<Mutex<Vec<u8>>>,
}

impl FakeDevices {
    pub fn set_input(&self, mode: InputMode) {
        *self.input.lock().unwrap() = mode;
    }

    pub fn inputs_opened(&self) -> usize {
        self.inputs_opened.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }
}

impl AudioDevices for FakeDevices {
    fn open_input(&self, _source: InputSource) -> Result<Box<dyn InputDevice>, AudioError> {
        self.inputs_opened.fetch_add(1, Ordering::SeqCst);
        let reads = self.reads.clone();
        match *self.input.lock().unwrap() {
            InputMode::Silent => Ok(Box::new(SilentInput { reads })),
            InputMode::Streaming { chunk, every } => Ok(Box::new(StreamingInput {
                chunk,
                every,
                reads,
            })),
        }
    }

    fn open_output(&self, _target: OutputTarget) -> Result<Box<dyn OutputDevice>, AudioError> {
        self.outputs_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingOutput {
            written: self.written.clone(),
        }))
    }
}

/// Status sink remembering every push
#[derive(Default)]
pub struct Pushes(Mutex<Vec<StatusPush>>);

impl Pushes {
    pub fn all(&self) -> Vec<StatusPush> {
        self.0.lock().unwrap().clone()
    }

    /// Pushes after the first `skip`
    pub fn since(&self, skip: usize) -> Vec<StatusPush> {
        self.all().into_iter().skip(skip).collect()
    }
}

impl StatusSink for Pushes {
    fn push(&self, status: StatusPush) {
        self.0.lock().unwrap().push(status);
    }
}

pub fn server_config() -> ServerConfig {
    ServerConfig {
        host: "assistant.local".to_string(),
        skillset: "kitchen".to_string(),
        api_key: "secret".to_string(),
        ..ServerConfig::default()
    }
}

/// A session wired to fakes, plus handles on the fakes
pub struct Harness {
    pub session: Arc<SessionManager>,
    pub connector: Arc<FakeConnector>,
    pub tokens: Arc<FakeTokens>,
    pub devices: Arc<FakeDevices>,
    pub pushes: Arc<Pushes>,
}

impl Harness {
    pub fn new(tokens: FakeTokens) -> Self {
        Self::with_server(server_config(), tokens)
    }

    pub fn with_server(server: ServerConfig, tokens: FakeTokens) -> Self {
        let connector = Arc::new(FakeConnector::default());
        let tokens = Arc::new(tokens);
        let devices = Arc::new(FakeDevices::default());
        let pushes = Arc::new(Pushes::default());

        let session = SessionManager::new(SessionDeps {
            server,
            log_audio_info: false,
            connector: connector.clone(),
            tokens: tokens.clone(),
            devices: devices.clone(),
            status: pushes.clone(),
            indicator: Arc::new(ConsoleIndicator),
            prompts: Arc::new(SilentPrompts),
            relay: AudioRelay::new(),
        });

        Self {
            session,
            connector,
            tokens,
            devices,
            pushes,
        }
    }
}

/// Poll `condition` every 10ms of (possibly paused) time, for at most `limit`
pub async fn wait_for(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
