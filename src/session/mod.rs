//! Session manager
//!
//! Keeps the link to the session server alive, decides when a capture may
//! start, and dispatches server actions to the playback pipeline and the
//! controller.
//!
//! # Retry Loop
//!
//! While the link is not READY the loop drives it back:
//!
//! ```text
//! NOT_CONNECTED --token+connect--> CONNECTING --open--> CONNECTED --options--> READY
//!       ^                              |
//!       +------ backoff exhausted -----+
//! ```
//!
//! Once READY the loop sleeps on the state watch until something changes.

pub mod gate;
pub mod link;
pub mod token;
pub mod transport;

pub use gate::{WakeGate, FAILSAFE_DELAY};
pub use link::ConnectionLink;
pub use token::{IamTokenProvider, TokenProvider};
pub use transport::{
    session_url, ConnectRequest, Connector, EventSender, LinkEvent, LinkHandle, Outbound,
    WsConnector,
};

use crate::audio::feedback::{PromptPlayer, PromptSound};
use crate::audio::{AudioDevices, InputSource, OutputTarget};
use crate::config::ServerConfig;
use crate::control::{ControlHandler, StatusPush, StatusSink};
use crate::error::{ClientError, TokenError};
use crate::pipeline::{AudioCapture, AudioPlayback, CaptureHost};
use crate::protocol::{Card, ClientAction, LocalCommand, Prompt, ServerAction, TtsOptions};
use crate::relay::AudioRelay;
use crate::state::ConnectionState;
use crate::status::StatusIndicator;
use crate::sync::lock;
use serde_json::Value;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// First reconnect delay
pub const MIN_RETRY_DELAY: Duration = Duration::from_secs(8);

/// Reconnect delay after which a stuck connect is abandoned
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Pause after issuing a connect
const CONNECT_PAUSE: Duration = Duration::from_millis(1500);

/// Pause between closing the transport and declaring it gone
const DISCONNECT_PAUSE: Duration = Duration::from_millis(800);

/// Indicator blink while a turn is playing
const PLAYBACK_BLINK: Duration = Duration::from_millis(500);

const URL_FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const URL_FETCH_LIMIT: u64 = 16 * 1024 * 1024;

/// Outcome of one CONNECTING pass of the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Keep waiting for the pending connect
    Wait(Duration),
    /// Give up on the pending connect and start over after this delay
    Exhausted(Duration),
}

impl BackoffStep {
    pub fn delay(&self) -> Duration {
        match self {
            BackoffStep::Wait(d) | BackoffStep::Exhausted(d) => *d,
        }
    }
}

/// Reconnect delay growing one second per pass between two bounds
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(MIN_RETRY_DELAY, MAX_RETRY_DELAY)
    }
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: min,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Advance one pass
    ///
    /// Grows the delay by a second until it reaches the maximum; the pass
    /// after that reports exhaustion and starts again from the minimum.
    pub fn step(&mut self) -> BackoffStep {
        if self.current < self.max {
            self.current = (self.current + Duration::from_secs(1)).min(self.max);
            BackoffStep::Wait(self.current)
        } else {
            self.current = self.min;
            BackoffStep::Exhausted(self.max)
        }
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Bookkeeping of the server's current spoken answer
#[derive(Default)]
struct TurnState {
    current: Option<String>,
    previous: Option<String>,
    /// Follow-up instruction from the latest `text`
    prompt: Prompt,
    /// Turn whose end-of-turn continuation has not run yet
    pending_end: Option<String>,
    /// Audio for this turn comes from a URL instead of `audio_data`
    url_mode: bool,
    url_fetch: Option<JoinHandle<Result<Vec<u8>, ClientError>>>,
}

/// Per-turn timings reported when audio info logging is on
#[derive(Debug, Default, Clone)]
pub struct PerfLog {
    pub opened: Option<Instant>,
    pub transcript: Option<Instant>,
    pub response: Option<Instant>,
    pub audio_start: Option<Instant>,
    pub audio_end: Option<Instant>,
    pub packets: u64,
    pub bytes: u64,
}

fn millis_between(from: Option<Instant>, to: Option<Instant>) -> u128 {
    match (from, to) {
        (Some(from), Some(to)) => to.saturating_duration_since(from).as_millis(),
        _ => 0,
    }
}

impl PerfLog {
    /// Start a new turn at `opened`
    pub fn reset(&mut self, opened: Instant) {
        *self = PerfLog {
            opened: Some(opened),
            ..PerfLog::default()
        };
    }

    pub fn summary(&self) -> String {
        format!(
            "Turn timings (ms): transcript={} response={} audio_start={} audio_data={} packets={} bytes={}",
            millis_between(self.opened, self.transcript),
            millis_between(self.transcript, self.response),
            millis_between(self.transcript, self.audio_start),
            millis_between(self.audio_start, self.audio_end),
            self.packets,
            self.bytes,
        )
    }
}

/// Collaborators of a [`SessionManager`]
pub struct SessionDeps {
    pub server: ServerConfig,
    pub log_audio_info: bool,
    pub connector: Arc<dyn Connector>,
    pub tokens: Arc<dyn TokenProvider>,
    pub devices: Arc<dyn AudioDevices>,
    pub status: Arc<dyn StatusSink>,
    pub indicator: Arc<dyn StatusIndicator>,
    pub prompts: Arc<dyn PromptPlayer>,
    pub relay: AudioRelay,
}

type EventReceiver = mpsc::UnboundedReceiver<(u64, LinkEvent)>;

pub struct SessionManager {
    server: ServerConfig,
    /// None when the host does not form a valid URL
    url: Option<String>,
    log_audio_info: bool,

    link: ConnectionLink,
    gate: Arc<WakeGate>,
    capture: Arc<AudioCapture>,
    playback: Arc<AudioPlayback>,

    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    status: Arc<dyn StatusSink>,
    indicator: Arc<dyn StatusIndicator>,
    prompts: Arc<dyn PromptPlayer>,
    relay: AudioRelay,

    /// Epoch of the newest connect; events tagged otherwise are stale
    epoch: AtomicU64,
    transport: Mutex<Option<(u64, LinkHandle)>>,
    events_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    events_rx: Mutex<Option<EventReceiver>>,

    turn: Mutex<TurnState>,
    perf: Mutex<PerfLog>,
    weak: Weak<SessionManager>,
}

/// Sleep unless cancelled first; false if cancelled
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

impl SessionManager {
    pub fn new(deps: SessionDeps) -> Arc<Self> {
        let SessionDeps {
            server,
            log_audio_info,
            connector,
            tokens,
            devices,
            status,
            indicator,
            prompts,
            relay,
        } = deps;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let url = match session_url(&server) {
            Ok(url) => Some(url.to_string()),
            Err(e) => {
                tracing::error!("Invalid session URL for host '{}': {}", server.host, e);
                None
            }
        };

        Arc::new_cyclic(|weak| Self {
            url,
            server,
            log_audio_info,
            link: ConnectionLink::new(status.clone(), indicator.clone()),
            gate: WakeGate::new(status.clone(), FAILSAFE_DELAY),
            capture: AudioCapture::new(
                devices.clone(),
                status.clone(),
                indicator.clone(),
                log_audio_info,
            ),
            playback: AudioPlayback::new(devices),
            connector,
            tokens,
            status,
            indicator,
            prompts,
            relay,
            epoch: AtomicU64::new(0),
            transport: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            turn: Mutex::new(TurnState::default()),
            perf: Mutex::new(PerfLog::default()),
            weak: weak.clone(),
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn connection_state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Receiver notified on every connection state change
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.link.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.link.state().is_ready()
    }

    /// Whether a trigger would currently start a capture
    pub fn is_wakeup_allowed(&self) -> bool {
        self.gate.is_allowed() && self.is_ready()
    }

    /// Turn id of the answer currently playing
    pub fn current_turn(&self) -> Option<String> {
        lock(&self.turn).current.clone()
    }

    pub fn wake_gate(&self) -> &Arc<WakeGate> {
        &self.gate
    }

    pub fn capture(&self) -> &Arc<AudioCapture> {
        &self.capture
    }

    pub fn playback(&self) -> &Arc<AudioPlayback> {
        &self.playback
    }

    /// Timings of the latest turn
    pub fn perf(&self) -> PerfLog {
        lock(&self.perf).clone()
    }

    // ========================================================================
    // Retry loop
    // ========================================================================

    /// Run the session until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(events) = lock(&self.events_rx).take() else {
            tracing::error!("Session is already running");
            return;
        };

        let pump = tokio::spawn(self.clone().pump_events(events, cancel.clone()));

        self.retry_loop(&cancel).await;

        let _ = pump.await;
        self.shutdown().await;
        tracing::info!("Session stopped");
    }

    async fn retry_loop(&self, cancel: &CancellationToken) {
        let mut state_rx = self.link.subscribe();
        let mut backoff = Backoff::default();
        let mut token_failure_reported = false;
        let mut attempts: u64 = 0;

        while !cancel.is_cancelled() {
            let state = *state_rx.borrow_and_update();

            if state.is_ready() {
                attempts = 0;
                backoff.reset();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = state_rx.changed() => if changed.is_err() { break },
                }
                continue;
            }

            attempts += 1;
            if self.capture.is_open() {
                tracing::info!("Server connection is not ready, closing the microphone");
                self.capture.close();
            }

            match state {
                ConnectionState::NotConnected => {
                    let token = match self.tokens.fetch_token().await {
                        Ok(token) => {
                            token_failure_reported = false;
                            token
                        }
                        Err(e) => {
                            tracing::error!("Could not get an access token: {}", e);
                            if !token_failure_reported {
                                token_failure_reported = true;
                                self.prompts.play(match e {
                                    TokenError::Authentication { .. } => PromptSound::ErrorAuth,
                                    TokenError::Connection(_) => PromptSound::ErrorNetwork,
                                });
                            }
                            if !pause(cancel, backoff.current()).await {
                                break;
                            }
                            continue;
                        }
                    };

                    self.connect(token).await;
                    if !pause(cancel, CONNECT_PAUSE).await {
                        break;
                    }

                    // Failed before the pause ended; do not hammer the server
                    if self.link.state() == ConnectionState::NotConnected {
                        let delay = backoff.step().delay();
                        tracing::info!(
                            "Could not connect. Retrying attempt {} in {}s",
                            attempts + 1,
                            delay.as_secs()
                        );
                        if !pause(cancel, delay).await {
                            break;
                        }
                    }
                }

                ConnectionState::Connecting => {
                    let step = backoff.step();
                    if let BackoffStep::Exhausted(_) = step {
                        tracing::warn!("Connect did not complete, starting over");
                        self.abandon_transport();
                        self.link.transition(ConnectionState::NotConnected);
                    }
                    tracing::info!(
                        "Could not connect. Retrying attempt {} in {}s",
                        attempts + 1,
                        step.delay().as_secs()
                    );
                    if !pause(cancel, step.delay()).await {
                        break;
                    }
                }

                ConnectionState::Connected | ConnectionState::Closing => {
                    let waited = tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = tokio::time::timeout(backoff.current(), state_rx.changed()) => changed,
                    };
                    match waited {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => break,
                        Err(_) if state == ConnectionState::Closing => {
                            tracing::warn!("Close handshake did not finish, dropping the connection");
                            self.abandon_transport();
                            self.link.transition(ConnectionState::NotConnected);
                        }
                        Err(_) => {}
                    }
                }

                ConnectionState::Ready => {}
            }
        }
    }

    /// Open a new transport with a fresh token
    async fn connect(&self, token: String) {
        let Some(url) = self.url.clone() else {
            tracing::error!("No valid session URL, not connecting");
            return;
        };

        if self.link.state().is_open() {
            self.disconnect(1000, "Establishing new connection").await;
        }

        self.link.transition(ConnectionState::Connecting);

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let request = ConnectRequest {
            epoch,
            url,
            tenant_id: self.server.tenant_id.clone(),
            token,
        };

        let mut transport = lock(&self.transport);
        if let Some((_, old)) = transport.take() {
            old.close(1000, "Establishing new connection");
        }
        *transport = Some((epoch, self.connector.connect(request, self.events_tx.clone())));
    }

    /// Close the transport and return to NOT_CONNECTED
    pub async fn disconnect(&self, code: u16, reason: &str) {
        let handle = lock(&self.transport).take();
        let Some((_, handle)) = handle else {
            return;
        };

        self.capture.close();
        self.playback.cancel().await;

        handle.close(code, reason);
        tokio::time::sleep(DISCONNECT_PAUSE).await;
        self.link.transition(ConnectionState::NotConnected);
    }

    /// Forget the current transport; its late events become stale
    fn abandon_transport(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some((_, handle)) = lock(&self.transport).take() {
            handle.close(1000, "Connect abandoned");
        }
    }

    /// Stop captures, playback and the transport
    pub async fn shutdown(&self) {
        self.capture.shutdown().await;
        self.playback.stop().await;
        self.gate.disallow();

        let handle = lock(&self.transport).take();
        if let Some((_, handle)) = handle {
            self.link.transition(ConnectionState::Closing);
            handle.close(1000, "Client shutdown");
        }
        self.indicator.off();
    }

    // ========================================================================
    // Transport events
    // ========================================================================

    async fn pump_events(self: Arc<Self>, mut events: EventReceiver, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some((epoch, event)) => self.handle_link_event(epoch, event).await,
                    None => break,
                },
            }
        }
    }

    async fn handle_link_event(&self, epoch: u64, event: LinkEvent) {
        if epoch != self.epoch.load(Ordering::SeqCst) {
            tracing::debug!("Ignoring {:?} from stale connection {}", event, epoch);
            return;
        }

        match event {
            LinkEvent::Opened => self.on_open(),

            LinkEvent::Message(text) => self.handle_inbound_action(&text).await,

            LinkEvent::Closing { code, reason } => {
                tracing::info!("Server is closing the connection: code={} reason={}", code, reason);
                self.link.transition(ConnectionState::Closing);
            }

            LinkEvent::Closed { code, reason } => {
                tracing::info!("Server connection closed: code={} reason={}", code, reason);
                self.on_transport_gone(epoch);
            }

            LinkEvent::Failed(message) => {
                tracing::error!("Server connection failed: {}", message);
                self.on_transport_gone(epoch);
            }
        }
    }

    fn on_open(&self) {
        self.link.transition(ConnectionState::Connected);

        self.send_to_server(ClientAction::stt_options(&self.server.engine));
        self.send_to_server(ClientAction::tts_options(
            &self.server.engine,
            &self.server.voice,
            self.server.url_tts,
        ));

        self.link.transition(ConnectionState::Ready);
        self.allow_wakeup();

        if let Some(greeting) = self.server.greeting.as_deref() {
            self.say(greeting);
        }
    }

    fn on_transport_gone(&self, epoch: u64) {
        {
            let mut transport = lock(&self.transport);
            if transport.as_ref().map(|(e, _)| *e) == Some(epoch) {
                transport.take();
            }
        }
        self.capture.close();
        self.link.transition(ConnectionState::NotConnected);
    }

    /// Queue a message for the server; false unless the link is open
    pub fn send_to_server(&self, action: ClientAction) -> bool {
        if !self.link.state().is_open() {
            tracing::debug!(target: "voxclient::wire::send", "Not connected, dropping {}", action.name());
            return false;
        }

        let text = match action.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Could not encode {}: {}", action.name(), e);
                return false;
            }
        };

        if matches!(action, ClientAction::AudioData { .. }) {
            tracing::trace!(target: "voxclient::wire::send", "{} ({} chars)", action.name(), text.len());
        } else {
            tracing::debug!(target: "voxclient::wire::send", "{}", text);
        }

        match lock(&self.transport).as_ref() {
            Some((_, handle)) => handle.send_text(text),
            None => false,
        }
    }

    /// Ask the server to speak `text`
    pub fn say(&self, text: &str) -> bool {
        let options = serde_json::to_value(TtsOptions::new(&self.server.engine, &self.server.voice))
            .unwrap_or(Value::Null);
        self.send_to_server(ClientAction::tts(text, options))
    }

    // ========================================================================
    // Inbound actions
    // ========================================================================

    /// Dispatch one message from the server
    pub async fn handle_inbound_action(&self, text: &str) {
        let action = match ServerAction::parse(text) {
            Ok(action) => action,
            Err(e) => {
                tracing::error!("Dropping malformed server message: {}", e);
                tracing::debug!(target: "voxclient::wire::recv", "{}", text);
                return;
            }
        };

        if matches!(action, ServerAction::AudioData { .. }) {
            tracing::trace!(target: "voxclient::wire::recv", "audio_data");
        } else {
            tracing::debug!(target: "voxclient::wire::recv", "{}", text);
        }

        match action {
            ServerAction::Error { message } => {
                tracing::warn!("Server error: {}", message);
            }

            ServerAction::SttTranscript {
                transcript,
                confidence,
                transaction_id,
            } => {
                lock(&self.perf).transcript = Some(Instant::now());
                tracing::info!(
                    "Transcript: '{}' confidence {:.2}% transaction '{}'",
                    transcript,
                    confidence * 100.0,
                    transaction_id
                );
                self.capture.close();
            }

            ServerAction::Text {
                speech,
                voice,
                prompt,
            } => self.on_text(&speech, voice, prompt),

            ServerAction::Response { card, text } => self.on_response(card, &text).await,

            ServerAction::AudioStart { id } => self.on_audio_start(id).await,

            ServerAction::AudioData { id, bytes } => self.on_audio_data(&id, &bytes),

            ServerAction::AudioEnd { id } => self.on_audio_end(&id).await,

            ServerAction::Unknown { action } => {
                tracing::debug!("Ignoring server action '{}'", action);
            }
        }
    }

    fn on_text(&self, speech: &str, voice: Option<String>, prompt: Prompt) {
        tracing::info!("Text: \"{}\"", speech);
        tracing::debug!("Prompt after this answer: {:?}", prompt);

        let url = voice.filter(|_| self.server.url_tts && !self.server.mute);

        let mut turn = lock(&self.turn);
        turn.prompt = prompt;
        turn.url_mode = url.is_some();
        if let Some(previous) = turn.url_fetch.take() {
            previous.abort();
        }
        if let Some(url) = url {
            tracing::debug!("Answer audio will be fetched from {}", url);
            turn.url_fetch = Some(tokio::task::spawn_blocking(move || fetch_audio_url(&url)));
        }
    }

    async fn on_response(&self, card: Option<Card>, text: &str) {
        lock(&self.perf).response = Some(Instant::now());
        let mut reopen_gate = true;

        match card {
            Some(Card::Command(command)) => match command {
                LocalCommand::PlaybackResume => {
                    tracing::debug!("Server requested playback resume");
                    self.status.push(StatusPush::PlaybackResume);
                }
                LocalCommand::PlaybackStop => {
                    tracing::debug!("Server requested playback stop");
                    lock(&self.turn).current = None;
                    self.playback.stop().await;
                    self.status.push(StatusPush::PlaybackStop);
                    // The end of the turn reopens the gate
                    reopen_gate = false;
                }
                LocalCommand::VolumeDecrease => self.status.push(StatusPush::VolumeDown),
                LocalCommand::VolumeIncrease => self.status.push(StatusPush::VolumeUp),
                LocalCommand::VolumeMute => self.status.push(StatusPush::VolumeMute),
                LocalCommand::VolumeUnmute => self.status.push(StatusPush::VolumeUnmute),
                LocalCommand::Unknown { feature, action } => {
                    tracing::warn!("Unknown local command: feature {} action {}", feature, action);
                }
            },

            Some(Card::Other) => {}

            None => {
                let barge_in = {
                    let mut turn = lock(&self.turn);
                    let differs = matches!(
                        (&turn.current, &turn.previous),
                        (Some(current), Some(previous)) if current != previous
                    );
                    if differs {
                        tracing::debug!(
                            "New answer without a card, treating as stop. Current {:?} previous {:?}",
                            turn.current,
                            turn.previous
                        );
                        turn.previous = None;
                    }
                    differs
                };
                if barge_in {
                    self.status.push(StatusPush::PlaybackStop);
                    reopen_gate = false;
                }
            }
        }

        tracing::debug!("Response \"{}\"", text);

        if reopen_gate {
            self.allow_wakeup();
        }
    }

    async fn on_audio_start(&self, id: String) {
        lock(&self.perf).audio_start = Some(Instant::now());
        {
            let mut turn = lock(&self.turn);
            turn.previous = turn.current.replace(id.clone());
            turn.pending_end = Some(id.clone());
        }

        if self.capture.is_open() {
            self.capture.close();
        }

        let weak = self.weak.clone();
        let finished_id = id.clone();
        self.playback.enable();
        self.playback
            .start(Box::new(move || {
                if let Some(session) = weak.upgrade() {
                    tokio::spawn(async move {
                        session.end_of_turn(Some(&finished_id)).await;
                    });
                }
            }))
            .await;

        self.indicator.blink(PLAYBACK_BLINK);
        tracing::debug!("Answer {} started", id);
    }

    fn on_audio_data(&self, id: &str, bytes: &[u8]) {
        {
            let turn = lock(&self.turn);
            if turn.url_mode {
                tracing::debug!("Answer plays from URL, ignoring audio_data");
                return;
            }
            if turn.current.as_deref() != Some(id) {
                tracing::warn!("Out of sequence audio_data dropped");
                return;
            }
        }

        {
            let mut perf = lock(&self.perf);
            perf.packets += 1;
            perf.bytes += bytes.len() as u64;
        }

        if self.server.mute {
            tracing::trace!("Muted, dropping {} bytes", bytes.len());
            return;
        }
        self.playback.write(bytes);
    }

    async fn on_audio_end(&self, id: &str) {
        let fetch = {
            let mut turn = lock(&self.turn);
            if turn.current.as_deref() != Some(id) {
                tracing::warn!("Out of sequence audio_end ignored");
                return;
            }
            turn.url_mode = false;
            turn.url_fetch.take()
        };

        let perf = {
            let mut perf = lock(&self.perf);
            perf.audio_end = Some(Instant::now());
            perf.clone()
        };
        if self.log_audio_info {
            tracing::info!("{}", perf.summary());
        }

        match fetch {
            None => self.playback.finish().await,
            Some(fetch) => {
                let weak = self.weak.clone();
                let id = id.to_string();
                tokio::spawn(async move {
                    let fetched = fetch.await;
                    let Some(session) = weak.upgrade() else {
                        return;
                    };
                    if session.current_turn().as_deref() != Some(id.as_str()) {
                        tracing::debug!("Answer {} was replaced while its audio was fetched", id);
                        return;
                    }
                    match fetched {
                        Ok(Ok(bytes)) => session.playback.write(&bytes),
                        Ok(Err(e)) => tracing::warn!("Could not fetch answer audio: {}", e),
                        Err(e) => tracing::warn!("Answer audio fetch did not complete: {}", e),
                    }
                    session.playback.finish().await;
                });
            }
        }
    }

    /// Close the turn and continue the conversation
    ///
    /// With `expected` set, only runs if that turn's continuation is the one
    /// pending.
    async fn end_of_turn(&self, expected: Option<&str>) {
        let prompt = {
            let mut turn = lock(&self.turn);
            match (turn.pending_end.as_deref(), expected) {
                (None, _) => return,
                (Some(pending), Some(expected)) if pending != expected => return,
                _ => {}
            }
            let pending = turn.pending_end.take();
            if expected.is_some() && turn.current == pending {
                turn.current = None;
            }
            std::mem::take(&mut turn.prompt)
        };

        self.indicator.off();

        if prompt.should_prompt() {
            tracing::info!("Answer finished, prompting for a reply");
            self.gate.disallow();
            self.capture.set_stt_options(prompt.stt_options());
            if let Some(host) = self.host() {
                self.capture.capture(host).await;
            }
        } else {
            self.allow_wakeup();
        }
    }

    fn host(&self) -> Option<Arc<dyn CaptureHost>> {
        self.weak
            .upgrade()
            .map(|session| session as Arc<dyn CaptureHost>)
    }

    /// Open the wake gate, closing the microphone if it was left open
    fn allow_wakeup(&self) {
        if self.capture.is_open() {
            self.capture.close();
        }
        self.gate.allow();
    }

    // ========================================================================
    // Controller and trigger entry points
    // ========================================================================

    /// Start a capture from `source` if the gate is open and the link READY
    pub async fn on_wakeup_trigger(&self, source: InputSource) -> bool {
        if !self.is_ready() {
            tracing::debug!("Wake trigger ignored, server connection is {}", self.link.state());
            return false;
        }
        if !self.gate.try_close() {
            tracing::debug!("Wake trigger not allowed, ignored");
            return false;
        }

        tracing::debug!("Wake trigger accepted from {}", source);
        self.playback.cancel().await;
        self.playback.enable();

        // The interrupted answer never reaches its end of turn
        {
            let mut turn = lock(&self.turn);
            turn.pending_end = None;
            turn.prompt = Prompt::default();
            turn.url_mode = false;
            if let Some(fetch) = turn.url_fetch.take() {
                fetch.abort();
            }
        }
        self.capture.set_input_source(source);
        lock(&self.perf).reset(Instant::now());

        match self.host() {
            Some(host) => {
                self.capture.capture(host).await;
                true
            }
            None => false,
        }
    }

    /// The controller finished playing the answer itself
    pub async fn finished_playing(&self) {
        tracing::debug!("Controller finished playing");
        lock(&self.turn).current = None;
        self.indicator.off();
        self.end_of_turn(None).await;
    }

    pub fn set_output_target(&self, target: OutputTarget) {
        tracing::debug!("Answers now play on {}", target);
        self.playback.set_target(target);
    }
}

/// Download answer audio (raw PCM) from `url`
fn fetch_audio_url(url: &str) -> Result<Vec<u8>, ClientError> {
    let response = ureq::get(url)
        .timeout(URL_FETCH_TIMEOUT)
        .call()
        .map_err(|e| ClientError::Transport(format!("GET {}: {}", url, e)))?;

    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(URL_FETCH_LIMIT)
        .read_to_end(&mut bytes)?;
    Ok(bytes)
}

#[async_trait::async_trait]
impl CaptureHost for SessionManager {
    fn is_ready(&self) -> bool {
        SessionManager::is_ready(self)
    }

    fn send_to_server(&self, action: ClientAction) -> bool {
        SessionManager::send_to_server(self, action)
    }

    async fn on_capture_finished(&self) {
        self.allow_wakeup();
        self.gate.arm_failsafe();
    }
}

#[async_trait::async_trait]
impl ControlHandler for SessionManager {
    async fn on_wakeup_trigger(&self, source: InputSource) -> bool {
        SessionManager::on_wakeup_trigger(self, source).await
    }

    async fn set_output_target(&self, target: OutputTarget) -> bool {
        SessionManager::set_output_target(self, target);
        true
    }

    async fn finished_playing(&self) -> bool {
        SessionManager::finished_playing(self).await;
        true
    }

    fn wake_status(&self) -> StatusPush {
        StatusPush::for_wake_gate(self.is_wakeup_allowed())
    }

    fn connection_status(&self) -> StatusPush {
        StatusPush::for_state(self.connection_state())
    }

    fn recycle_audio_relay(&self) {
        self.relay.close_current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_to_bound_then_resets() {
        let mut backoff = Backoff::default();
        let mut delays = Vec::new();
        loop {
            match backoff.step() {
                BackoffStep::Wait(d) => delays.push(d.as_secs()),
                BackoffStep::Exhausted(d) => {
                    assert_eq!(d, MAX_RETRY_DELAY);
                    break;
                }
            }
        }
        assert_eq!(delays, vec![9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(backoff.current(), MIN_RETRY_DELAY);
    }

    #[test]
    fn test_backoff_is_non_decreasing_until_exhausted() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(4));
        let mut last = backoff.current();
        for _ in 0..2 {
            let step = backoff.step();
            assert!(matches!(step, BackoffStep::Wait(_)));
            assert!(step.delay() >= last);
            assert!(step.delay() <= Duration::from_secs(4));
            last = step.delay();
        }
        assert!(matches!(backoff.step(), BackoffStep::Exhausted(_)));
        assert_eq!(backoff.current(), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::default();
        backoff.step();
        backoff.step();
        backoff.reset();
        assert_eq!(backoff.current(), MIN_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_perf_summary_with_missing_marks() {
        let start = Instant::now();
        let mut perf = PerfLog::default();
        perf.reset(start);
        perf.transcript = Some(start + Duration::from_millis(700));
        perf.packets = 3;
        perf.bytes = 1200;

        let summary = perf.summary();
        assert!(summary.contains("transcript=700"));
        assert!(summary.contains("response=0"));
        assert!(summary.contains("packets=3"));
        assert!(summary.contains("bytes=1200"));
    }
}
