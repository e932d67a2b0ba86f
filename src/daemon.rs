//! Daemon: wires the session, local listeners and trigger source together
//!
//! `Daemon::init` performs everything that can fail before the client is
//! useful (binding the local ports, opening the trigger and indicator).
//! `Daemon::run` then drives the session until SIGINT or SIGTERM.

use crate::audio::{self, InputSource, SystemAudio};
use crate::config::Config;
use crate::control::{client_version, ControlChannel};
use crate::error::{ClientError, Result};
use crate::listener;
use crate::relay::AudioRelay;
use crate::session::{IamTokenProvider, SessionDeps, SessionManager, WsConnector};
use crate::status;
use crate::trigger::{self, TriggerEvent, TriggerSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Time allowed for background tasks to wind down after shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// A fully initialised client, ready to run
pub struct Daemon {
    config: Config,
    session: Arc<SessionManager>,
    relay: AudioRelay,
    control: ControlChannel,
    control_listener: TcpListener,
    audio_listener: TcpListener,
    trigger: Option<Box<dyn TriggerSource>>,
    trigger_rx: Option<mpsc::Receiver<TriggerEvent>>,
}

impl Daemon {
    /// Build the collaborators and bind the local ports
    pub async fn init(config: Config) -> Result<Self> {
        let relay = AudioRelay::new();
        let control = ControlChannel::new(client_version());

        let indicator = status::create_indicator(&config.indicator)?;
        let prompts = audio::feedback::create_prompt_player(&config.audio.feedback);
        let devices = Arc::new(SystemAudio::new(&config.audio, relay.clone()));
        let tokens = Arc::new(IamTokenProvider::new(
            &config.server.token_url,
            &config.server.api_key,
        ));

        let bind_address = config.control.bind_address.as_str();
        let control_listener = listener::bind_local(bind_address, config.control.command_port)
            .await
            .map_err(|e| {
                ClientError::Transport(format!(
                    "Cannot bind control port {}:{}: {}",
                    bind_address, config.control.command_port, e
                ))
            })?;
        let audio_listener = listener::bind_local(bind_address, config.control.audio_port)
            .await
            .map_err(|e| {
                ClientError::Transport(format!(
                    "Cannot bind audio port {}:{}: {}",
                    bind_address, config.control.audio_port, e
                ))
            })?;

        let mut trigger = trigger::create_trigger(&config.trigger)?;
        let trigger_rx = match trigger.as_mut() {
            Some(source) => Some(source.start().await?),
            None => None,
        };

        let session = SessionManager::new(SessionDeps {
            server: config.server.clone(),
            log_audio_info: config.logging.log_audio_info,
            connector: Arc::new(WsConnector),
            tokens,
            devices,
            status: Arc::new(control.clone()),
            indicator,
            prompts,
            relay: relay.clone(),
        });

        Ok(Self {
            config,
            session,
            relay,
            control,
            control_listener,
            audio_listener,
            trigger,
            trigger_rx,
        })
    }

    /// Run until a termination signal arrives
    pub async fn run(self) -> Result<()> {
        let Daemon {
            config,
            session,
            relay,
            control,
            control_listener,
            audio_listener,
            mut trigger,
            mut trigger_rx,
        } = self;

        tracing::info!("Starting voxclient {}", client_version());
        tracing::info!(
            "Session server: {} (skillset '{}', trigger {:?})",
            config.server.host,
            config.server.skillset,
            config.trigger.kind
        );

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| ClientError::Config(format!("Failed to set up SIGTERM handler: {}", e)))?;

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        {
            let relay = relay.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                relay.serve(audio_listener, shutdown).await;
            }));
        }
        {
            let control = control.clone();
            let handler = session.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                control.serve(control_listener, handler, shutdown).await;
            }));
        }
        let session_task = tokio::spawn(session.clone().run(shutdown.clone()));

        if trigger_rx.is_none() {
            tracing::info!("No trigger source, captures start from the control channel only");
        }

        loop {
            tokio::select! {
                event = recv_trigger(&mut trigger_rx) => match event {
                    Some(TriggerEvent::Wake) => {
                        if !session.on_wakeup_trigger(InputSource::Microphone).await {
                            tracing::info!(
                                "Wake trigger ignored ({}, wake-up {})",
                                session.connection_state(),
                                if session.is_wakeup_allowed() { "allowed" } else { "not allowed" }
                            );
                        }
                    }
                    None => {
                        tracing::debug!("Trigger source ended");
                        trigger_rx = None;
                    }
                },

                // Handle graceful shutdown (SIGINT from Ctrl+C)
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received SIGINT, shutting down...");
                    break;
                }

                // Handle graceful shutdown (SIGTERM from systemctl stop)
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, shutting down...");
                    break;
                }
            }
        }

        shutdown.cancel();
        if let Some(source) = trigger.as_mut() {
            if let Err(e) = source.stop().await {
                tracing::warn!("Failed to stop trigger source: {}", e);
            }
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, session_task).await.is_err() {
            tracing::warn!("Session did not stop within {:?}", SHUTDOWN_GRACE);
        }
        for task in tasks {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, task).await;
        }

        tracing::info!("Daemon stopped");
        Ok(())
    }
}

async fn recv_trigger(rx: &mut Option<mpsc::Receiver<TriggerEvent>>) -> Option<TriggerEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
