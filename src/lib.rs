//! Voxclient: always-on voice client for a remote conversation server
//!
//! This library provides the core functionality for:
//! - Keeping one websocket session to the conversation server alive (token
//!   exchange, bounded reconnect backoff, connection state machine)
//! - Capturing 16kHz mono PCM via cpal or a local relay socket and streaming
//!   it to the server as one turn per wake trigger
//! - Buffering and playing synthesized replies (streamed or fetched by URL)
//! - A local line-protocol control channel for an external controller
//! - Wake triggers from stdin, an evdev key or a GPIO button
//!
//! # Architecture
//!
//! ```text
//!                            ┌─────────────────────────────────────┐
//!                            │              Daemon                 │
//!                            └─────────────────────────────────────┘
//!                                            │
//!                   ┌────────────────────────┼────────────────────────┐
//!                   │                        │                        │
//!                   ▼                        ▼                        ▼
//!          ┌──────────────┐         ┌──────────────┐         ┌──────────────┐
//!          │   Trigger    │         │   Control    │         │ Audio relay  │
//!          │ key/evdev/   │         │   channel    │         │ (raw PCM     │
//!          │    gpio      │         │ (TCP lines)  │         │  over TCP)   │
//!          └──────────────┘         └──────────────┘         └──────────────┘
//!                   │ wake                   │ RM/RAS/OS/OAS          │
//!                   ▼                        ▼                        │
//!          ┌─────────────────────────────────────────────────────────────────┐
//!          │                        SessionManager                           │
//!          │  retry loop ─▶ token ─▶ connect ─▶ READY ─▶ turns ─▶ ...         │
//!          │  wake gate · connection state · turn state · dispatch           │
//!          └─────────────────────────────────────────────────────────────────┘
//!                   │                        ▲                        │
//!                   ▼                        │ JSON actions           ▼
//!          ┌──────────────┐         ┌──────────────┐         ┌──────────────┐
//!          │ AudioCapture │────────▶│  Transport   │────────▶│AudioPlayback │
//!          │ (mic/relay)  │ audio_* │ (websocket)  │ audio_* │(speaker/relay│
//!          └──────────────┘         └──────────────┘         └──────────────┘
//! ```

pub mod audio;
pub mod cli;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod listener;
pub mod pipeline;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod state;
pub mod status;
pub mod sync;
pub mod trigger;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use daemon::Daemon;
pub use error::{ClientError, Result};
pub use session::{SessionDeps, SessionManager};
pub use state::ConnectionState;
