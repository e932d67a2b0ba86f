// Command-line interface definitions for voxclient
//
// This module is separate so it can be used by both the binary (main.rs)
// and build.rs for generating man pages.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "voxclient")]
#[command(author, version, about = "Always-on voice client for a remote conversation server")]
#[command(long_about = "
Voxclient connects to a remote conversation server over a websocket, streams
microphone audio when woken, and plays the synthesized replies.

SETUP:
  1. Write a config: voxclient config --default > ~/.config/voxclient/config.toml
  2. Fill in server.host, server.skillset and server.api_key
  3. Check credentials: voxclient check
  4. Run: voxclient (to start the daemon)

USAGE:
  Press Enter (default trigger) to talk. A controller can also drive the
  client over the local control port, for example: voxclient control RM
")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<std::path::PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Override the session server host
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// Override the wake trigger (key, hotkey, gpio, none)
    #[arg(long, value_name = "KIND")]
    pub trigger: Option<String>,

    /// Connect with ws:// instead of wss://
    #[arg(long)]
    pub no_tls: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run as daemon (default if no command specified)
    Daemon,

    /// Show the effective configuration (api key masked)
    Config {
        /// Print the documented default configuration instead
        #[arg(long)]
        default: bool,
    },

    /// Send one command to a running daemon's control port and print the reply
    ///
    /// Commands: RM, RAS, OS, OAS, finishedPlaying, EXIT
    Control {
        /// Control command to send
        command: String,

        /// Seconds to wait for a reply
        #[arg(long, default_value = "3")]
        timeout: u64,
    },

    /// Fetch a bearer token once to verify the configured credentials
    Check,
}
