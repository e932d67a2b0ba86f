//! Voxclient - always-on voice client for a remote conversation server
//!
//! Run with `voxclient` or `voxclient daemon` to start the client.
//! Use `voxclient check` to verify credentials and
//! `voxclient control <COMMAND>` to drive a running daemon.

use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;
use voxclient::audio::feedback::{AudioFeedback, PromptSound};
use voxclient::cli::{Cli, Commands};
use voxclient::config::{self, AudioFeedbackConfig, Config, TriggerKind};
use voxclient::control::{DONE, UNKNOWN_COMMAND};
use voxclient::daemon::Daemon;
use voxclient::error::{ClientError, TokenError};
use voxclient::session::{IamTokenProvider, TokenProvider};

/// Configuration missing or invalid
const EXIT_CONFIG: u8 = 1;
/// Local ports, trigger or indicator could not be set up
const EXIT_INIT: u8 = 2;
/// The client stopped with an error
const EXIT_RUNTIME: u8 = 3;

/// Longest wait for the configuration error prompt before exiting
const PROMPT_WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("voxclient={},warn", log_level))),
        )
        .with_target(false)
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("TLS crypto provider already installed");
    }

    let command = cli.command.unwrap_or(Commands::Daemon);

    if let Commands::Config { default: true } = command {
        print!("{}", config::DEFAULT_CONFIG);
        return ExitCode::SUCCESS;
    }

    // Load configuration
    let mut config = match config::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => return config_failure(e),
    };

    // Apply CLI overrides
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if cli.no_tls {
        config.server.tls = false;
    }
    if let Some(kind) = cli.trigger {
        match TriggerKind::from_name(&kind) {
            Some(kind) => config.trigger.kind = kind,
            None => {
                return config_failure(ClientError::Config(format!(
                    "Unknown trigger '{}' (expected key, hotkey, gpio or none)",
                    kind
                )))
            }
        }
    }

    match command {
        Commands::Config { .. } => show_config(&config),
        Commands::Control { command, timeout } => {
            send_control_command(&config, &command, Duration::from_secs(timeout)).await
        }
        Commands::Check => {
            if let Err(e) = config.validate() {
                return config_failure(e);
            }
            check_credentials(&config).await
        }
        Commands::Daemon => {
            if let Err(e) = config.validate() {
                return config_failure(e);
            }
            run_daemon(config).await
        }
    }
}

async fn run_daemon(config: Config) -> ExitCode {
    let daemon = match Daemon::init(config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!("Initialisation failed: {}", e);
            return ExitCode::from(EXIT_INIT);
        }
    };

    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Client stopped: {}", e);
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

/// Report a configuration problem, play its prompt and pick the exit code
fn config_failure(error: ClientError) -> ExitCode {
    tracing::error!("{}", error);

    let sound = match error {
        ClientError::ConfigNotFound(_) => PromptSound::ErrorNoConfigFile,
        _ => PromptSound::ErrorConfig,
    };
    match AudioFeedback::new(&AudioFeedbackConfig::default()) {
        Ok(feedback) => feedback.play_blocking(sound, PROMPT_WAIT),
        Err(e) => tracing::debug!("Cannot play configuration prompt: {}", e),
    }

    ExitCode::from(EXIT_CONFIG)
}

/// Print the effective configuration with secrets masked
fn show_config(config: &Config) -> ExitCode {
    match toml::to_string_pretty(&config.redacted()) {
        Ok(text) => {
            println!("# Effective configuration");
            if let Some(path) = Config::default_path() {
                println!("# Default location: {}", path.display());
            }
            println!();
            print!("{}", text);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: cannot render configuration: {}", e);
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

/// Fetch one token and report the outcome
async fn check_credentials(config: &Config) -> ExitCode {
    let provider = IamTokenProvider::new(&config.server.token_url, &config.server.api_key);
    println!("Requesting token from {}", config.server.token_url);

    match provider.fetch_token().await {
        Ok(token) => {
            println!("Token OK ({} characters)", token.len());
            ExitCode::SUCCESS
        }
        Err(e @ TokenError::Authentication { .. }) => {
            eprintln!("Error: {}", e);
            ExitCode::from(EXIT_CONFIG)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

/// Send one command to the local control port and print the reply
async fn send_control_command(config: &Config, command: &str, timeout: Duration) -> ExitCode {
    match tokio::time::timeout(timeout, control_exchange(config, command)).await {
        Ok(Ok(reply)) => {
            println!("{}", reply);
            if reply == UNKNOWN_COMMAND {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Ok(Err(e)) => {
            eprintln!("Error: {}", e);
            ExitCode::from(EXIT_RUNTIME)
        }
        Err(_) => {
            eprintln!("Error: no reply within {:?}", timeout);
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

fn is_reply(line: &str) -> bool {
    line == DONE || line == UNKNOWN_COMMAND || line.starts_with("OK ")
}

async fn control_exchange(config: &Config, command: &str) -> anyhow::Result<String> {
    let address = (
        config.control.bind_address.as_str(),
        config.control.command_port,
    );
    let stream = TcpStream::connect(address).await.map_err(|e| {
        anyhow::anyhow!(
            "Cannot reach the control port {}:{} (is the daemon running?): {}",
            address.0,
            address.1,
            e
        )
    })?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Greeting first, then status pushes may interleave with the reply
    let greeting = lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow::anyhow!("Control connection closed before greeting"))?;
    tracing::debug!("Greeting: {}", greeting);

    write_half
        .write_all(format!("{}\n", command.trim()).as_bytes())
        .await?;

    while let Some(line) = lines.next_line().await? {
        if is_reply(&line) {
            return Ok(line);
        }
        println!("{}", line);
    }

    anyhow::bail!("Control connection closed before reply")
}
