//! nb - Shared Neural Model Broker
//!
//! CLI entry point for running the broker and talking to it.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, info};

use nnbroker::cli::{Cli, Command};
use nnbroker::config::Config;
use nnbroker::coordinator::Coordinator;
use nnbroker::ipc;
use nnbroker::{BrokerClient, EchoEngine, Registration};

fn parse_level(level_str: Option<&str>) -> tracing::Level {
    match level_str.map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    }
}

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>, to_stderr: bool) -> Result<()> {
    // Priority: CLI --log-level > config file > default (INFO)
    let level = parse_level(cli_log_level.or(config_log_level));
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    if to_stderr {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    } else {
        let log_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nnbroker")
            .join("logs");
        fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

        let log_file = fs::File::create(log_dir.join("nnbroker.log")).context("Failed to create log file")?;

        tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_ansi(false)
            .with_env_filter(filter)
            .init();
    }

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref(), cli.stderr)
        .context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let socket_path = cli.socket.clone().unwrap_or_else(|| config.socket_path());

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Serve => {
            debug!("main: matched Serve command");
            cmd_serve(&config, socket_path).await
        }
        Command::Evaluate {
            resource,
            kind,
            timeout_ms,
            input,
        } => {
            debug!(%resource, %kind, ?timeout_ms, "main: matched Evaluate command");
            cmd_evaluate(&config, socket_path, resource, kind, timeout_ms, &input).await
        }
        Command::Echo { resource, kind } => {
            debug!(%resource, %kind, "main: matched Echo command");
            cmd_echo(&config, socket_path, resource, kind).await
        }
    }
}

/// Run the broker on its socket until Ctrl-C
async fn cmd_serve(config: &Config, socket_path: PathBuf) -> Result<()> {
    debug!(?socket_path, "cmd_serve: called");
    let coord_config = config.coordinator.clone();

    let listener = ipc::bind_socket(&socket_path)?;
    let coordinator = Coordinator::new(coord_config.clone());
    let handle = coordinator.handle();
    let coord_task = tokio::spawn(coordinator.run());

    println!("Broker listening on {}", socket_path.display());
    info!(?socket_path, "Broker listening");

    tokio::select! {
        _ = ipc::serve(
            listener,
            handle.clone(),
            coord_config.session_channel_buffer,
            coord_config.max_message_size,
        ) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Received Ctrl-C, shutting down");
        }
    }

    let metrics = handle.metrics().await?;
    info!(?metrics, "Final coordinator metrics");

    handle.shutdown().await?;
    coord_task.await.context("Coordinator task panicked")?;
    ipc::cleanup_socket(&socket_path);
    Ok(())
}

/// Connect as a consumer, evaluate once and print the output
async fn cmd_evaluate(
    config: &Config,
    socket_path: PathBuf,
    resource: String,
    kind: String,
    timeout_ms: Option<u64>,
    input: &str,
) -> Result<()> {
    debug!(?socket_path, %resource, "cmd_evaluate: called");
    let input: serde_json::Value = serde_json::from_str(input).context("Input is not valid JSON")?;

    let channel = ipc::connect(
        &socket_path,
        config.coordinator.session_channel_buffer,
        config.coordinator.max_message_size,
    )
    .await?;
    let client = BrokerClient::connect(channel, Registration::consumer(resource).with_kind(kind), None, None).await?;
    let session_id = client.registered().await?;
    debug!(session_id, "cmd_evaluate: registered");

    let output = client.evaluate(input, timeout_ms.map(Duration::from_millis)).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    client.unregister().await?;
    Ok(())
}

/// Serve a resource with the echo engine until Ctrl-C or the broker goes away
async fn cmd_echo(config: &Config, socket_path: PathBuf, resource: String, kind: String) -> Result<()> {
    debug!(?socket_path, %resource, "cmd_echo: called");
    let channel = ipc::connect(
        &socket_path,
        config.coordinator.session_channel_buffer,
        config.coordinator.max_message_size,
    )
    .await?;
    let client = BrokerClient::connect(
        channel,
        Registration::server(resource.clone()).with_kind(kind),
        Some(Arc::new(EchoEngine)),
        None,
    )
    .await?;
    let session_id = client.registered().await?;
    println!("Serving '{}' as session {}", resource, session_id);

    tokio::select! {
        _ = client.closed() => {
            println!("Broker closed the connection");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            client.unregister().await?;
        }
    }
    Ok(())
}
