use anyhow::Result;
use rust_mcp_sdk::error::McpSdkError;
use rust_mcp_sdk::mcp_server::server_runtime::create_server;
use rust_mcp_sdk::McpServer;
use rust_mcp_transport::{StdioTransport, TransportOptions};
use std::sync::Arc;
use terminal_mcp::config::Config;
use terminal_mcp::events::EventBus;
use terminal_mcp::mcp::{server_details, ToolHandler};
use terminal_mcp::session::SessionRegistry;
use terminal_mcp::utils::event_log::EventLog;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str) -> Result<()> {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("terminal_mcp={}", level)));

    // stdout carries the protocol, so logs go to stderr.
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))
}

fn map_mcp_sdk_error(err: McpSdkError) -> anyhow::Error {
    anyhow::anyhow!("MCP SDK Error: {:?}", err)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::load()?);
    setup_logging(&config.log_level)?;

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting terminal-mcp server");
    tracing::debug!("Loaded configuration: {:?}", config);

    let event_log = if config.event_log_enabled {
        tracing::info!(path = %config.event_log_file.display(), "Persisting events");
        Some(EventLog::spawn(
            config.event_log_file.clone(),
            config.event_log_max_size_bytes,
        ))
    } else {
        tracing::info!("Event persistence disabled");
        None
    };
    let bus = Arc::new(EventBus::new(config.event_window_capacity, event_log));
    let registry = Arc::new(SessionRegistry::new(Arc::clone(&config), Arc::clone(&bus)));
    let handler = ToolHandler::new(Arc::clone(&registry));

    tracing::info!("Using STDIO transport mode.");
    let transport = StdioTransport::new(TransportOptions::default())
        .map_err(|e| anyhow::anyhow!("Failed to create StdioTransport: {}", e))?;
    let server = create_server(server_details(), transport, handler);

    let outcome = tokio::select! {
        result = server.start() => result.map_err(map_mcp_sdk_error),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            Ok(())
        }
    };

    registry.dispose_all().await;
    bus.flush_log().await;
    if let Err(e) = &outcome {
        tracing::error!(error = %e, "Server stopped with an error");
    }
    tracing::info!("Server shutdown.");
    outcome
}
