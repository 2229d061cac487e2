/// Mechaflow: suspendable workflow execution engine
///
/// Main entry point for the Mechaflow server. Loads configuration from the
/// environment and starts the HTTP server, the cron trigger source and the
/// queue worker.

use mechaflow::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Run submission and control at /api/runs/*
/// - Pause tokens at /api/pauses/*
/// - Trigger registration at /api/triggers and webhook events at /webhook/{trigger_type}
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Defaults to 0.0.0.0:3004 and sqlite://data/mechaflow.db
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
