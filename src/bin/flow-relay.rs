//! Run a single job and print its events as JSON lines.
//!
//! Usage: `flow-relay [JOB_FILE]` (reads the job from stdin when no file is given).

use std::process::ExitCode;
use std::sync::Arc;

use flow_relay::{FlowRelay, JsonLinesPublisher, RawJob, RelayConfig, telemetry};
use tokio::io::AsyncReadExt;

#[tokio::main]
async fn main() -> ExitCode {
    let _guard = match telemetry::init_from_env() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("flow-relay: {e}");
            return ExitCode::from(2);
        }
    };

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error=%e, "Invalid configuration");
            return ExitCode::from(2);
        }
    };

    let body = match read_job(std::env::args().nth(1)).await {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error=%e, "Failed to read job");
            return ExitCode::from(2);
        }
    };

    let publisher = Arc::new(JsonLinesPublisher::new(tokio::io::stdout()));
    let relay = match FlowRelay::from_config(&config, publisher) {
        Ok(relay) => relay,
        Err(e) => {
            tracing::error!(error=%e, "Failed to start relay");
            return ExitCode::from(2);
        }
    };

    let report = relay.handle(RawJob::from(body)).await;
    tracing::info!(
        execution_id=%report.execution_id,
        terminal=?report.terminal,
        stream_events=report.stream_events,
        "Job handled"
    );
    ExitCode::SUCCESS
}

async fn read_job(path: Option<String>) -> std::io::Result<Vec<u8>> {
    match path {
        Some(path) => tokio::fs::read(path).await,
        None => {
            let mut body = Vec::new();
            tokio::io::stdin().read_to_end(&mut body).await?;
            Ok(body)
        }
    }
}
