use async_trait::async_trait;
use eyre::{Result, eyre};
use std::path::PathBuf;
use tracing::{error, info, warn};

use lambda_live_core::AppContext;
use lambda_live_proto::{Event, EventKind};

use super::{Command, Overrides, resolve_config};

const REPORTED: [EventKind; 7] = [
    EventKind::BuildStarted,
    EventKind::BuildSucceeded,
    EventKind::BuildFailed,
    EventKind::WorkerStarted,
    EventKind::WorkerStopped,
    EventKind::WorkerExited,
    EventKind::WorkerStdout,
];

pub struct StartCommand {
    pub config: Option<PathBuf>,
    pub overrides: Overrides,
}

#[async_trait]
impl Command for StartCommand {
    async fn execute(&self) -> Result<()> {
        let config = resolve_config(self.config.as_deref(), self.overrides)?;
        let context = AppContext::start(config)
            .await
            .map_err(|e| eyre!("Failed to start live session: {}", e))?;

        if context.config().debug {
            let runtime_api = context.runtime_url().trim_start_matches("http://");
            for function_id in context.config().functions.keys() {
                info!(
                    function_id = %function_id,
                    runtime_api = %format!("{runtime_api}/{function_id}"),
                    "Point your debugger's runtime client here"
                );
            }
        }
        info!("Press Ctrl+C to stop");

        let mut events = context.bus().subscribe_channel(&REPORTED);
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    info!("Shutdown signal received");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => report(&event),
                    None => break,
                },
            }
        }
        drop(events);

        context
            .shutdown()
            .await
            .map_err(|e| eyre!("Failed to shut down cleanly: {}", e))
    }
}

fn report(event: &Event) {
    match event {
        Event::BuildStarted(f) => info!(function_id = %f.function_id, "Building"),
        Event::BuildSucceeded(f) => info!(function_id = %f.function_id, "Build succeeded"),
        Event::BuildFailed(failed) => {
            for message in &failed.errors {
                error!(function_id = %failed.function_id, "{message}");
            }
        }
        Event::WorkerStarted(w) => {
            info!(function_id = %w.function_id, worker_id = %w.worker_id, "Worker started");
        }
        Event::WorkerStopped(w) => {
            info!(function_id = %w.function_id, worker_id = %w.worker_id, "Worker stopped");
        }
        Event::WorkerExited(w) => {
            warn!(function_id = %w.function_id, worker_id = %w.worker_id, "Worker exited");
        }
        Event::WorkerStdout(out) => info!(
            target: "worker",
            function_id = %out.function_id,
            request_id = out.request_id.as_deref().unwrap_or("-"),
            "{}",
            out.message
        ),
        _ => {}
    }
}
