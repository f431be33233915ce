use super::WorkerContext;
use crate::error::{AppError, AppResult};
use crate::logging::LogLevel;
use crate::runner::{DisconnectConfig, TaskResult};
use std::time::Duration;

const STEPS: u32 = 2;

/// Tear down a tunnel through its handle and wait for the acknowledgement.
pub async fn run(ctx: &WorkerContext, config: DisconnectConfig) -> AppResult<TaskResult> {
    let Some(tunnel) = config.tunnel else {
        ctx.progress("No active tunnel", STEPS, STEPS);
        return Ok(TaskResult::Disconnected { local_port: None });
    };

    ctx.progress(format!("Closing tunnel on local port {}", tunnel.local_port()), 1, STEPS);
    tunnel.request_close();

    ctx.progress("Waiting for tunnel shutdown", 2, STEPS);
    let limit = Duration::from_secs(ctx.settings().runner.disconnect_timeout_secs);
    let closed = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(AppError::Cancelled("disconnect interrupted".into())),
        closed = tunnel.wait_closed(limit) => closed,
    };
    if !closed {
        return Err(AppError::Timeout(format!(
            "tunnel on port {} did not close within {:?}",
            tunnel.local_port(),
            limit
        )));
    }

    ctx.log(LogLevel::Info, format!("Tunnel on port {} closed", tunnel.local_port()));
    Ok(TaskResult::Disconnected {
        local_port: Some(tunnel.local_port()),
    })
}
