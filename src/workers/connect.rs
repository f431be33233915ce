use super::WorkerContext;
use crate::error::{AppError, AppResult};
use crate::llm::LlmClient;
use crate::logging::LogLevel;
use crate::runner::{ConnectConfig, ConnectReport, TaskResult};
use crate::tunnel::{
    bind_local, find_free_local_port, preferred_local_port, spawn_local_forward, HealthMonitor,
    TunnelResources,
};
use std::collections::HashSet;
use std::sync::Arc;

const STEPS: u32 = 6;

/// Open a session, forward a local port to the LLM server, and leave the
/// tunnel running under a detached context.
///
/// Health and route checks are advisory. Any failure before the tunnel is
/// handed off releases everything acquired so far.
pub async fn run(ctx: &WorkerContext, config: ConnectConfig) -> AppResult<TaskResult> {
    let mut resources = TunnelResources::new(
        &config.server_id,
        config.remote_port,
        ctx.shutdown.child_token(),
    );

    let established = establish(ctx, &config, &mut resources).await;
    let (healthy, fingerprint) = match established {
        Ok(checks) => checks,
        Err(e) => {
            resources.release().await;
            return Err(e);
        }
    };

    if ctx.cancel.is_cancelled() {
        resources.release().await;
        return Err(AppError::Cancelled("connect interrupted".into()));
    }

    let tunnel = resources
        .detach()
        .ok_or_else(|| AppError::Connect("tunnel was not established".into()))?;
    ctx.log(
        LogLevel::Info,
        format!(
            "Tunnel up: 127.0.0.1:{} -> {}:{}",
            tunnel.local_port(),
            config.target.host,
            config.remote_port
        ),
    );

    Ok(TaskResult::Connected(ConnectReport {
        tunnel,
        healthy,
        fingerprint,
    }))
}

async fn establish(
    ctx: &WorkerContext,
    config: &ConnectConfig,
    resources: &mut TunnelResources,
) -> AppResult<(bool, Option<String>)> {
    let settings = &ctx.settings().tunnel;

    ctx.progress("Selecting local port", 1, STEPS);
    let start = config
        .local_port
        .unwrap_or_else(|| preferred_local_port(config.remote_port, settings.port_offset));
    let reserved: HashSet<u16> = config.reserved_ports.iter().copied().collect();
    let local_port = find_free_local_port(start, settings.port_search_window, &reserved)?;
    if local_port != start {
        ctx.log(
            LogLevel::Info,
            format!("Local port {} is busy, using {}", start, local_port),
        );
    }

    ctx.progress(format!("Opening SSH session to {}", config.target.address()), 2, STEPS);
    let session = ctx.connect(&config.target).await?;
    let fingerprint = session.host_fingerprint();
    resources.set_session(session.clone());

    ctx.progress(format!("Forwarding local port {}", local_port), 3, STEPS);
    let listener = bind_local(local_port).await?;
    let forward = spawn_local_forward(
        listener,
        session,
        "127.0.0.1".to_string(),
        config.remote_port,
        resources.cancel_token().clone(),
    );
    resources.set_forward(local_port, forward);

    ctx.progress("Probing LLM health", 4, STEPS);
    ctx.sleep(settings.settle_delay()).await?;
    let client = Arc::new(LlmClient::for_local_port(local_port, settings.health_timeout())?);
    let healthy = client.is_healthy().await;
    if !healthy {
        ctx.log(
            LogLevel::Warn,
            format!("LLM server did not pass its first health check on port {}", local_port),
        );
    }

    ctx.progress("Checking API routes", 5, STEPS);
    if healthy {
        for route in &settings.sanity_routes {
            match client.probe_route(route).await {
                Ok(status) if status.is_success() => {
                    ctx.log(LogLevel::Debug, format!("{} -> {}", route, status))
                }
                Ok(status) => ctx.log(LogLevel::Warn, format!("{} -> {}", route, status)),
                Err(e) => ctx.log(LogLevel::Warn, format!("{} failed: {}", route, e)),
            }
        }
    } else {
        ctx.log(LogLevel::Debug, "Skipping API route checks");
    }

    ctx.progress("Starting health monitor", 6, STEPS);
    let monitor = HealthMonitor::spawn(
        config.server_id.clone(),
        local_port,
        client,
        settings.health_interval(),
        ctx.health_sink(),
        resources.cancel_token().child_token(),
    );
    resources.set_monitor(monitor);

    Ok((healthy, fingerprint))
}
