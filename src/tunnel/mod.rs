//! Local port forwards to a remote LLM server
//!
//! A tunnel is built by the connect worker and then outlives the task that
//! created it. The worker owns the [`TunnelResources`]; everyone else holds a
//! [`TunnelHandle`] that can ask for teardown and observe it.

pub mod forward;
pub mod health;
pub mod ports;

pub use forward::spawn_local_forward;
pub use health::{HealthMonitor, HealthProbe, HealthReport};
pub use ports::{bind_local, find_free_local_port, preferred_local_port};

use crate::ssh::RemoteSession;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Serializable view of a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub server_id: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub active: bool,
}

/// Control surface for a running tunnel
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    server_id: String,
    local_port: u16,
    remote_port: u16,
    cancel: CancellationToken,
    active: watch::Receiver<bool>,
}

impl TunnelHandle {
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            server_id: self.server_id.clone(),
            local_port: self.local_port,
            remote_port: self.remote_port,
            active: self.is_active(),
        }
    }

    /// Ask the owning context to tear down. Returns immediately.
    pub fn request_close(&self) {
        self.cancel.cancel();
    }

    /// Wait until teardown is acknowledged; false on timeout.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let mut active = self.active.clone();
        tokio::time::timeout(timeout, active.wait_for(|a| !*a))
            .await
            .map(|r| r.is_ok() || !*self.active.borrow())
            .unwrap_or(false)
    }
}

/// Everything a tunnel holds open. Released exactly once.
pub struct TunnelResources {
    server_id: String,
    remote_port: u16,
    local_port: Option<u16>,
    session: Option<Arc<dyn RemoteSession>>,
    forward: Option<JoinHandle<()>>,
    monitor: Option<HealthMonitor>,
    cancel: CancellationToken,
    active: watch::Sender<bool>,
    released: bool,
}

impl TunnelResources {
    pub fn new(server_id: &str, remote_port: u16, cancel: CancellationToken) -> Self {
        let (active, _) = watch::channel(false);
        Self {
            server_id: server_id.to_string(),
            remote_port,
            local_port: None,
            session: None,
            forward: None,
            monitor: None,
            cancel,
            active,
            released: false,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_session(&mut self, session: Arc<dyn RemoteSession>) {
        self.session = Some(session);
    }

    pub fn set_forward(&mut self, local_port: u16, forward: JoinHandle<()>) {
        self.local_port = Some(local_port);
        self.forward = Some(forward);
        self.active.send_replace(true);
    }

    pub fn set_monitor(&mut self, monitor: HealthMonitor) {
        self.monitor = Some(monitor);
    }

    /// Stop monitor and forward, close the session, mark inactive.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.cancel.cancel();

        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
        if let Some(forward) = self.forward.take() {
            forward.abort();
            let _ = forward.await;
        }
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.active.send_replace(false);
        tracing::info!(
            "Tunnel for {} closed (local port {:?})",
            self.server_id,
            self.local_port
        );
    }

    /// Hand ownership to a detached context that releases on cancellation,
    /// or once every [`TunnelHandle`] to it has been dropped.
    ///
    /// Requires the forward to be running.
    pub fn detach(self) -> Option<TunnelHandle> {
        let local_port = self.local_port?;
        let handle = TunnelHandle {
            server_id: self.server_id.clone(),
            local_port,
            remote_port: self.remote_port,
            cancel: self.cancel.clone(),
            active: self.active.subscribe(),
        };

        let mut resources = self;
        tokio::spawn(async move {
            tokio::select! {
                _ = resources.cancel.cancelled() => {}
                _ = resources.active.closed() => {
                    tracing::warn!("Tunnel for {} was abandoned; closing", resources.server_id);
                }
            }
            resources.release().await;
        });
        Some(handle)
    }
}

impl Drop for TunnelResources {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.cancel.cancel();
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
        if let Some(forward) = self.forward.take() {
            forward.abort();
        }
        if let Some(session) = self.session.take() {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move { session.close().await });
            }
        }
        self.active.send_replace(false);
    }
}
