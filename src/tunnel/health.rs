use crate::llm::LlmClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// One health sample of an active tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub server_id: String,
    pub local_port: u16,
    pub healthy: bool,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

#[async_trait]
impl HealthProbe for LlmClient {
    async fn probe(&self) -> bool {
        self.is_healthy().await
    }
}

/// Periodic probe of one tunnel.
///
/// After [`HealthMonitor::stop`] returns no further report is published.
pub struct HealthMonitor {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// The first probe runs one `interval` after spawning.
    pub fn spawn(
        server_id: String,
        local_port: u16,
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
        sink: broadcast::Sender<HealthReport>,
        cancel: CancellationToken,
    ) -> Self {
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let healthy = tokio::select! {
                    _ = token.cancelled() => break,
                    healthy = probe.probe() => healthy,
                };
                if token.is_cancelled() {
                    break;
                }

                if !healthy {
                    tracing::warn!("Health probe failed for {} on port {}", server_id, local_port);
                }
                let _ = sink.send(HealthReport {
                    server_id: server_id.clone(),
                    local_port,
                    healthy,
                    timestamp: Utc::now(),
                });
            }
            tracing::debug!("Health monitor for {} stopped", server_id);
        });

        Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Idempotent
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProbe(AtomicUsize);

    #[async_trait]
    impl HealthProbe for CountingProbe {
        async fn probe(&self) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn test_reports_until_stopped() {
        let (tx, mut rx) = broadcast::channel(64);
        let probe = Arc::new(CountingProbe(AtomicUsize::new(0)));
        let interval = Duration::from_millis(20);
        let monitor = HealthMonitor::spawn(
            "s1".into(),
            12434,
            probe.clone(),
            interval,
            tx,
            CancellationToken::new(),
        );

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.server_id, "s1");
        assert!(first.healthy);

        monitor.stop();
        while rx.try_recv().is_ok() {}
        let probes_at_stop = probe.0.load(Ordering::SeqCst);

        tokio::time::sleep(interval * 3).await;
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty) | Err(broadcast::error::TryRecvError::Closed)
        ));
        assert_eq!(probe.0.load(Ordering::SeqCst), probes_at_stop);
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_monitor() {
        let (tx, mut rx) = broadcast::channel(64);
        let parent = CancellationToken::new();
        let _monitor = HealthMonitor::spawn(
            "s1".into(),
            1,
            Arc::new(CountingProbe(AtomicUsize::new(0))),
            Duration::from_millis(10),
            tx,
            parent.child_token(),
        );
        parent.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(report) = rx.try_recv() {
            assert!(report.timestamp <= Utc::now());
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(rx.try_recv().is_err());
    }
}
