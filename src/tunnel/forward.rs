use crate::ssh::RemoteSession;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Accept loop for a local forward.
///
/// Each accepted connection gets its own forwarded channel to
/// `remote_host:remote_port` and is spliced until either side closes or
/// `cancel` fires.
pub fn spawn_local_forward(
    listener: TcpListener,
    session: Arc<dyn RemoteSession>,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer)) => {
                    tracing::debug!("Forwarding {} to {}:{}", peer, remote_host, remote_port);
                    tokio::spawn(splice(
                        socket,
                        session.clone(),
                        remote_host.clone(),
                        remote_port,
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("Local forward accept failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }
        tracing::debug!("Local forward to {}:{} stopped", remote_host, remote_port);
    })
}

async fn splice(
    mut socket: TcpStream,
    session: Arc<dyn RemoteSession>,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
) {
    let mut remote = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = session.open_forward(&remote_host, remote_port) => match opened {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Failed to open forwarded channel: {}", e);
                return;
            }
        },
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        copied = tokio::io::copy_bidirectional(&mut socket, &mut remote) => match copied {
            Ok((up, down)) => tracing::trace!("Forwarded connection closed ({} up, {} down)", up, down),
            Err(e) => tracing::debug!("Forwarded connection ended: {}", e),
        },
    }
}
