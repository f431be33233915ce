use super::{BoxedStream, Credential, ExecOutput, RemoteSession, SessionConnector, SshTarget};
use crate::config::SshSettings;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use ssh2::{Channel, CheckResult, ErrorCode, KnownHostFileKind, Session};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

const READ_CHUNK_BYTES: usize = 32 * 1024;
const WRITE_CHUNK_BYTES: usize = 8 * 1024;
const DUPLEX_BUFFER_BYTES: usize = 64 * 1024;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Opens [`Ssh2Session`]s with libssh2
pub struct Ssh2Connector {
    handshake_timeout: Duration,
    command_timeout: Duration,
    keepalive_interval: u32,
}

impl Ssh2Connector {
    pub fn new(settings: &SshSettings) -> Self {
        Self {
            handshake_timeout: settings.handshake_timeout(),
            command_timeout: settings.command_timeout(),
            keepalive_interval: settings.keepalive_interval,
        }
    }
}

#[async_trait]
impl SessionConnector for Ssh2Connector {
    async fn connect(&self, target: &SshTarget) -> AppResult<Arc<dyn RemoteSession>> {
        let target = target.clone();
        let handshake_timeout = self.handshake_timeout;
        let command_timeout = self.command_timeout;
        let keepalive_interval = self.keepalive_interval;

        let session = tokio::task::spawn_blocking(move || {
            connect_blocking(&target, handshake_timeout, command_timeout, keepalive_interval)
        })
        .await
        .map_err(|e| AppError::WorkerCrashed(format!("SSH connect thread failed: {}", e)))??;

        Ok(Arc::new(session))
    }
}

/// Blocking connect, handshake, host key check and authentication
fn connect_blocking(
    target: &SshTarget,
    handshake_timeout: Duration,
    command_timeout: Duration,
    keepalive_interval: u32,
) -> AppResult<Ssh2Session> {
    let credential = target.credential()?;

    tracing::info!(
        "Connecting to {}@{}:{}",
        target.username,
        target.host,
        target.port
    );

    let addr = resolve(&target.host, target.port)?;
    let tcp = TcpStream::connect_timeout(&addr, handshake_timeout).map_err(|e| {
        if e.kind() == ErrorKind::TimedOut {
            AppError::Timeout(format!("TCP connect to {} timed out", addr))
        } else {
            AppError::Connect(format!("TCP connect to {} failed: {}", addr, e))
        }
    })?;
    tcp.set_nodelay(true)?;

    let mut session =
        Session::new().map_err(|e| AppError::Ssh(format!("Failed to create SSH session: {}", e)))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(millis(handshake_timeout));

    session.handshake().map_err(|e| {
        if matches!(e.code(), ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT)) {
            AppError::Timeout(format!("SSH handshake with {} timed out", target.host))
        } else {
            AppError::Connect(format!("SSH handshake failed: {}", sanitize_error_message(&e.to_string())))
        }
    })?;

    let fingerprint = verify_host_key(&session, target)?;

    authenticate(&session, &target.username, &credential)?;

    session.set_keepalive(true, keepalive_interval);
    session.set_timeout(millis(command_timeout));

    tracing::info!(
        "SSH authenticated to {} (host key {})",
        target.host,
        fingerprint.as_deref().unwrap_or("unknown")
    );

    Ok(Ssh2Session {
        session,
        host: target.host.clone(),
        fingerprint,
        keepalive_interval: Duration::from_secs(u64::from(keepalive_interval.max(1))),
        forwarding: Arc::new(AtomicBool::new(false)),
        closed: Arc::new(AtomicBool::new(false)),
    })
}

fn resolve(host: &str, port: u16) -> AppResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| AppError::Connect(format!("Cannot resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| AppError::Connect(format!("No address found for {}", host)))
}

fn millis(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

/// Check the host key against the user's known_hosts.
///
/// Unknown hosts are accepted and their fingerprint logged; a changed key
/// is rejected.
fn verify_host_key(session: &Session, target: &SshTarget) -> AppResult<Option<String>> {
    let Some((key, _key_type)) = session.host_key() else {
        return Err(AppError::Connect("No host key received".to_string()));
    };
    let fingerprint = compute_sha256_fingerprint(key);

    let Some(known_hosts_path) = dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts")) else {
        return Ok(Some(fingerprint));
    };
    if !known_hosts_path.exists() {
        return Ok(Some(fingerprint));
    }

    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| AppError::Ssh(format!("Failed to create known_hosts: {}", e)))?;
    if let Err(e) = known_hosts.read_file(&known_hosts_path, KnownHostFileKind::OpenSSH) {
        tracing::debug!("Could not read {}: {}", known_hosts_path.display(), e);
        return Ok(Some(fingerprint));
    }

    match known_hosts.check_port(&target.host, target.port, key) {
        CheckResult::Match => {
            tracing::debug!("Host key matched for {}:{}", target.host, target.port);
            Ok(Some(fingerprint))
        }
        CheckResult::NotFound | CheckResult::Failure => {
            tracing::info!(
                "Unknown host key for {}:{} ({})",
                target.host,
                target.port,
                fingerprint
            );
            Ok(Some(fingerprint))
        }
        CheckResult::Mismatch => {
            tracing::error!(
                "HOST KEY MISMATCH for {}:{}! Possible MITM attack!",
                target.host,
                target.port
            );
            Err(AppError::Connect(format!(
                "Host key for {}:{} has changed; remove the old key from known_hosts if this is expected",
                target.host, target.port
            )))
        }
    }
}

fn authenticate(session: &Session, username: &str, credential: &Credential) -> AppResult<()> {
    match credential {
        Credential::Password(password) => {
            session
                .userauth_password(username, password)
                .map_err(|_| AppError::Auth("Password authentication failed".to_string()))?;
        }
        Credential::KeyFile { path, passphrase } => {
            if !path.exists() {
                return Err(AppError::Auth(format!(
                    "Private key file {} does not exist",
                    path.display()
                )));
            }
            session
                .userauth_pubkey_file(username, None, path, passphrase.as_deref())
                .map_err(|e| {
                    let msg = e.to_string().to_lowercase();
                    if msg.contains("passphrase") || msg.contains("decrypt") || msg.contains("parse") {
                        AppError::Auth(
                            "Invalid passphrase or key format. Ensure the key is in PEM or OpenSSH format."
                                .to_string(),
                        )
                    } else if msg.contains("denied") || msg.contains("auth") {
                        AppError::Auth("Private key not accepted by server".to_string())
                    } else {
                        AppError::Auth("Private key authentication failed".to_string())
                    }
                })?;
        }
    }

    if !session.authenticated() {
        return Err(AppError::Auth("Authentication failed".to_string()));
    }
    Ok(())
}

/// An authenticated libssh2 session.
///
/// Once a forwarded channel is opened the session switches to non-blocking
/// mode and is reserved for forwarding.
pub struct Ssh2Session {
    session: Session,
    host: String,
    fingerprint: Option<String>,
    keepalive_interval: Duration,
    forwarding: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl Ssh2Session {
    fn ensure_usable(&self) -> AppResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::Ssh(format!("Session to {} is closed", self.host)));
        }
        Ok(())
    }

    fn ensure_blocking(&self) -> AppResult<()> {
        self.ensure_usable()?;
        if self.forwarding.load(Ordering::Acquire) {
            return Err(AppError::Ssh(format!(
                "Session to {} is reserved for port forwarding",
                self.host
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for Ssh2Session {
    fn host_fingerprint(&self) -> Option<String> {
        self.fingerprint.clone()
    }

    async fn exec(&self, command: &str) -> AppResult<ExecOutput> {
        self.ensure_blocking()?;
        let session = self.session.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || exec_blocking(&session, &command))
            .await
            .map_err(|e| AppError::WorkerCrashed(format!("SSH exec thread failed: {}", e)))?
    }

    async fn transfer(&self, local_path: &Path, remote_path: &str) -> AppResult<()> {
        self.ensure_blocking()?;
        let session = self.session.clone();
        let local = local_path.to_path_buf();
        let remote = remote_path.to_string();
        let uploaded = tokio::task::spawn_blocking(move || {
            crate::sftp::upload_file(&session, &local, &remote, 0o755)
        })
        .await
        .map_err(|e| AppError::WorkerCrashed(format!("SFTP thread failed: {}", e)))??;

        tracing::debug!(
            "Uploaded {} ({} bytes, {})",
            uploaded.path,
            uploaded.size,
            uploaded.permissions
        );
        Ok(())
    }

    async fn open_forward(&self, remote_host: &str, remote_port: u16) -> AppResult<BoxedStream> {
        self.ensure_usable()?;
        if !self.forwarding.swap(true, Ordering::AcqRel) {
            self.session.set_blocking(false);
        }

        let session = self.session.clone();
        let host = remote_host.to_string();
        let deadline = Duration::from_millis(u64::from(self.session.timeout()).max(1000));
        let channel = tokio::task::spawn_blocking(move || {
            open_direct_channel(&session, &host, remote_port, deadline)
        })
        .await
        .map_err(|e| AppError::WorkerCrashed(format!("SSH forward thread failed: {}", e)))??;

        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER_BYTES);
        let (mut local_rd, mut local_wr) = tokio::io::split(server);
        let (to_remote_tx, to_remote_rx) = mpsc::channel::<Vec<u8>>(64);
        let (from_remote_tx, mut from_remote_rx) = mpsc::channel::<Vec<u8>>(64);

        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            loop {
                match local_rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if to_remote_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(chunk) = from_remote_rx.recv().await {
                if local_wr.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = local_wr.shutdown().await;
        });

        let pump = ForwardPump {
            session: self.session.clone(),
            channel,
            to_remote: to_remote_rx,
            from_remote: from_remote_tx,
            closed: self.closed.clone(),
            keepalive_interval: self.keepalive_interval,
        };
        thread::Builder::new()
            .name(format!("ssh-forward-{}", remote_port))
            .spawn(move || pump.run())
            .map_err(|e| AppError::Io(format!("Failed to spawn forward thread: {}", e)))?;

        Ok(Box::new(client))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let session = self.session.clone();
        let host = self.host.clone();
        let _ = tokio::task::spawn_blocking(move || {
            if let Err(e) = session.disconnect(None, "closing", None) {
                tracing::debug!("SSH disconnect from {} returned: {}", host, e);
            }
        })
        .await;
    }
}

fn exec_blocking(session: &Session, command: &str) -> AppResult<ExecOutput> {
    let mut channel = session
        .channel_session()
        .map_err(|e| AppError::Ssh(format!("Failed to open channel: {}", e)))?;
    channel
        .exec(command)
        .map_err(|e| AppError::Ssh(format!("Failed to exec: {}", e)))?;

    let mut stdout = String::new();
    channel
        .read_to_string(&mut stdout)
        .map_err(|e| read_error("stdout", e))?;
    let mut stderr = String::new();
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(|e| read_error("stderr", e))?;

    channel
        .wait_close()
        .map_err(|e| AppError::Ssh(format!("Failed to close channel: {}", e)))?;
    let exit_code = channel
        .exit_status()
        .map_err(|e| AppError::Ssh(format!("Failed to read exit status: {}", e)))?;

    Ok(ExecOutput {
        stdout,
        stderr,
        exit_code,
    })
}

fn read_error(stream: &str, e: std::io::Error) -> AppError {
    if e.kind() == ErrorKind::TimedOut {
        AppError::Timeout(format!("Reading remote {} timed out", stream))
    } else {
        AppError::Ssh(format!("Failed to read remote {}: {}", stream, e))
    }
}

fn open_direct_channel(session: &Session, host: &str, port: u16, deadline: Duration) -> AppResult<Channel> {
    let started = Instant::now();
    loop {
        match session.channel_direct_tcpip(host, port, None) {
            Ok(channel) => return Ok(channel),
            Err(e) if is_would_block(&e) => {
                if started.elapsed() > deadline {
                    return Err(AppError::Timeout(format!(
                        "Opening forwarded channel to {}:{} timed out",
                        host, port
                    )));
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => {
                return Err(AppError::Ssh(format!(
                    "Failed to open forwarded channel to {}:{}: {}",
                    host, port, e
                )))
            }
        }
    }
}

/// Moves bytes between one non-blocking channel and its async peer
struct ForwardPump {
    session: Session,
    channel: Channel,
    to_remote: mpsc::Receiver<Vec<u8>>,
    from_remote: mpsc::Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
    keepalive_interval: Duration,
}

impl ForwardPump {
    fn run(mut self) {
        let mut read_buf = vec![0u8; READ_CHUNK_BYTES];
        let mut pending: Vec<u8> = Vec::new();
        let mut local_eof = false;
        let mut eof_sent = false;
        let mut last_keepalive = Instant::now();

        'pump: loop {
            if self.closed.load(Ordering::Acquire) {
                break;
            }

            if last_keepalive.elapsed() >= self.keepalive_interval {
                if let Err(e) = self.session.keepalive_send() {
                    if !is_would_block(&e) {
                        tracing::debug!("Keepalive send failed: {}", e);
                    }
                }
                last_keepalive = Instant::now();
            }

            while !local_eof {
                match self.to_remote.try_recv() {
                    Ok(data) => pending.extend_from_slice(&data),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => local_eof = true,
                }
            }

            let mut idle = true;
            while !pending.is_empty() {
                let len = pending.len().min(WRITE_CHUNK_BYTES);
                match self.channel.write(&pending[..len]) {
                    Ok(0) => break,
                    Ok(n) => {
                        pending.drain(..n);
                        idle = false;
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        tracing::debug!("Forward write failed: {}", e);
                        break 'pump;
                    }
                }
            }

            if local_eof && pending.is_empty() && !eof_sent {
                match self.channel.send_eof() {
                    Ok(()) => eof_sent = true,
                    Err(e) if is_would_block(&e) => {}
                    Err(_) => eof_sent = true,
                }
            }

            loop {
                match self.channel.read(&mut read_buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        idle = false;
                        if self.from_remote.blocking_send(read_buf[..n].to_vec()).is_err() {
                            break 'pump;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!("Forward read failed: {}", e);
                        break 'pump;
                    }
                }
            }

            if self.channel.eof() {
                break;
            }

            if idle {
                thread::sleep(Duration::from_millis(2));
            }
        }

        let _ = self.channel.close();
    }
}

fn is_would_block(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

/// Compute SHA256 fingerprint of a key
pub fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    let result = hasher.finalize();

    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, result);
    format!("SHA256:{}", b64.trim_end_matches('='))
}

/// Keep transport errors short before they reach records and logs
fn sanitize_error_message(msg: &str) -> String {
    let msg = crate::logging::sanitize(msg);
    if msg.len() > 200 {
        let mut cut = 200;
        while !msg.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &msg[..cut])
    } else {
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let fp = compute_sha256_fingerprint(b"test key data");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(50)), 50);
        assert_eq!(millis(Duration::from_secs(u64::MAX / 2)), u32::MAX);
    }

    #[test]
    fn test_sanitize_error_truncates() {
        let long = "a".repeat(300);
        assert!(sanitize_error_message(&long).len() < 210);
    }

    #[tokio::test]
    async fn test_connect_without_credential_is_auth_error() {
        let connector = Ssh2Connector::new(&SshSettings::default());
        let target = SshTarget {
            host: "127.0.0.1".into(),
            port: 22,
            username: "u".into(),
            private_key_path: None,
            passphrase: None,
            password: None,
        };
        let err = connector.connect(&target).await.err().unwrap();
        assert!(matches!(err, AppError::Auth(_)));
    }
}
