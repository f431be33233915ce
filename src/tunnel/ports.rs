use crate::error::{AppError, AppResult};
use std::collections::HashSet;
use std::io::ErrorKind;
use tokio::net::TcpListener;

/// Preferred local port for a remote one.
///
/// Offset up when possible, down when the sum would overflow.
pub fn preferred_local_port(remote_port: u16, offset: u16) -> u16 {
    remote_port
        .checked_add(offset)
        .unwrap_or_else(|| remote_port.saturating_sub(offset).max(1))
}

pub fn is_local_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// First bindable port in `start..start + window`, skipping `reserved`.
pub fn find_free_local_port(start: u16, window: u16, reserved: &HashSet<u16>) -> AppResult<u16> {
    for step in 0..window {
        let Some(port) = start.checked_add(step) else {
            break;
        };
        if port == 0 || reserved.contains(&port) {
            continue;
        }
        if is_local_port_available(port) {
            return Ok(port);
        }
        tracing::debug!("Local port {} is taken", port);
    }

    Err(AppError::PortConflict(format!(
        "no free local port in {}..{}",
        start,
        start.saturating_add(window)
    )))
}

/// Bind the forward listener on loopback.
///
/// Losing the race for a probed port surfaces as [`AppError::PortConflict`].
pub async fn bind_local(port: u16) -> AppResult<TcpListener> {
    TcpListener::bind(("127.0.0.1", port)).await.map_err(|e| {
        if e.kind() == ErrorKind::AddrInUse {
            AppError::PortConflict(format!("local port {} is already in use", port))
        } else {
            AppError::Io(format!("failed to bind local port {}: {}", port, e))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A run of `len` consecutive bindable ports
    fn free_run(len: u16) -> u16 {
        for _ in 0..50 {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let base = probe.local_addr().unwrap().port();
            drop(probe);
            if base.checked_add(len).is_some() && (0..len).all(|i| is_local_port_available(base + i)) {
                return base;
            }
        }
        panic!("no run of {} free ports", len);
    }

    #[test]
    fn test_preferred_port() {
        assert_eq!(preferred_local_port(11434, 1000), 12434);
        assert_eq!(preferred_local_port(65000, 1000), 64000);
    }

    #[test]
    fn test_scan_skips_occupied_ports() {
        let n = 5;
        let base = free_run(n);
        let held: Vec<_> = (0..n - 1)
            .map(|i| std::net::TcpListener::bind(("127.0.0.1", base + i)).unwrap())
            .collect();

        let port = find_free_local_port(base, n, &HashSet::new()).unwrap();
        assert_eq!(port, base + n - 1);
        drop(held);
    }

    #[test]
    fn test_scan_skips_reserved_ports() {
        let base = free_run(3);
        let reserved: HashSet<u16> = [base, base + 1].into_iter().collect();
        assert_eq!(find_free_local_port(base, 3, &reserved).unwrap(), base + 2);
    }

    #[test]
    fn test_exhausted_window_is_port_conflict() {
        let base = free_run(2);
        let _a = std::net::TcpListener::bind(("127.0.0.1", base)).unwrap();
        let _b = std::net::TcpListener::bind(("127.0.0.1", base + 1)).unwrap();
        let err = find_free_local_port(base, 2, &HashSet::new()).unwrap_err();
        assert!(matches!(err, AppError::PortConflict(_)));
    }

    #[tokio::test]
    async fn test_bind_taken_port_is_port_conflict() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let err = bind_local(port).await.unwrap_err();
        assert!(matches!(err, AppError::PortConflict(_)));
    }
}
