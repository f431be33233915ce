//! SFTP upload support for script transfer
//!
//! Runs on the blocking thread pool against an already authenticated
//! `ssh2::Session`.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use ssh2::{FileStat, Session, Sftp};
use std::io::{Read, Write};
use std::path::Path;

const UPLOAD_CHUNK_BYTES: usize = 32 * 1024;

/// Remote file after upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFile {
    pub path: String,
    pub size: u64,
    pub permissions: String,
}

/// Upload `local` to `remote`, creating or truncating it, and set `mode`
pub fn upload_file(session: &Session, local: &Path, remote: &str, mode: i32) -> AppResult<RemoteFile> {
    let sftp = session
        .sftp()
        .map_err(|e| AppError::Ssh(format!("Failed to open SFTP: {}", e)))?;

    let mut source = std::fs::File::open(local)
        .map_err(|e| AppError::Io(format!("Failed to open {}: {}", local.display(), e)))?;

    let remote_path = Path::new(remote);
    let mut file = sftp
        .create(remote_path)
        .map_err(|e| AppError::Ssh(format!("Failed to create {}: {}", remote, e)))?;

    let mut buf = vec![0u8; UPLOAD_CHUNK_BYTES];
    let mut written: u64 = 0;
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .map_err(|e| AppError::Ssh(format!("Failed to write {}: {}", remote, e)))?;
        written += n as u64;
    }
    drop(file);

    set_mode(&sftp, remote_path, mode)?;

    let stat = sftp
        .stat(remote_path)
        .map_err(|e| AppError::Ssh(format!("Failed to stat {}: {}", remote, e)))?;

    Ok(RemoteFile {
        path: remote.to_string(),
        size: stat.size.unwrap_or(written),
        permissions: format_permissions(&stat),
    })
}

fn set_mode(sftp: &Sftp, path: &Path, mode: i32) -> AppResult<()> {
    let stat = FileStat {
        size: None,
        uid: None,
        gid: None,
        perm: Some(mode as u32),
        atime: None,
        mtime: None,
    };
    sftp.setstat(path, stat)
        .map_err(|e| AppError::Ssh(format!("Failed to chmod {}: {}", path.display(), e)))
}

/// Format file permissions as a string like "rwxr-xr-x"
pub fn format_permissions(stat: &FileStat) -> String {
    let perms = stat.perm.unwrap_or(0);
    let kind = if stat.is_dir() {
        'd'
    } else if stat.file_type().is_symlink() {
        'l'
    } else {
        '-'
    };
    format_mode(kind, perms)
}

fn format_mode(kind: char, perms: u32) -> String {
    let mut s = String::with_capacity(10);
    s.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (perms >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mode() {
        assert_eq!(format_mode('-', 0o755), "-rwxr-xr-x");
        assert_eq!(format_mode('d', 0o700), "drwx------");
        assert_eq!(format_mode('-', 0o644), "-rw-r--r--");
    }
}
