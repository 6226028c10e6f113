//! Endpoint ownership on the filesystem.
//!
//! Binding goes through [`bind_endpoint`], which refuses live endpoints and
//! reclaims stale ones. The returned [`EndpointGuard`] unlinks the socket file
//! when dropped, on every exit path of the server task.

use crate::config::ProtocolConfig;
use crate::{LipError, Result};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

/// Check whether a server is accepting connections at `path`.
pub async fn probe_endpoint(path: &Path, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, UnixStream::connect(path)).await,
        Ok(Ok(_))
    )
}

/// Device, inode and change time. Inode numbers alone get recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
    ctime: i64,
    ctime_nsec: i64,
}

impl FileIdentity {
    fn of(meta: &std::fs::Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            ctime: meta.ctime(),
            ctime_nsec: meta.ctime_nsec(),
        }
    }
}

/// Owns the socket file of a bound endpoint and removes it on drop.
///
/// The file is only removed if it is still the one this guard created, so a
/// late drop never unlinks an endpoint bound by a newer server.
#[derive(Debug)]
pub struct EndpointGuard {
    path: PathBuf,
    identity: Option<FileIdentity>,
}

impl EndpointGuard {
    fn acquire(path: &Path) -> Self {
        let identity = std::fs::symlink_metadata(path)
            .ok()
            .map(|meta| FileIdentity::of(&meta));
        Self {
            path: path.to_path_buf(),
            identity,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn still_ours(&self) -> bool {
        match (std::fs::symlink_metadata(&self.path), self.identity) {
            (Ok(meta), Some(identity)) => FileIdentity::of(&meta) == identity,
            _ => false,
        }
    }
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        if !self.still_ours() {
            debug!("Endpoint {} already gone or replaced", self.path.display());
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed endpoint {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove endpoint {}: {}", self.path.display(), e),
        }
    }
}

/// Bind a listener at `path`.
///
/// - Nothing at `path`: bind.
/// - A socket nobody answers on: stale, unlink and bind.
/// - A socket with a live server: [`LipError::Bind`], the server untouched.
/// - Anything that is not a socket: [`LipError::Bind`], left alone.
pub async fn bind_endpoint(path: &Path) -> Result<(UnixListener, EndpointGuard)> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if !meta.file_type().is_socket() => {
            return Err(LipError::Bind {
                path: path.to_path_buf(),
                message: "path exists and is not a socket".to_string(),
            });
        }
        Ok(_) => {
            if probe_endpoint(path, ProtocolConfig::PROBE_TIMEOUT).await {
                return Err(LipError::Bind {
                    path: path.to_path_buf(),
                    message: "another server is listening".to_string(),
                });
            }
            warn!("Reclaiming stale endpoint {}", path.display());
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(LipError::io_with_path(e, path)),
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(LipError::io_with_path(e, path)),
    }

    let listener = UnixListener::bind(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            LipError::Bind {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        } else {
            LipError::io_with_path(e, path)
        }
    })?;

    Ok((listener, EndpointGuard::acquire(path)))
}
