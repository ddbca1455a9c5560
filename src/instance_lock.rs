//! Single instance lock using a Unix socket.
//!
//! Two bridges on one host would fight over the same cameras, so only one
//! may run. The socket is released by the OS when the process dies, which
//! avoids stale lock files.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SOCKET_NAME: &str = "ndsi-depth-bridge.sock";

#[derive(Debug, Error)]
pub enum InstanceLockError {
    #[error("another instance is already running")]
    AlreadyRunning,

    #[error("failed to acquire instance lock: {0}")]
    Io(#[from] io::Error),
}

/// Held for the lifetime of the process; the socket file is removed on drop.
pub struct InstanceLock {
    _listener: UnixListener,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire() -> Result<Self, InstanceLockError> {
        Self::acquire_at(Self::socket_path())
    }

    pub fn acquire_at(path: PathBuf) -> Result<Self, InstanceLockError> {
        // A socket nobody answers on was left behind by a killed process.
        if path.exists() {
            if UnixStream::connect(&path).is_ok() {
                return Err(InstanceLockError::AlreadyRunning);
            }
            let _ = std::fs::remove_file(&path);
        }

        match UnixListener::bind(&path) {
            Ok(listener) => Ok(Self {
                _listener: listener,
                path,
            }),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(InstanceLockError::AlreadyRunning),
            Err(e) => Err(InstanceLockError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `$XDG_RUNTIME_DIR/ndsi-depth-bridge.sock`, or under `/tmp`.
    pub fn socket_path() -> PathBuf {
        socket_path_in(std::env::var("XDG_RUNTIME_DIR").ok())
    }
}

fn socket_path_in(runtime_dir: Option<String>) -> PathBuf {
    runtime_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(SOCKET_NAME)
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_socket(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ndsi-lock-{}-{}.sock", tag, std::process::id()))
    }

    #[test]
    fn test_socket_path_uses_runtime_dir() {
        assert_eq!(
            socket_path_in(Some("/run/user/1000".into())),
            PathBuf::from("/run/user/1000/ndsi-depth-bridge.sock")
        );
        assert_eq!(socket_path_in(None), PathBuf::from("/tmp/ndsi-depth-bridge.sock"));
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let path = temp_socket("held");
        let lock = InstanceLock::acquire_at(path.clone()).unwrap();

        assert!(matches!(
            InstanceLock::acquire_at(path.clone()),
            Err(InstanceLockError::AlreadyRunning)
        ));

        drop(lock);
        assert!(!path.exists());
        let again = InstanceLock::acquire_at(path).unwrap();
        drop(again);
    }

    #[test]
    fn test_stale_socket_is_replaced() {
        let path = temp_socket("stale");
        {
            let listener = UnixListener::bind(&path).unwrap();
            drop(listener);
        }
        // The file is still there but nobody listens on it.
        assert!(path.exists());

        let lock = InstanceLock::acquire_at(path.clone()).unwrap();
        assert_eq!(lock.path(), path.as_path());
    }
}
