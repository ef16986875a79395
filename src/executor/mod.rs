//! Executors
//!
//! Idempotent drivers for the routing daemon, the tunnel toolchain, the
//! firewall, and the kernel network namespace. Safe to re-run at any
//! cadence: anything already in the desired shape is a no-op.

pub mod bird;
pub mod firewall;
pub mod loopback;
pub mod wireguard;

use crate::AgentError;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Write a file atomically (temp + rename) with the given mode.
pub(crate) fn write_atomic(path: &Path, contents: &str, mode: u32) -> Result<(), AgentError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.conf");
        write_atomic(&path, "data", 0o600).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "data");
    }

    #[test]
    fn test_write_atomic_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.conf");
        write_atomic(&path, "old", 0o644).unwrap();
        write_atomic(&path, "new", 0o644).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }
}
