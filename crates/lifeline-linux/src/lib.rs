//! Linux-specific implementation for lifeline
//!
//! This crate provides the platform half of the connectivity signal by
//! reading interface operational state from sysfs.

#![cfg(target_os = "linux")]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tracing::trace;

/// Default location of the kernel's network interface directory.
const SYSFS_NET: &str = "/sys/class/net";

/// Reads link state for every non-loopback interface under a sysfs root.
#[derive(Debug, Clone)]
pub struct LinkProbe {
    root: PathBuf,
}

impl LinkProbe {
    /// Create a probe over the system's `/sys/class/net`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root(SYSFS_NET)
    }

    /// Create a probe over a custom directory laid out like `/sys/class/net`.
    #[must_use]
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Whether at least one non-loopback interface reports `up`.
    ///
    /// An unreadable directory counts as offline.
    #[must_use]
    pub fn link_is_up(&self) -> bool {
        let Ok(entries) = fs::read_dir(&self.root) else {
            trace!(root = %self.root.display(), "Interface directory unreadable");
            return false;
        };

        entries.filter_map(Result::ok).any(|entry| {
            let name = entry.file_name();
            if name == "lo" {
                return false;
            }
            let state = fs::read_to_string(entry.path().join("operstate")).unwrap_or_default();
            trace!(interface = ?name, state = state.trim(), "Interface state");
            state.trim() == "up"
        })
    }
}

impl Default for LinkProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Get platform name
#[must_use]
pub fn platform_name() -> &'static str {
    "Linux"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_iface(root: &Path, name: &str, state: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("operstate"), format!("{state}\n")).unwrap();
    }

    #[test]
    fn test_platform_name() {
        assert_eq!(platform_name(), "Linux");
    }

    #[test]
    fn test_up_interface_is_online() {
        let tmp = tempfile::tempdir().unwrap();
        write_iface(tmp.path(), "lo", "unknown");
        write_iface(tmp.path(), "eth0", "up");

        assert!(LinkProbe::with_root(tmp.path()).link_is_up());
    }

    #[test]
    fn test_loopback_only_is_offline() {
        let tmp = tempfile::tempdir().unwrap();
        write_iface(tmp.path(), "lo", "up");

        assert!(!LinkProbe::with_root(tmp.path()).link_is_up());
    }

    #[test]
    fn test_down_interfaces_are_offline() {
        let tmp = tempfile::tempdir().unwrap();
        write_iface(tmp.path(), "eth0", "down");
        write_iface(tmp.path(), "wlan0", "dormant");

        assert!(!LinkProbe::with_root(tmp.path()).link_is_up());
    }

    #[test]
    fn test_missing_root_is_offline() {
        assert!(!LinkProbe::with_root("/nonexistent/sys/class/net").link_is_up());
    }
}
