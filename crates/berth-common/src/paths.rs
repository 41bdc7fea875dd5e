//! Standard filesystem paths for Berth.

use std::path::PathBuf;

/// Standard paths used by the Berth daemon.
#[derive(Debug, Clone)]
pub struct BerthPaths {
    /// Root data directory.
    pub root: PathBuf,
    /// Runtime directory, `<root>/run`.
    pub runtime: PathBuf,
}

impl BerthPaths {
    /// Create paths under a root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runtime = root.join("run");
        Self { root, runtime }
    }

    /// Directory holding one persisted record per network.
    #[must_use]
    pub fn networks(&self) -> PathBuf {
        self.root.join("networks")
    }

    /// PID file of the daemon.
    #[must_use]
    pub fn daemon_pid(&self) -> PathBuf {
        self.runtime.join("berthd.pid")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.runtime)?;
        std::fs::create_dir_all(self.networks())?;
        tracing::debug!(root = %self.root.display(), "Created berth directories");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = BerthPaths::with_root("/tmp/berth-test");
        assert_eq!(paths.networks(), PathBuf::from("/tmp/berth-test/networks"));
        assert_eq!(paths.runtime, PathBuf::from("/tmp/berth-test/run"));
        assert_eq!(
            paths.daemon_pid(),
            PathBuf::from("/tmp/berth-test/run/berthd.pid")
        );
    }
}
