//! Standard filesystem paths for the shroud plugin.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default directory the container runtime scans for plugin sockets.
pub static SHROUD_PLUGIN_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("SHROUD_PLUGIN_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/docker/plugins"))
});

/// Default PID file location.
pub static SHROUD_PID_FILE: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("SHROUD_PID_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/run/shroud.pid"))
});

/// Standard paths used by the plugin daemon.
#[derive(Debug, Clone)]
pub struct ShroudPaths {
    /// Plugin socket directory (default: /run/docker/plugins).
    pub plugin_dir: PathBuf,
    /// PID file (default: /var/run/shroud.pid).
    pub pid_file: PathBuf,
}

impl ShroudPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom plugin socket directory.
    #[must_use]
    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = dir.into();
        self
    }

    /// Use a custom PID file.
    #[must_use]
    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = path.into();
        self
    }

    /// Socket path for a plugin named `name`.
    #[must_use]
    pub fn plugin_socket(&self, name: &str) -> PathBuf {
        self.plugin_dir.join(format!("{name}.sock"))
    }

    /// Create the plugin socket directory.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.plugin_dir)
    }
}

impl Default for ShroudPaths {
    fn default() -> Self {
        Self {
            plugin_dir: SHROUD_PLUGIN_DIR.clone(),
            pid_file: SHROUD_PID_FILE.clone(),
        }
    }
}
