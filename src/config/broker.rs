// ABOUTME: Configuration for the broker relay sockets and call timeouts
//
// Defines BrokerConfig with the tunables shared by master and workers:
// - Socket location and naming for the front and back addresses
// - Call timeout for pending calls in each worker
// - Connect timeout for workers reaching the front address

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the broker relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    // === Socket Location (SECURE: user-private directory) ===
    /// Directory for socket files (default: ~/.skyline/sockets/)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_dir: Option<PathBuf>,

    /// Prefix for socket filenames
    pub socket_prefix: String,

    /// Name of the front address (workers connect here)
    pub front_name: String,

    /// Name of the back address (dispatch binds, reply sink connects)
    pub back_name: String,

    // === Timeouts ===
    /// Seconds before an unanswered call fails (0 disables the timeout)
    #[serde(with = "duration_secs")]
    pub call_timeout: Duration,

    /// Seconds a worker keeps retrying the front address at startup
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            // Socket location determined at runtime via get_socket_dir()
            socket_dir: None,
            socket_prefix: "skyline-".to_string(),
            front_name: "cluster".to_string(),
            back_name: "queue".to_string(),

            call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl BrokerConfig {
    /// Use a specific socket directory (tests, multiple clusters on one host)
    #[must_use]
    pub fn with_socket_dir(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: Some(socket_dir.into()),
            ..Self::default()
        }
    }

    /// Get the socket directory, creating it with secure permissions if needed
    ///
    /// Returns `~/.skyline/sockets/` by default, with mode 0700
    pub fn get_socket_dir(&self) -> std::io::Result<PathBuf> {
        let socket_dir = self.socket_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".skyline")
                .join("sockets")
        });

        ensure_socket_dir(&socket_dir)?;
        Ok(socket_dir)
    }

    /// Full path of the front address
    pub fn front_path(&self) -> std::io::Result<PathBuf> {
        self.socket_path(&self.front_name)
    }

    /// Full path of the back address
    pub fn back_path(&self) -> std::io::Result<PathBuf> {
        self.socket_path(&self.back_name)
    }

    fn socket_path(&self, name: &str) -> std::io::Result<PathBuf> {
        let socket_dir = self.get_socket_dir()?;
        Ok(socket_dir.join(format!("{}{}.sock", self.socket_prefix, name)))
    }

    /// Call timeout, or `None` when disabled
    #[must_use]
    pub fn effective_call_timeout(&self) -> Option<Duration> {
        (!self.call_timeout.is_zero()).then_some(self.call_timeout)
    }
}

/// Ensure socket directory exists with secure permissions (mode 0700)
fn ensure_socket_dir(socket_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(socket_dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700); // rwx------
        std::fs::set_permissions(socket_dir, perms)?;
    }

    Ok(())
}

/// Serde helper for Duration as seconds (u64)
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.front_name, "cluster");
        assert_eq!(config.back_name, "queue");
        assert_eq!(config.call_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_socket_paths() {
        let temp_dir = TempDir::new().unwrap();
        let config = BrokerConfig::with_socket_dir(temp_dir.path());

        let front = config.front_path().unwrap();
        let back = config.back_path().unwrap();
        assert_eq!(front, temp_dir.path().join("skyline-cluster.sock"));
        assert_eq!(back, temp_dir.path().join("skyline-queue.sock"));
    }

    #[test]
    #[cfg(unix)]
    fn test_socket_dir_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let config = BrokerConfig::with_socket_dir(temp_dir.path().join("sockets"));
        let dir = config.get_socket_dir().unwrap();

        let mode = std::fs::metadata(dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn test_zero_call_timeout_disables() {
        let mut config = BrokerConfig::default();
        assert_eq!(config.effective_call_timeout(), Some(Duration::from_secs(30)));

        config.call_timeout = Duration::ZERO;
        assert_eq!(config.effective_call_timeout(), None);
    }

    #[test]
    fn test_durations_parse_as_seconds() {
        let config: BrokerConfig = toml::from_str("call_timeout = 2\nconnect_timeout = 7").unwrap();
        assert_eq!(config.call_timeout, Duration::from_secs(2));
        assert_eq!(config.connect_timeout, Duration::from_secs(7));
        assert_eq!(config.socket_prefix, "skyline-");
    }
}
