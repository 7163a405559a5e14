use crate::BackendError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Host-level settings shared by all backends on one machine.
///
/// The bridge name, profile name, and subnet are host-wide singletons, so
/// they live in configuration rather than per-build state. Everything has a
/// default; a config file only needs the keys it wants to override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// LXD profile applied to every build container.
    #[serde(default = "default_profile_name")]
    pub profile_name: String,
    /// Bridge device carrying build-container traffic.
    #[serde(default = "default_bridge_name")]
    pub bridge_name: String,
    /// Private subnet for the bridge, `address/prefix` with the gateway as
    /// the address part.
    #[serde(default = "default_ipv4_network")]
    pub ipv4_network: String,
    /// Directory for pid files and the bridge lock.
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    /// Unix socket of the LXD daemon.
    #[serde(default = "default_lxd_socket")]
    pub lxd_socket: PathBuf,
    /// The daemon's server key; its presence means `lxd init` already ran.
    #[serde(default = "default_lxd_server_key")]
    pub lxd_server_key: PathBuf,
}

fn default_profile_name() -> String {
    "buildpen".to_owned()
}

fn default_bridge_name() -> String {
    "buildpenbr0".to_owned()
}

fn default_ipv4_network() -> String {
    "10.10.10.1/24".to_owned()
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/run/buildpen")
}

fn default_lxd_socket() -> PathBuf {
    PathBuf::from("/var/snap/lxd/common/lxd/unix.socket")
}

fn default_lxd_server_key() -> PathBuf {
    PathBuf::from("/var/snap/lxd/common/lxd/server.key")
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            profile_name: default_profile_name(),
            bridge_name: default_bridge_name(),
            ipv4_network: default_ipv4_network(),
            run_dir: default_run_dir(),
            lxd_socket: default_lxd_socket(),
            lxd_server_key: default_lxd_server_key(),
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self, BackendError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| BackendError::Config(format!("invalid config: {e}")))
    }

    /// Load `/etc/buildpen/buildpen.toml` if it exists, defaults otherwise.
    pub fn load_default() -> Result<Self, BackendError> {
        let path = Path::new("/etc/buildpen/buildpen.toml");
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert_eq!(config.bridge_name, "buildpenbr0");
        assert_eq!(config.ipv4_network, "10.10.10.1/24");
        assert_eq!(config.run_dir, PathBuf::from("/run/buildpen"));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buildpen.toml");
        std::fs::write(&path, "bridge_name = \"testbr0\"\n").unwrap();

        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.bridge_name, "testbr0");
        assert_eq!(config.profile_name, "buildpen");
    }

    #[test]
    fn invalid_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buildpen.toml");
        std::fs::write(&path, "bridge_name = [1, 2]\n").unwrap();
        assert!(matches!(
            RuntimeConfig::load(&path),
            Err(BackendError::Config(_))
        ));
    }
}
