//! Daemon configuration file schema and loader.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Runtime configuration for the bastion daemon, loaded from a single JSON
/// object (`portcullis --config <path>`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address the SSH listener binds to (`host:port`).
    pub bind: String,
    /// Filesystem path to the SSH host key presented to clients.
    pub id_rsa_host: PathBuf,
    /// Filesystem path to the certificate authority signing key.
    pub id_rsa_ca: PathBuf,
    /// Filesystem path to the JSON accounts file.
    pub accounts: PathBuf,
    /// Path the JSON-structured log records are appended to.
    pub log_file: PathBuf,
    /// Directory PTY recordings are written to (created at startup, 0770).
    #[serde(default = "default_recording_path")]
    pub recording_path: PathBuf,
    /// Banner shown when an interactive session opens.
    #[serde(default)]
    pub motd: String,
    /// When non-empty, overrides the principal embedded in issued certificates.
    #[serde(default)]
    pub force_user: String,
    /// When non-empty, embedded as a `force-command` critical option.
    #[serde(default)]
    pub force_command: String,
    /// Webhook URLs that receive session-start notifications.
    #[serde(default)]
    pub discord_webhooks: Vec<String>,
    /// Run the legacy interactive shell mode instead of certificate
    /// forwarding. The two modes are mutually exclusive per deployment.
    #[serde(default)]
    pub interactive: bool,
}

fn default_recording_path() -> PathBuf {
    PathBuf::from("recordings")
}

impl Config {
    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let raw = r#"{
            "bind": "0.0.0.0:2200",
            "id_rsa_host": "/etc/portcullis/id_host",
            "id_rsa_ca": "/etc/portcullis/id_ca",
            "accounts": "/etc/portcullis/accounts.json",
            "log_file": "/var/log/portcullis.json"
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.bind, "0.0.0.0:2200");
        assert_eq!(config.recording_path, PathBuf::from("recordings"));
        assert!(config.motd.is_empty());
        assert!(config.force_user.is_empty());
        assert!(config.discord_webhooks.is_empty());
        assert!(!config.interactive);
    }

    #[test]
    fn parses_full_config() {
        let raw = r#"{
            "bind": "127.0.0.1:22",
            "id_rsa_host": "host.key",
            "id_rsa_ca": "ca.key",
            "accounts": "accounts.json",
            "log_file": "log.json",
            "recording_path": "/srv/rec",
            "motd": "authorized use only",
            "force_user": "jump",
            "force_command": "/usr/bin/landing",
            "discord_webhooks": ["https://discord.example/hook"],
            "interactive": true
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.force_user, "jump");
        assert_eq!(config.force_command, "/usr/bin/landing");
        assert_eq!(config.discord_webhooks.len(), 1);
        assert!(config.interactive);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load(Path::new("/nonexistent/portcullis.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
