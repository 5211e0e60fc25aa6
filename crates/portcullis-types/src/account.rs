//! Accounts file schema.
//!
//! The accounts file is a JSON array of account objects maintained by the
//! provisioning tooling; the daemon re-reads it on startup and on reload.

use serde::{Deserialize, Serialize};

/// One account as stored in the accounts file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub username: String,
    /// bcrypt hash. Retained for provisioning compatibility; the forwarding
    /// path never consults it.
    #[serde(default)]
    pub password: String,
    /// Authorized-keys lines (options, key type, base64 blob, comment).
    #[serde(rename = "ssh-keys", default)]
    pub ssh_keys: Vec<String>,
    pub mfa: MfaRecord,
    /// Login shell for the interactive mode.
    #[serde(default)]
    pub shell: Option<String>,
    /// Regex a destination host must match to be reachable.
    #[serde(default)]
    pub whitelist: Option<String>,
    /// Regex a destination host must not match to be reachable.
    #[serde(default)]
    pub blacklist: Option<String>,
}

/// Second-factor material for an account.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MfaRecord {
    /// Base32-encoded TOTP shared secret.
    pub totp: String,
}
