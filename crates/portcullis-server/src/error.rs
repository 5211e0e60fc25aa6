use thiserror::Error;

/// Errors that can occur in the bastion daemon.
#[derive(Error, Debug)]
pub enum ServerError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration or accounts file error
    #[error("configuration error: {0}")]
    Config(#[from] portcullis_types::ConfigError),

    /// Cryptographic error
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Forwarded-agent protocol failure
    #[error("agent error: {0}")]
    Agent(String),

    /// Two accounts share a username in the accounts file
    #[error("duplicate username in accounts file: {0}")]
    DuplicateUsername(String),

    /// The same public key is registered to two accounts
    #[error("public key registered to both {first} and {second}")]
    DuplicateKey { first: String, second: String },

    /// The agent signed the challenge with key material that does not match
    #[error("challenge signature verification failed")]
    SignatureMismatch,

    /// No signer in the forwarded agent completed possession verification
    #[error("no matching signer completed verification")]
    Unverified,

    /// The account policy denies the requested destination
    #[error("destination {host} denied by account policy")]
    PolicyDenied { host: String },
}

/// Result type alias for daemon operations.
pub type ServerResult<T> = Result<T, ServerError>;

impl ServerError {
    /// Wrap a key-handling error.
    pub fn crypto(err: impl std::fmt::Display) -> Self {
        Self::Crypto(err.to_string())
    }

    /// Wrap a forwarded-agent failure.
    pub fn agent(err: impl std::fmt::Display) -> Self {
        Self::Agent(err.to_string())
    }
}
