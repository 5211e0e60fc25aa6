//! Embedded certificate authority.
//!
//! Every accepted forward gets a fresh keypair wrapped in a short-lived SSH
//! user certificate signed by the CA key loaded at startup. The 10-second
//! lifetime constraint placed on the agent copy is the primary expiry; the
//! certificate itself carries a slightly longer safety window.

use std::path::Path;

use ssh_key::certificate::{Builder, CertType, Certificate};
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, PrivateKey};

use crate::error::{ServerError, ServerResult};
use crate::mfa::unix_now;

/// Certificate validity window in seconds.
const VALIDITY_SECS: u64 = 60;

pub struct CertAuthority {
    signing_key: PrivateKey,
}

impl CertAuthority {
    /// Load the CA signing key. A missing or unparsable key is a fatal
    /// startup error.
    pub fn load(path: &Path) -> ServerResult<Self> {
        let pem = std::fs::read_to_string(path)?;
        let signing_key =
            russh::keys::decode_secret_key(&pem, None).map_err(ServerError::crypto)?;
        Ok(Self::from_key(signing_key))
    }

    pub fn from_key(signing_key: PrivateKey) -> Self {
        Self { signing_key }
    }

    /// The CA public key, as published to downstream `sshd` TrustedUserCAKeys.
    pub fn public_key(&self) -> ssh_key::public::PublicKey {
        self.signing_key.public_key().clone()
    }

    /// Mint a fresh keypair and a signed user certificate for one forward.
    ///
    /// The certificate asserts exactly one principal, carries the session
    /// UUID as its key identifier, and embeds a `force-command` critical
    /// option when `force_command` is non-empty.
    pub fn generate(
        &self,
        session_id: &str,
        principal: &str,
        force_command: &str,
    ) -> ServerResult<(Certificate, PrivateKey)> {
        let mut rng = OsRng;
        let key =
            PrivateKey::random(&mut rng, Algorithm::Ed25519).map_err(ServerError::crypto)?;

        let now = unix_now();
        let mut builder = Builder::new_with_random_nonce(
            &mut rng,
            key.public_key().key_data().clone(),
            now,
            now + VALIDITY_SECS,
        )
        .map_err(ServerError::crypto)?;
        builder.cert_type(CertType::User).map_err(ServerError::crypto)?;
        builder.key_id(session_id).map_err(ServerError::crypto)?;
        builder
            .valid_principal(principal)
            .map_err(ServerError::crypto)?;
        if !force_command.is_empty() {
            builder
                .critical_option("force-command", force_command)
                .map_err(ServerError::crypto)?;
        }

        let certificate = builder.sign(&self.signing_key).map_err(ServerError::crypto)?;
        Ok((certificate, key))
    }
}
