//! Client for the agent forwarded back over `auth-agent@openssh.com`.
//!
//! Speaks the OpenSSH agent protocol over the reverse channel's byte stream:
//! each message is a 4-byte big-endian length followed by the encoded
//! request or response.

use russh::Channel;
use russh::server::Msg;
use ssh_agent_lib::proto::{
    AddIdentity, AddIdentityConstrained, Credential, Identity, KeyConstraint, Request, Response,
    SignRequest,
};
use ssh_encoding::{Decode, Encode};
use ssh_key::certificate::Certificate;
use ssh_key::public::KeyData;
use ssh_key::{Algorithm, PrivateKey, Signature};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ServerError, ServerResult};

/// Upper bound on one agent message; anything larger is a protocol error.
const MAX_MESSAGE_LEN: usize = 256 * 1024;

/// `SSH_AGENT_RSA_SHA2_256` signature flag. Ignored by agents for non-RSA
/// keys, required to steer RSA agents away from SHA-1 signatures.
const SIGN_FLAG_RSA_SHA2_256: u32 = 0x02;

/// Byte transport an agent conversation runs over.
pub trait AgentStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<S: AsyncRead + AsyncWrite + Unpin + Send> AgentStream for S {}

/// One client's forwarded agent. Owned by the session and shared by every
/// forward channel on it; callers serialize access through the session's
/// agent slot.
pub struct ForwardedAgent {
    stream: Box<dyn AgentStream>,
}

impl ForwardedAgent {
    pub fn new(channel: Channel<Msg>) -> Self {
        Self::from_stream(channel.into_stream())
    }

    /// Run the agent conversation over an arbitrary byte stream.
    pub fn from_stream(stream: impl AgentStream + 'static) -> Self {
        Self {
            stream: Box::new(stream),
        }
    }

    /// Ask the agent for the identities it holds.
    pub async fn identities(&mut self) -> ServerResult<Vec<Identity>> {
        match self.roundtrip(Request::RequestIdentities).await? {
            Response::IdentitiesAnswer(identities) => Ok(identities),
            other => Err(unexpected("identities", &other)),
        }
    }

    /// Ask the agent to sign `data` with the private half of `key`.
    pub async fn sign(&mut self, key: &KeyData, data: &[u8]) -> ServerResult<Signature> {
        let flags = match key.algorithm() {
            Algorithm::Rsa { .. } => SIGN_FLAG_RSA_SHA2_256,
            _ => 0,
        };
        let request = Request::SignRequest(SignRequest {
            pubkey: key.clone(),
            data: data.to_vec(),
            flags,
        });
        match self.roundtrip(request).await? {
            Response::SignResponse(signature) => Ok(signature),
            other => Err(unexpected("sign", &other)),
        }
    }

    /// Add an ephemeral certificate and its private key to the agent with a
    /// lifetime constraint, after which the agent discards it on its own.
    pub async fn add_certificate(
        &mut self,
        certificate: &Certificate,
        key: &PrivateKey,
        lifetime_secs: u32,
        comment: String,
    ) -> ServerResult<()> {
        let request = Request::AddIdConstrained(AddIdentityConstrained {
            identity: AddIdentity {
                credential: Credential::Cert {
                    algorithm: key.algorithm(),
                    certificate: Box::new(certificate.clone()),
                    privkey: key.key_data().clone(),
                    comment,
                },
            },
            constraints: vec![KeyConstraint::Lifetime(lifetime_secs)],
        });
        match self.roundtrip(request).await? {
            Response::Success => Ok(()),
            other => Err(unexpected("add-identity", &other)),
        }
    }

    async fn roundtrip(&mut self, request: Request) -> ServerResult<Response> {
        let mut payload = Vec::new();
        request.encode(&mut payload).map_err(ServerError::agent)?;

        let mut framed = Vec::with_capacity(payload.len() + 4);
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(&payload);
        self.stream.write_all(&framed).await?;

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_MESSAGE_LEN {
            return Err(ServerError::Agent(format!(
                "agent sent a {len}-byte frame"
            )));
        }
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await?;
        Response::decode(&mut buf.as_slice()).map_err(ServerError::agent)
    }
}

fn unexpected(operation: &str, response: &Response) -> ServerError {
    match response {
        Response::Failure => ServerError::Agent(format!("agent refused {operation} request")),
        other => ServerError::Agent(format!(
            "unexpected agent response to {operation}: {other:?}"
        )),
    }
}

/// Wire encoding of a bare public key, the identity used by the key index.
pub fn key_wire_bytes(key: &KeyData) -> ServerResult<Vec<u8>> {
    let mut wire = Vec::new();
    key.encode(&mut wire).map_err(ServerError::agent)?;
    Ok(wire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_bytes_match_public_key_encoding() {
        let mut rng = ssh_key::rand_core::OsRng;
        let key = PrivateKey::random(&mut rng, Algorithm::Ed25519).unwrap();
        let public = key.public_key();
        assert_eq!(
            key_wire_bytes(public.key_data()).unwrap(),
            public.to_bytes().unwrap()
        );
    }

    #[test]
    fn requests_encode_with_length_framing_semantics() {
        // The identities request is a single message byte once encoded.
        let mut payload = Vec::new();
        Request::RequestIdentities.encode(&mut payload).unwrap();
        assert_eq!(payload, vec![11]); // SSH_AGENTC_REQUEST_IDENTITIES
    }
}
