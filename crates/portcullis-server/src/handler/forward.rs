//! The forward pipeline: agent-proven possession, certificate issuance, and
//! the bidirectional byte proxy for one `direct-tcpip` channel.

use std::sync::Arc;

use rand::RngCore;
use rand::rngs::OsRng;
use russh::server::{Msg, Session};
use russh::{Channel, ChannelId};
use signature::Verifier;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{error, info};

use super::ServerHandler;
use crate::agent::{ForwardedAgent, key_wire_bytes};
use crate::error::{ServerError, ServerResult};
use crate::notify;
use crate::server::ServerState;
use crate::session::{CloseOnce, SessionState};

/// Lifetime of the ephemeral credential inside the client's agent.
const AGENT_KEY_LIFETIME_SECS: u32 = 10;

/// Size of the random possession challenge the agent must sign.
const CHALLENGE_LEN: usize = 128;

/// Decoded `direct-tcpip` channel-open request.
#[derive(Debug, Clone)]
pub(crate) struct ForwardRequest {
    pub host: String,
    pub port: u16,
    pub originator: String,
    pub originator_port: u16,
}

impl ForwardRequest {
    pub(crate) fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ServerHandler {
    /// Accept the channel and run the pipeline in its own task. russh
    /// decides accept/reject from this callback's return value, so failures
    /// discovered during the asynchronous steps terminate the accepted
    /// channel instead; either way no byte ever flows on a denied forward.
    pub(super) fn handle_forward_channel_open(
        &mut self,
        channel: Channel<Msg>,
        request: ForwardRequest,
        session: &mut Session,
    ) -> Result<bool, russh::Error> {
        let Some(bastion_session) = self.session.clone() else {
            return Ok(false);
        };
        let state = self.state.clone();
        let handle = session.handle();

        tokio::spawn(async move {
            let id = bastion_session.id;
            if let Err(err) = run(state, bastion_session, handle, channel, request).await {
                error!(id = %id, error = %err, "forward channel failed");
            }
        });
        Ok(true)
    }
}

async fn run(
    state: Arc<ServerState>,
    session: Arc<SessionState>,
    handle: russh::server::Handle,
    channel: Channel<Msg>,
    request: ForwardRequest,
) -> ServerResult<()> {
    match establish(&state, &session, &handle, &request).await {
        Ok(upstream) => {
            proxy(channel, upstream, handle).await;
            Ok(())
        }
        Err(err) => {
            let _ = channel.eof().await;
            let _ = channel.close().await;
            Err(err)
        }
    }
}

/// Drive every step up to (but not including) the byte proxy: agent channel,
/// possession verification, policy, certificate issuance, notification, and
/// the upstream dial.
async fn establish(
    state: &ServerState,
    session: &SessionState,
    handle: &russh::server::Handle,
    request: &ForwardRequest,
) -> ServerResult<TcpStream> {
    ensure_agent(session, handle).await?;

    // The verify gate spans the verified check, the possession protocol and
    // issuance: concurrent channels on one session serialize here, so at
    // most one flips `verified` and none issues a credential without
    // observing it set.
    {
        let _gate = session.verify_gate.lock().await;
        if !session.is_verified() {
            verify_possession(state, session).await?;
        }

        if !session.account.policy().permits(&request.host) {
            return Err(ServerError::PolicyDenied {
                host: request.host.clone(),
            });
        }

        issue_credential(state, session, request).await?;
    }

    notify::notify_session_start(
        state.notifiers.clone(),
        session.account.username.clone(),
        session.id,
        request.host.clone(),
        session
            .remote_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "<unknown>".into()),
    );

    let upstream = TcpStream::connect((request.host.as_str(), request.port))
        .await
        .map_err(|err| {
            error!(
                id = %session.id,
                host = %request.address(),
                error = %err,
                "failed to open tcp connection to destination"
            );
            ServerError::Io(err)
        })?;
    session.record_proxy(request.address());

    info!(
        id = %session.id,
        user = %session.account.username,
        destination = %request.address(),
        originator = %format!("{}:{}", request.originator, request.originator_port),
        "forward established"
    );
    Ok(upstream)
}

/// Open the reverse `auth-agent@openssh.com` channel on first use. The
/// agent handle lives on the session and is reused by later channels.
async fn ensure_agent(
    session: &SessionState,
    handle: &russh::server::Handle,
) -> ServerResult<()> {
    let mut slot = session.agent.lock().await;
    if slot.is_none() {
        let channel = handle.channel_open_agent().await.map_err(|err| {
            ServerError::Agent(format!(
                "client has no forwarded ssh agent: {err}"
            ))
        })?;
        *slot = Some(ForwardedAgent::new(channel));
    }
    Ok(())
}

/// Prove the client holds the private half of one of the account's keys:
/// enumerate the agent's signers, pick the first one registered to this
/// account, and have it sign a random challenge. Failures never upgrade the
/// session's verified state.
async fn verify_possession(state: &ServerState, session: &SessionState) -> ServerResult<()> {
    let index = state.store.snapshot().await;
    let mut slot = session.agent.lock().await;
    let agent = slot
        .as_mut()
        .ok_or_else(|| ServerError::Agent("agent handle missing".into()))?;

    let identities = agent.identities().await?;
    for identity in identities {
        let wire = key_wire_bytes(&identity.pubkey)?;
        let Some(account_key) = index.key(&wire) else {
            continue;
        };
        if account_key.account.username != session.account.username {
            continue;
        }

        let mut challenge = [0u8; CHALLENGE_LEN];
        OsRng.fill_bytes(&mut challenge);

        let sig = agent.sign(&identity.pubkey, &challenge).await?;
        account_key
            .public_key
            .key_data()
            .verify(&challenge, &sig)
            .map_err(|_| ServerError::SignatureMismatch)?;

        session.mark_verified();
        info!(id = %session.id, "public key possession verified");
        return Ok(());
    }
    Err(ServerError::Unverified)
}

/// Mint the ephemeral certificate and inject it into the forwarded agent
/// with a short lifetime. Only reachable with `verified` set, under the
/// session's verify gate.
async fn issue_credential(
    state: &ServerState,
    session: &SessionState,
    request: &ForwardRequest,
) -> ServerResult<()> {
    if !session.is_verified() {
        return Err(ServerError::Unverified);
    }

    let principal = if state.config.force_user.is_empty() {
        session.account.username.as_str()
    } else {
        state.config.force_user.as_str()
    };
    let (certificate, key) = state.ca.generate(
        &session.id.to_string(),
        principal,
        &state.config.force_command,
    )?;

    let mut slot = session.agent.lock().await;
    let agent = slot
        .as_mut()
        .ok_or_else(|| ServerError::Agent("agent handle missing".into()))?;
    agent
        .add_certificate(
            &certificate,
            &key,
            AGENT_KEY_LIFETIME_SECS,
            format!("temporary ssh certificate ({})", request.host),
        )
        .await?;

    info!(
        id = %session.id,
        principal,
        destination = %request.host,
        "ephemeral certificate issued"
    );
    Ok(())
}

/// Copy bytes both ways until either side reaches end-of-stream. Whichever
/// direction finishes first fires the teardown latch; the other call is a
/// no-op, so the channel close sequence runs exactly once.
async fn proxy(channel: Channel<Msg>, upstream: TcpStream, handle: russh::server::Handle) {
    let id = channel.id();
    let (mut channel_rd, mut channel_wr) = tokio::io::split(channel.into_stream());
    let (mut tcp_rd, mut tcp_wr) = upstream.into_split();
    let latch = Arc::new(CloseOnce::new());

    let outbound = {
        let latch = latch.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut channel_rd, &mut tcp_wr).await;
            let _ = tcp_wr.shutdown().await;
            close_channel(&latch, &handle, id).await;
        })
    };
    let inbound = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut tcp_rd, &mut channel_wr).await;
        let _ = channel_wr.shutdown().await;
        close_channel(&latch, &handle, id).await;
    });

    let _ = tokio::join!(outbound, inbound);
}

async fn close_channel(latch: &CloseOnce, handle: &russh::server::Handle, id: ChannelId) {
    if latch.arm() {
        let _ = handle.eof(id).await;
        let _ = handle.close(id).await;
    }
}
