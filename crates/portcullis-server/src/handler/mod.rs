//! SSH handler that drives per-connection state: authentication, forward
//! channels, and the legacy interactive shell.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use russh::server::{Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tracing::{error, info};

use crate::server::{ServerState, display_addr};
use crate::session::SessionState;

mod auth;
mod forward;
mod shell;

pub(crate) use forward::ForwardRequest;
use shell::ShellChannel;

/// Tracks the lifecycle of a single SSH connection.
pub(crate) struct ServerHandler {
    state: Arc<ServerState>,
    peer_addr: Option<SocketAddr>,
    /// Username accepted during the public-key handshake.
    username: Option<String>,
    /// Populated once the handshake succeeds and the session is registered.
    session: Option<Arc<SessionState>>,
    /// Interactive-mode state for the active session channel.
    shell: Option<ShellChannel>,
    connected_at: Instant,
    closed: bool,
}

impl ServerHandler {
    pub(crate) fn new(state: Arc<ServerState>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            state,
            peer_addr,
            username: None,
            session: None,
            shell: None,
            connected_at: Instant::now(),
            closed: false,
        }
    }

    fn send_bytes(
        &self,
        session: &mut Session,
        channel: ChannelId,
        bytes: &[u8],
    ) -> Result<(), russh::Error> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut payload = CryptoVec::new();
        payload.extend(bytes);
        session.data(channel, payload)
    }

    fn send_line(
        &self,
        session: &mut Session,
        channel: ChannelId,
        line: &str,
    ) -> Result<(), russh::Error> {
        let mut payload = CryptoVec::new();
        payload.extend(line.as_bytes());
        payload.extend(b"\r\n");
        session.data(channel, payload)
    }

    fn log_disconnect(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let elapsed = self.connected_at.elapsed();
        info!(
            peer = %display_addr(self.peer_addr),
            user = %self.username.as_deref().unwrap_or("<unauthenticated>"),
            duration = ?elapsed,
            reason,
            "client disconnected",
        );
    }
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        // The handler drop is the one reliable end-of-connection point;
        // deregister the session here so abrupt disconnects clean up too.
        if let Some(session) = self.session.take() {
            self.state.registry.remove(&session.id);
        }
        if !self.closed {
            self.log_disconnect("connection dropped");
        }
    }
}

impl russh::server::Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<russh::server::Auth, Self::Error> {
        self.handle_auth_publickey(user, public_key).await
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        self.handle_auth_succeeded(session.handle()).await
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.state.config.interactive {
            error!(
                peer = %display_addr(self.peer_addr),
                "rejecting session channel; this deployment only forwards"
            );
            return Ok(false);
        }
        self.handle_shell_channel_open(channel)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.state.config.interactive {
            error!(
                peer = %display_addr(self.peer_addr),
                "rejecting direct-tcpip channel in interactive deployment"
            );
            return Ok(false);
        }
        let request = ForwardRequest {
            host: host_to_connect.to_string(),
            port: port_to_connect as u16,
            originator: originator_address.to_string(),
            originator_port: originator_port as u16,
        };
        self.handle_forward_channel_open(channel, request, session)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_shell_request(channel, session).await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Only the default shell is served; command execution is refused.
        session.channel_failure(channel)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_pty_request(channel, term, col_width, row_height, session)
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_window_change(channel, col_width, row_height).await
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_shell_data(channel, data, session).await
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_shell_channel_gone(channel, session)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.handle_shell_channel_gone(channel, session)
    }
}
