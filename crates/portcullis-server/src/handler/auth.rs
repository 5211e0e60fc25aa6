//! Public-key handshake against the account index.

use russh::server::Auth;
use tracing::{error, info, warn};

use super::ServerHandler;
use crate::server::display_addr;
use crate::session::SessionState;

impl ServerHandler {
    pub(super) async fn handle_auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, russh::Error> {
        let wire = match public_key.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = %err, "failed to encode offered public key");
                return Ok(Auth::reject());
            }
        };

        let index = self.state.store.snapshot().await;
        match index.key(&wire) {
            Some(key) if key.account.username == user => {
                self.username = Some(user.to_string());
                info!(
                    peer = %display_addr(self.peer_addr),
                    user,
                    "public key authentication accepted"
                );
                Ok(Auth::Accept)
            }
            // An unknown key and a key held by another account reject
            // identically; the client learns nothing about which it was.
            Some(_) | None => {
                warn!(
                    peer = %display_addr(self.peer_addr),
                    user,
                    "public key authentication rejected"
                );
                Ok(Auth::reject())
            }
        }
    }

    pub(super) async fn handle_auth_succeeded(
        &mut self,
        handle: russh::server::Handle,
    ) -> Result<(), russh::Error> {
        let username = self.username.clone().ok_or(russh::Error::Disconnect)?;
        let index = self.state.store.snapshot().await;
        let account = index.account(&username).ok_or_else(|| {
            // The account vanished between handshake and success (reload);
            // no session is created for an unknown user.
            error!(user = %username, "account missing after successful handshake");
            russh::Error::Disconnect
        })?;

        let session = SessionState::new(account, self.peer_addr, Some(handle));
        info!(
            id = %session.id,
            user = %username,
            remote = %display_addr(self.peer_addr),
            "new ssh session created"
        );
        self.state.registry.insert(session.clone());
        self.session = Some(session);
        Ok(())
    }
}
