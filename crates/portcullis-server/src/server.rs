//! SSH daemon startup: host key loading, listener configuration, and the
//! per-connection handler factory.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use portcullis_types::Config;
use russh::keys::PrivateKey;
use russh::server::Server;
use russh::{MethodKind, MethodSet, Preferred};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use crate::ca::CertAuthority;
use crate::error::{ServerError, ServerResult};
use crate::handler::ServerHandler;
use crate::notify::{DiscordWebhook, NotificationEndpoint};
use crate::recording::ensure_recording_dir;
use crate::session::SessionRegistry;
use crate::store::AccountStore;

/// Immutable daemon-wide state shared by every connection handler.
pub struct ServerState {
    pub config: Config,
    pub store: AccountStore,
    pub ca: CertAuthority,
    pub registry: SessionRegistry,
    pub notifiers: Arc<Vec<NotificationEndpoint>>,
}

/// Run the bastion daemon until the listener fails. Startup errors (key
/// load, accounts load, listen) are returned to the caller and fatal.
pub async fn run(config: Config) -> ServerResult<()> {
    ensure_recording_dir(&config.recording_path)?;

    let host_key = load_host_key(&config.id_rsa_host)?;
    let ca = CertAuthority::load(&config.id_rsa_ca)?;
    let store = AccountStore::load(&config.accounts)?;

    let notifiers = config
        .discord_webhooks
        .iter()
        .cloned()
        .map(|url| NotificationEndpoint::Discord(DiscordWebhook::new(url)))
        .collect::<Vec<_>>();

    let state = Arc::new(ServerState {
        store,
        ca,
        registry: SessionRegistry::new(),
        notifiers: Arc::new(notifiers),
        config,
    });

    reload_accounts_on_hangup(state.clone());

    let mut server_config = russh::server::Config {
        preferred: Preferred::DEFAULT.clone(),
        auth_rejection_time: Duration::from_millis(250),
        auth_rejection_time_initial: Some(Duration::from_millis(0)),
        nodelay: true,
        ..Default::default()
    };
    // Public-key authentication only; the remaining factors run per channel.
    server_config.methods = MethodSet::empty();
    server_config.methods.push(MethodKind::PublicKey);
    server_config.keys.push(host_key);

    let mode = if state.config.interactive {
        "interactive"
    } else {
        "forwarding"
    };
    info!(bind = %state.config.bind, mode, "starting bastion ssh listener");

    let bind = state.config.bind.clone();
    let mut server = ServerManager { state };
    server
        .run_on_address(Arc::new(server_config), bind.as_str())
        .await?;
    Ok(())
}

fn load_host_key(path: &Path) -> ServerResult<PrivateKey> {
    let pem = std::fs::read_to_string(path)?;
    russh::keys::decode_secret_key(&pem, None).map_err(ServerError::crypto)
}

/// SIGHUP rebuilds the account index from the accounts file; a rejected file
/// leaves the previous index serving.
fn reload_accounts_on_hangup(state: Arc<ServerState>) {
    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "SIGHUP handler unavailable; accounts reload disabled");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match state.store.reload().await {
                Ok(()) => {
                    let index = state.store.snapshot().await;
                    info!(
                        accounts = index.account_count(),
                        keys = index.key_count(),
                        "accounts reloaded"
                    );
                }
                Err(err) => {
                    error!(error = %err, "accounts reload failed; keeping previous accounts");
                }
            }
        }
    });
}

/// Factory invoked by russh whenever a client connects.
struct ServerManager {
    state: Arc<ServerState>,
}

impl Server for ServerManager {
    type Handler = ServerHandler;

    fn new_client(&mut self, addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = %display_addr(addr), "client connected");
        ServerHandler::new(self.state.clone(), addr)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        warn!(?error, "server session ended with error");
    }
}

/// Display helper used for tracing; keeps logging concise when the socket
/// address is unavailable.
pub(crate) fn display_addr(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|| "<unknown>".into())
}
