//! Per-connection session state and the process-wide session registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::agent::ForwardedAgent;
use crate::store::Account;

/// State owned by one authenticated SSH connection.
pub struct SessionState {
    pub id: Uuid,
    pub account: Arc<Account>,
    pub remote_addr: Option<SocketAddr>,
    /// Handle to the underlying connection; absent only in unit tests.
    handle: Option<russh::server::Handle>,
    /// Monotonic: flips false -> true once agent possession is proven and
    /// never goes back.
    verified: AtomicBool,
    /// Serializes the verify-and-issue critical section so concurrent
    /// channels cannot race the `verified` transition.
    pub(crate) verify_gate: AsyncMutex<()>,
    /// Lazily initialized forwarded-agent slot; the first forward channel
    /// opens the reverse agent channel, later channels observe it.
    pub(crate) agent: AsyncMutex<Option<ForwardedAgent>>,
    /// Destinations proxied by this session, append-only for auditing.
    proxied: Mutex<Vec<String>>,
}

impl SessionState {
    pub fn new(
        account: Arc<Account>,
        remote_addr: Option<SocketAddr>,
        handle: Option<russh::server::Handle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            account,
            remote_addr,
            handle,
            verified: AtomicBool::new(false),
            verify_gate: AsyncMutex::new(()),
            agent: AsyncMutex::new(None),
            proxied: Mutex::new(Vec::new()),
        })
    }

    /// Tear down the underlying connection. The message is informational.
    pub async fn close(&self, message: &str) {
        if let Some(handle) = &self.handle {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, message.into(), "en".into())
                .await;
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Acquire)
    }

    pub(crate) fn mark_verified(&self) {
        self.verified.store(true, Ordering::Release);
    }

    pub fn record_proxy(&self, destination: String) {
        self.proxied.lock().expect("proxied list lock").push(destination);
    }

    pub fn proxied_destinations(&self) -> Vec<String> {
        self.proxied.lock().expect("proxied list lock").clone()
    }
}

/// Process-wide table of live sessions, keyed by session UUID. Sessions
/// insert themselves on creation and remove themselves when the connection
/// ends; auditing paths read concurrently.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Arc<SessionState>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<SessionState>) {
        self.sessions
            .lock()
            .expect("session table lock")
            .insert(session.id, session);
    }

    pub fn remove(&self, id: &Uuid) {
        self.sessions.lock().expect("session table lock").remove(id);
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<SessionState>> {
        self.sessions.lock().expect("session table lock").get(id).cloned()
    }

    pub fn active(&self) -> Vec<Arc<SessionState>> {
        self.sessions
            .lock()
            .expect("session table lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session table lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One-shot teardown latch for a proxied channel. Both copy directions race
/// to fire it; only the first caller gets to run the close sequence.
#[derive(Default)]
pub struct CloseOnce(AtomicBool);

impl CloseOnce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true exactly once, for the caller that should run teardown.
    pub fn arm(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}
