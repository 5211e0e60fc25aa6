//! In-memory account index, rebuilt atomically from the accounts file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use portcullis_types::AccountRecord;
use ssh_key::PublicKey;
use ssh_key::authorized_keys::Entry;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{ServerError, ServerResult};
use crate::policy::HostPolicy;

/// One provisioned account.
#[derive(Debug)]
pub struct Account {
    pub username: String,
    /// bcrypt hash, retained for the provisioning tooling; never consulted
    /// during bastion authentication.
    pub password_hash: String,
    /// Authorized-keys lines as provisioned; the key index owns the parsed
    /// form.
    pub authorized_keys: Vec<String>,
    pub totp_secret: String,
    pub shell: Option<String>,
    whitelist: Option<String>,
    blacklist: Option<String>,
    policy: OnceLock<HostPolicy>,
}

impl Account {
    fn from_record(record: AccountRecord) -> Self {
        Self {
            username: record.username,
            password_hash: record.password,
            authorized_keys: record.ssh_keys,
            totp_secret: record.mfa.totp,
            shell: record.shell,
            whitelist: record.whitelist,
            blacklist: record.blacklist,
            policy: OnceLock::new(),
        }
    }

    /// The account's destination policy, compiled on first use.
    pub fn policy(&self) -> &HostPolicy {
        self.policy.get_or_init(|| {
            HostPolicy::compile(
                self.whitelist.as_deref(),
                self.blacklist.as_deref(),
                &self.username,
            )
        })
    }
}

/// A parsed authorized key and the account it belongs to.
///
/// Identity is the SSH wire encoding of the public key; that is the lookup
/// key during handshake and signer matching.
#[derive(Debug, Clone)]
pub struct AccountKey {
    pub account: Arc<Account>,
    pub public_key: PublicKey,
    pub comment: String,
    pub options: Vec<String>,
}

impl AccountKey {
    /// Parse one authorized-keys line for `account`.
    pub fn parse(account: Arc<Account>, line: &str) -> ServerResult<Self> {
        let entry: Entry = line.trim().parse().map_err(ServerError::crypto)?;
        let public_key = entry.public_key().clone();
        let options = entry
            .config_opts()
            .iter()
            .map(str::to_owned)
            .collect::<Vec<_>>();
        Ok(Self {
            comment: public_key.comment().to_owned(),
            account,
            public_key,
            options,
        })
    }

    /// Wire encoding of the public key; the key's identity in the index.
    pub fn wire_id(&self) -> ServerResult<Vec<u8>> {
        self.public_key.to_bytes().map_err(ServerError::crypto)
    }
}

/// An immutable snapshot of the account index. Lookups during a handshake or
/// forward all run against one snapshot, so a concurrent reload can never
/// show a half-built state.
#[derive(Debug, Default)]
pub struct AccountIndex {
    accounts: HashMap<String, Arc<Account>>,
    keys: HashMap<Vec<u8>, AccountKey>,
}

impl AccountIndex {
    /// Build an index from parsed account records, enforcing the store
    /// invariants: usernames are unique, and no public key maps to two
    /// accounts. A malformed key line is logged and skipped; an invariant
    /// violation rejects the whole batch.
    pub fn build(records: Vec<AccountRecord>) -> ServerResult<Self> {
        let mut accounts: HashMap<String, Arc<Account>> = HashMap::new();
        let mut keys: HashMap<Vec<u8>, AccountKey> = HashMap::new();

        for record in records {
            if accounts.contains_key(&record.username) {
                return Err(ServerError::DuplicateUsername(record.username));
            }
            let account = Arc::new(Account::from_record(record));
            accounts.insert(account.username.clone(), account.clone());

            for line in account.authorized_keys.clone() {
                let key = match AccountKey::parse(account.clone(), &line) {
                    Ok(key) => key,
                    Err(err) => {
                        warn!(
                            username = %account.username,
                            error = %err,
                            "skipping unparsable authorized key"
                        );
                        continue;
                    }
                };
                let id = key.wire_id()?;
                if let Some(other) = keys.get(&id) {
                    return Err(ServerError::DuplicateKey {
                        first: other.account.username.clone(),
                        second: account.username.clone(),
                    });
                }
                keys.insert(id, key);
            }
        }

        Ok(Self { accounts, keys })
    }

    pub fn account(&self, username: &str) -> Option<Arc<Account>> {
        self.accounts.get(username).cloned()
    }

    pub fn key(&self, wire: &[u8]) -> Option<&AccountKey> {
        self.keys.get(wire)
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}

/// The process-wide account store. Readers take a cheap `Arc` snapshot;
/// `reload` swaps the snapshot atomically and leaves the previous one intact
/// when the new file does not pass validation.
pub struct AccountStore {
    path: PathBuf,
    index: RwLock<Arc<AccountIndex>>,
}

impl AccountStore {
    /// Load the accounts file for the first time. Errors here are fatal at
    /// daemon startup.
    pub fn load(path: &Path) -> ServerResult<Self> {
        let index = Self::build_from_file(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            index: RwLock::new(Arc::new(index)),
        })
    }

    fn build_from_file(path: &Path) -> ServerResult<AccountIndex> {
        let raw = std::fs::read_to_string(path)?;
        let records: Vec<AccountRecord> = serde_json::from_str(&raw)?;
        AccountIndex::build(records)
    }

    /// Re-read the accounts file and atomically replace the index. On any
    /// parse error or invariant violation the previous index stays in place.
    pub async fn reload(&self) -> ServerResult<()> {
        let fresh = Self::build_from_file(&self.path)?;
        *self.index.write().await = Arc::new(fresh);
        Ok(())
    }

    /// The current index snapshot.
    pub async fn snapshot(&self) -> Arc<AccountIndex> {
        self.index.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(username: &str, keys: Vec<String>) -> AccountRecord {
        serde_json::from_value(serde_json::json!({
            "username": username,
            "ssh-keys": keys,
            "mfa": {"totp": "JBSWY3DPEHPK3PXP"},
        }))
        .unwrap()
    }

    fn fresh_key() -> String {
        let mut rng = ssh_key::rand_core::OsRng;
        let key = ssh_key::PrivateKey::random(&mut rng, ssh_key::Algorithm::Ed25519).unwrap();
        key.public_key().to_openssh().unwrap()
    }

    #[test]
    fn duplicate_username_rejects_batch() {
        let records = vec![record("alice", vec![]), record("alice", vec![])];
        assert!(matches!(
            AccountIndex::build(records),
            Err(ServerError::DuplicateUsername(name)) if name == "alice"
        ));
    }

    #[test]
    fn duplicate_key_rejects_batch() {
        let shared = fresh_key();
        let records = vec![
            record("alice", vec![shared.clone()]),
            record("bob", vec![shared]),
        ];
        assert!(matches!(
            AccountIndex::build(records),
            Err(ServerError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn malformed_key_is_skipped_not_fatal() {
        let good = fresh_key();
        let records = vec![record(
            "alice",
            vec!["not an authorized key".to_string(), good],
        )];
        let index = AccountIndex::build(records).unwrap();
        assert_eq!(index.account_count(), 1);
        assert_eq!(index.key_count(), 1);
    }

    #[test]
    fn key_lookup_round_trips_wire_identity() {
        let line = fresh_key();
        let index = AccountIndex::build(vec![record("alice", vec![line.clone()])]).unwrap();
        let parsed: ssh_key::PublicKey = line.parse().unwrap();
        let found = index.key(&parsed.to_bytes().unwrap()).unwrap();
        assert_eq!(found.account.username, "alice");
    }

    #[test]
    fn options_and_comment_survive_parsing() {
        let mut rng = ssh_key::rand_core::OsRng;
        let key = ssh_key::PrivateKey::random(&mut rng, ssh_key::Algorithm::Ed25519).unwrap();
        let bare = key.public_key().to_openssh().unwrap();
        let line = format!("no-agent-forwarding,no-x11-forwarding {bare} alice@laptop");
        let account = Arc::new(Account::from_record(record("alice", vec![])));
        let parsed = AccountKey::parse(account, &line).unwrap();
        assert_eq!(parsed.comment, "alice@laptop");
        assert_eq!(
            parsed.options,
            vec!["no-agent-forwarding".to_string(), "no-x11-forwarding".to_string()]
        );
    }
}
