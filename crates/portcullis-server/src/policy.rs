//! Per-account destination policy.

use regex::Regex;
use tracing::warn;

/// Allow/deny decision material for one account's outbound forwards.
///
/// Decisions are evaluated against the raw host portion of a forward
/// request, never the `host:port` pair.
#[derive(Debug, Default)]
pub struct HostPolicy {
    whitelist: Option<Regex>,
    blacklist: Option<Regex>,
    /// Set when a configured pattern failed to compile; denies everything.
    poisoned: bool,
}

impl HostPolicy {
    pub fn new(whitelist: Option<Regex>, blacklist: Option<Regex>) -> Self {
        Self {
            whitelist,
            blacklist,
            poisoned: false,
        }
    }

    /// Compile the account's configured patterns. A pattern that does not
    /// compile fails closed: the resulting policy denies every host.
    pub fn compile(whitelist: Option<&str>, blacklist: Option<&str>, username: &str) -> Self {
        let mut poisoned = false;
        let mut build = |pattern: Option<&str>, which: &str| match pattern {
            None => None,
            Some(raw) => match Regex::new(raw) {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!(
                        username,
                        pattern = raw,
                        which,
                        error = %err,
                        "invalid policy pattern; denying all destinations for account"
                    );
                    poisoned = true;
                    None
                }
            },
        };
        let whitelist = build(whitelist, "whitelist");
        let blacklist = build(blacklist, "blacklist");
        Self {
            whitelist,
            blacklist,
            poisoned,
        }
    }

    /// Whether the account may open a forward to `host`.
    pub fn permits(&self, host: &str) -> bool {
        if self.poisoned {
            return false;
        }
        if let Some(whitelist) = &self.whitelist
            && !whitelist.is_match(host)
        {
            return false;
        }
        if let Some(blacklist) = &self.blacklist
            && blacklist.is_match(host)
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(whitelist: Option<&str>, blacklist: Option<&str>) -> HostPolicy {
        HostPolicy::compile(whitelist, blacklist, "test")
    }

    #[test]
    fn no_patterns_allows_everything() {
        let p = policy(None, None);
        assert!(p.permits("db-01"));
        assert!(p.permits("evil.example.com"));
    }

    #[test]
    fn whitelist_must_match() {
        let p = policy(Some("^db-.*$"), None);
        assert!(p.permits("db-01"));
        assert!(!p.permits("web-01"));
    }

    #[test]
    fn blacklist_must_not_match() {
        let p = policy(None, Some(r"evil\.example\.com"));
        assert!(p.permits("db-01"));
        assert!(!p.permits("evil.example.com"));
    }

    #[test]
    fn blacklist_wins_inside_whitelist() {
        let p = policy(Some("^db-.*$"), Some("^db-secret$"));
        assert!(p.permits("db-01"));
        assert!(!p.permits("db-secret"));
        assert!(!p.permits("web-01"));
    }

    // Truth table: allow iff (whitelist empty or matching) and (blacklist
    // empty or not matching).
    #[test]
    fn decision_truth_table() {
        let hosts = ["db-01", "web-01", "db-secret"];
        let whitelists = [None, Some("^db-.*$")];
        let blacklists = [None, Some("secret")];
        for wl in whitelists {
            for bl in blacklists {
                let p = policy(wl, bl);
                for host in hosts {
                    let expected = wl.map(|w| Regex::new(w).unwrap().is_match(host)).unwrap_or(true)
                        && !bl.map(|b| Regex::new(b).unwrap().is_match(host)).unwrap_or(false);
                    assert_eq!(p.permits(host), expected, "wl={wl:?} bl={bl:?} host={host}");
                }
            }
        }
    }

    #[test]
    fn invalid_pattern_fails_closed() {
        let p = policy(Some("("), None);
        assert!(!p.permits("db-01"));
        let p = policy(None, Some("["));
        assert!(!p.permits("anything"));
    }
}
