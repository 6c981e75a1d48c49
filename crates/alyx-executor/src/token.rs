use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

struct TokenEntry {
    function_id: String,
    expires_at: DateTime<Utc>,
}

/// Internal callback tokens.
///
/// Each invocation gets a short-lived bearer token bound to its function id
/// so the child can call back into the record store without
/// re-authenticating. Tokens are revoked when the process exits.
pub struct TokenVault {
    tokens: DashMap<String, TokenEntry>,
    ttl: Duration,
}

impl TokenVault {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: DashMap::new(),
            ttl,
        }
    }

    /// Mint a token for one invocation of `function_id`.
    pub fn issue(&self, function_id: &str) -> String {
        let token = format!("alyx_{}", Uuid::new_v4().simple());
        self.tokens.insert(
            token.clone(),
            TokenEntry {
                function_id: function_id.to_string(),
                expires_at: Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or_default(),
            },
        );
        token
    }

    /// Resolve a token to its function id, extending the TTL on use.
    /// Expired or unknown tokens resolve to `None`.
    pub fn validate(&self, token: &str) -> Option<String> {
        let mut entry = self.tokens.get_mut(token)?;
        if entry.expires_at < Utc::now() {
            drop(entry);
            self.tokens.remove(token);
            return None;
        }
        entry.expires_at =
            Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or_default();
        Some(entry.function_id.clone())
    }

    pub fn revoke(&self, token: &str) {
        self.tokens.remove(token);
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.tokens.len();
        self.tokens.retain(|_, entry| entry.expires_at >= now);
        let removed = before - self.tokens.len();
        if removed > 0 {
            debug!(removed, "purged expired callback tokens");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_validate_revoke() {
        let vault = TokenVault::new(Duration::from_secs(300));
        let token = vault.issue("notify");

        assert_eq!(vault.validate(&token).as_deref(), Some("notify"));
        vault.revoke(&token);
        assert!(vault.validate(&token).is_none());
    }

    #[test]
    fn expired_tokens_fail_validation() {
        let vault = TokenVault::new(Duration::from_secs(0));
        let token = vault.issue("notify");
        std::thread::sleep(Duration::from_millis(5));
        assert!(vault.validate(&token).is_none());
        // the failed validation also removed the entry
        assert!(vault.is_empty());
    }

    #[test]
    fn purge_drops_only_expired() {
        let vault = TokenVault::new(Duration::from_secs(300));
        let live = vault.issue("live");
        vault.tokens.insert(
            "alyx_dead".to_string(),
            TokenEntry {
                function_id: "dead".to_string(),
                expires_at: Utc::now() - chrono::Duration::seconds(1),
            },
        );

        assert_eq!(vault.purge_expired(), 1);
        assert_eq!(vault.validate(&live).as_deref(), Some("live"));
    }

    #[test]
    fn tokens_are_unique() {
        let vault = TokenVault::new(Duration::from_secs(300));
        assert_ne!(vault.issue("a"), vault.issue("a"));
    }
}
