//! Access-token blacklist keyed by `jti`.
//!
//! Entries only need to live until the token would have expired anyway, so
//! every insert prunes what is already past its expiry.

use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

#[derive(Debug, Default)]
pub struct TokenBlacklist {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TokenBlacklist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self, jti: &str, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, expiry| *expiry > now);
        if expires_at > now {
            entries.insert(jti.to_string(), expires_at);
        }
    }

    #[must_use]
    pub fn is_revoked(&self, jti: &str, now: DateTime<Utc>) -> bool {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(jti).is_some_and(|expiry| *expiry > now)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn revoked_until_natural_expiry() {
        let now = Utc::now();
        let blacklist = TokenBlacklist::new();
        blacklist.revoke("jti-1", now + Duration::minutes(30), now);

        assert!(blacklist.is_revoked("jti-1", now));
        assert!(!blacklist.is_revoked("jti-2", now));
        assert!(!blacklist.is_revoked("jti-1", now + Duration::minutes(31)));
    }

    #[test]
    fn insert_prunes_expired_entries() {
        let now = Utc::now();
        let blacklist = TokenBlacklist::new();
        blacklist.revoke("old", now + Duration::minutes(1), now);
        blacklist.revoke("new", now + Duration::hours(1), now + Duration::minutes(2));

        assert_eq!(blacklist.len(), 1);
        assert!(blacklist.is_revoked("new", now + Duration::minutes(2)));
    }

    #[test]
    fn already_expired_token_is_not_stored() {
        let now = Utc::now();
        let blacklist = TokenBlacklist::new();
        blacklist.revoke("stale", now - Duration::seconds(1), now);
        assert!(blacklist.is_empty());
    }
}
