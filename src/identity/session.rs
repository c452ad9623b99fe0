//! Refresh-session lifecycle.
//!
//! A login either rotates or coexists with existing sessions depending on the
//! client flavor:
//!
//! - mobile: the device id is a durable per-install id. Any active session on
//!   that device is revoked ("New login on same device") and the new one lives
//!   60 days with the app version recorded.
//! - web: the device id is a fingerprint that may match several historical
//!   sessions. Every active `web` session on it is revoked ("New web login")
//!   and the new one lives 30 days with user agent and IP recorded.
//!
//! Sessions move `Active -> Revoked` or expire by time; neither is reversible.
//! The revoke-then-insert step is delegated to [`SessionStore::rotate`], which
//! performs it atomically.

use anyhow::Context;
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    client::ClientInfo,
    clock::Clock,
    error::{AuthError, AuthResult},
    models::{RefreshSession, SessionFlavor},
    store::{RevokeOutcome, RotationOutcome, RotationRequest, RotationScope, SessionStore},
};

pub const MOBILE_SESSION_DAYS: u32 = 60;
pub const WEB_SESSION_DAYS: u32 = 30;
pub const DEFAULT_APP_VERSION: &str = "1.0.0";

pub const REASON_MOBILE_RELOGIN: &str = "New login on same device";
pub const REASON_WEB_RELOGIN: &str = "New web login";
pub const REASON_ROTATED: &str = "Rotated";
pub const REASON_LOGOUT: &str = "Logout";
pub const REASON_ADMIN: &str = "Revoked by administrator";

/// One row of the "where am I logged in" list.
///
/// `is_current` compares device ids only. Two browsers that share a derived
/// fingerprint (same user agent behind the same NAT) are both flagged, so the
/// flag is informational and never a security boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
    pub last_used: DateTime<Utc>,
    pub is_current: bool,
}

/// A session that has been built but not yet written.
///
/// The raw refresh token only ever exists here and in the response to the
/// client; storage sees its SHA-256.
#[derive(Clone, Debug)]
pub struct PendingSession {
    pub session: RefreshSession,
    pub refresh_token: String,
    scope: RotationScope,
    reason: &'static str,
    replaces: Option<Uuid>,
}

/// Create a new opaque refresh token.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_refresh_token() -> anyhow::Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate refresh token")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Hash a refresh token so raw values never touch storage.
#[must_use]
pub fn hash_refresh_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    web_session_days: u32,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            web_session_days: WEB_SESSION_DAYS,
        }
    }

    /// Override the web-session lifetime (the configured refresh-token
    /// default). Zero keeps the built-in value.
    #[must_use]
    pub fn with_web_session_days(mut self, days: u32) -> Self {
        if days > 0 {
            self.web_session_days = days;
        }
        self
    }

    #[must_use]
    pub fn lifetime(&self, flavor: SessionFlavor) -> Duration {
        match flavor {
            SessionFlavor::Mobile => Duration::days(i64::from(MOBILE_SESSION_DAYS)),
            SessionFlavor::Web => Duration::days(i64::from(self.web_session_days)),
        }
    }

    /// Build the session for a fresh login without touching storage.
    ///
    /// # Errors
    /// Infrastructure error if no refresh token can be generated.
    pub fn prepare(&self, user_id: Uuid, client: &ClientInfo) -> AuthResult<PendingSession> {
        let now = self.clock.now();
        let flavor = client.flavor();
        let refresh_token = generate_refresh_token()?;

        let (app_version, user_agent, ip_address) = match flavor {
            SessionFlavor::Mobile => (
                Some(
                    client
                        .app_version
                        .clone()
                        .unwrap_or_else(|| DEFAULT_APP_VERSION.to_string()),
                ),
                None,
                None,
            ),
            SessionFlavor::Web => (
                None,
                Some(client.user_agent.clone().unwrap_or_default()),
                client.ip_address.clone(),
            ),
        };

        let session = RefreshSession {
            id: Uuid::now_v7(),
            user_id,
            token_hash: hash_refresh_token(&refresh_token),
            flavor,
            issued_at: now,
            expires_at: now + self.lifetime(flavor),
            last_used: now,
            revoked: false,
            revoked_reason: None,
            revoked_at: None,
            device_id: client.device_id.clone(),
            device_name: client.device_name.clone(),
            platform: client.platform.clone(),
            app_version,
            user_agent,
            ip_address,
        };

        let scope = RotationScope::Device {
            device_id: client.device_id.clone(),
        };
        let reason = match flavor {
            SessionFlavor::Mobile => REASON_MOBILE_RELOGIN,
            SessionFlavor::Web => REASON_WEB_RELOGIN,
        };

        Ok(PendingSession {
            session,
            refresh_token,
            scope,
            reason,
            replaces: None,
        })
    }

    /// Build the successor of `current` for a refresh-token exchange. Device
    /// fields carry over and the flavor's lifetime restarts.
    ///
    /// # Errors
    /// Infrastructure error if no refresh token can be generated.
    pub fn prepare_rotation(&self, current: &RefreshSession) -> AuthResult<PendingSession> {
        let now = self.clock.now();
        let refresh_token = generate_refresh_token()?;
        let session = RefreshSession {
            id: Uuid::now_v7(),
            token_hash: hash_refresh_token(&refresh_token),
            issued_at: now,
            expires_at: now + self.lifetime(current.flavor),
            last_used: now,
            revoked: false,
            revoked_reason: None,
            revoked_at: None,
            ..current.clone()
        };
        Ok(PendingSession {
            session,
            refresh_token,
            scope: RotationScope::Device {
                device_id: current.device_id.clone(),
            },
            reason: REASON_ROTATED,
            replaces: Some(current.id),
        })
    }

    /// Durably write a prepared session, revoking whatever it supersedes.
    ///
    /// # Errors
    /// [`AuthError::Unauthenticated`] if a refresh rotation lost a race with
    /// another rotation or a logout; infrastructure errors otherwise. Nothing
    /// is written on error.
    #[instrument(skip_all, fields(user_id = %pending.session.user_id, flavor = %pending.session.flavor))]
    pub async fn commit(&self, pending: &PendingSession) -> AuthResult<RefreshSession> {
        let request = RotationRequest {
            scope: pending.scope.clone(),
            reason: pending.reason.to_string(),
            session: pending.session.clone(),
            now: self.clock.now(),
            replaces: pending.replaces,
        };

        match self.store.rotate(&request).await? {
            RotationOutcome::Committed { revoked } => {
                if !revoked.is_empty() {
                    info!(
                        revoked = revoked.len(),
                        reason = pending.reason,
                        "superseded existing sessions"
                    );
                }
                Ok(pending.session.clone())
            }
            RotationOutcome::Superseded => {
                debug!("session was revoked before rotation committed");
                Err(AuthError::Unauthenticated)
            }
        }
    }

    /// Create and persist a session for a login in one step.
    ///
    /// # Errors
    /// See [`SessionManager::commit`].
    pub async fn start_session(
        &self,
        user_id: Uuid,
        client: &ClientInfo,
    ) -> AuthResult<(RefreshSession, String)> {
        let pending = self.prepare(user_id, client)?;
        let session = self.commit(&pending).await?;
        Ok((session, pending.refresh_token))
    }

    /// Active sessions, most recently used first.
    ///
    /// # Errors
    /// Storage failures propagate.
    pub async fn list_active_sessions(
        &self,
        user_id: Uuid,
        current_device_id: &str,
    ) -> AuthResult<Vec<SessionSummary>> {
        let sessions = self.store.list_active(user_id, self.clock.now()).await?;
        Ok(sessions
            .into_iter()
            .map(|session| SessionSummary {
                is_current: session.device_id == current_device_id,
                device_id: session.device_id,
                device_name: session.device_name,
                platform: session.platform,
                last_used: session.last_used,
            })
            .collect())
    }

    /// Revoke a session. Revoking an already revoked session is a no-op.
    ///
    /// # Errors
    /// [`AuthError::NotFound`] if the record does not exist.
    pub async fn revoke(&self, session: &RefreshSession, reason: &str) -> AuthResult<()> {
        self.revoke_by_id(session.id, reason).await
    }

    /// Administrative revoke by id.
    ///
    /// # Errors
    /// [`AuthError::NotFound`] if no session has that id.
    #[instrument(skip(self))]
    pub async fn revoke_by_id(&self, session_id: Uuid, reason: &str) -> AuthResult<()> {
        match self.store.revoke(session_id, reason, self.clock.now()).await? {
            RevokeOutcome::Revoked => {
                info!("session revoked");
                Ok(())
            }
            RevokeOutcome::AlreadyRevoked => Ok(()),
            RevokeOutcome::NotFound => Err(AuthError::NotFound { entity: "Session" }),
        }
    }

    /// # Errors
    /// Storage failures propagate.
    #[instrument(skip(self))]
    pub async fn revoke_all(&self, user_id: Uuid, reason: &str) -> AuthResult<u64> {
        let count = self.store.revoke_all(user_id, reason, self.clock.now()).await?;
        info!(count, "revoked all sessions");
        Ok(count)
    }

    /// Look up the session a raw refresh token belongs to, if it is still
    /// active.
    ///
    /// # Errors
    /// Storage failures propagate.
    pub async fn find_active_by_token(
        &self,
        refresh_token: &str,
    ) -> AuthResult<Option<RefreshSession>> {
        let token_hash = hash_refresh_token(refresh_token);
        let now = self.clock.now();
        Ok(self
            .store
            .find_by_token_hash(&token_hash)
            .await?
            .filter(|session| session.is_active(now)))
    }

    /// Any record for the token, revoked or expired included.
    ///
    /// # Errors
    /// Storage failures propagate.
    pub async fn find_by_token(&self, refresh_token: &str) -> AuthResult<Option<RefreshSession>> {
        let token_hash = hash_refresh_token(refresh_token);
        Ok(self.store.find_by_token_hash(&token_hash).await?)
    }

    /// Bump `last_used` on the identity's active session for `device_id`.
    /// Returns whether one was found.
    ///
    /// # Errors
    /// Storage failures propagate.
    pub async fn touch_device(&self, user_id: Uuid, device_id: &str) -> AuthResult<bool> {
        let current = self
            .store
            .list_active(user_id, self.clock.now())
            .await?
            .into_iter()
            .find(|session| session.device_id == device_id);
        match current {
            Some(session) => {
                self.touch(session.id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// # Errors
    /// Storage failures propagate.
    pub async fn touch(&self, session_id: Uuid) -> AuthResult<()> {
        self.store
            .touch(session_id, self.clock.now())
            .await
            .context("failed to touch session")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{
        client::{classify, ClientHints, TransportMetadata},
        clock::ManualClock,
        store::memory::MemoryStore,
    };

    const CHROME: &str = "Mozilla/5.0 (X11; Linux x86_64) Chrome/126.0 Safari/537.36";

    fn manager() -> (SessionManager, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (SessionManager::new(store.clone(), clock.clone()), store, clock)
    }

    fn mobile(device_id: &str) -> ClientInfo {
        classify(
            &ClientHints {
                device_id: Some(device_id.to_string()),
                device_name: Some("Pixel 8".to_string()),
                platform: Some("android".to_string()),
                app_version: None,
            },
            &TransportMetadata::default(),
        )
    }

    fn browser(ip: &str) -> ClientInfo {
        classify(
            &ClientHints::default(),
            &TransportMetadata::new(Some(CHROME.to_string()), Some(ip.to_string())),
        )
    }

    #[test]
    fn refresh_tokens_are_random_and_hashed() -> anyhow::Result<()> {
        let first = generate_refresh_token()?;
        let second = generate_refresh_token()?;
        assert_ne!(first, second);
        assert_eq!(Base64UrlUnpadded::decode_vec(&first).map(|b| b.len()).ok(), Some(32));
        assert_eq!(hash_refresh_token(&first), hash_refresh_token(&first));
        assert_ne!(hash_refresh_token(&first), hash_refresh_token(&second));
        Ok(())
    }

    #[tokio::test]
    async fn mobile_policy() -> anyhow::Result<()> {
        let (manager, _, clock) = manager();
        let (session, token) = manager.start_session(Uuid::new_v4(), &mobile("phone-1")).await?;

        assert_eq!(session.flavor, SessionFlavor::Mobile);
        assert_eq!(session.expires_at, clock.now() + Duration::days(60));
        assert_eq!(session.app_version.as_deref(), Some(DEFAULT_APP_VERSION));
        assert_eq!(session.user_agent, None);
        assert_eq!(session.token_hash, hash_refresh_token(&token));
        Ok(())
    }

    #[tokio::test]
    async fn web_policy() -> anyhow::Result<()> {
        let (manager, _, clock) = manager();
        let (session, _) = manager.start_session(Uuid::new_v4(), &browser("10.1.1.1")).await?;

        assert_eq!(session.flavor, SessionFlavor::Web);
        assert_eq!(session.platform, "web");
        assert_eq!(session.expires_at, clock.now() + Duration::days(30));
        assert_eq!(session.app_version, None);
        assert_eq!(session.user_agent.as_deref(), Some(CHROME));
        assert_eq!(session.ip_address.as_deref(), Some("10.1.1.1"));
        Ok(())
    }

    #[tokio::test]
    async fn repeated_mobile_logins_leave_one_active() -> anyhow::Result<()> {
        let (manager, store, _) = manager();
        let user = Uuid::new_v4();
        for _ in 0..5 {
            manager.start_session(user, &mobile("phone-1")).await?;
        }

        let all = store.sessions_for(user).await;
        assert_eq!(all.len(), 5);
        assert_eq!(all.iter().filter(|s| !s.revoked).count(), 1);
        assert!(all
            .iter()
            .filter(|s| s.revoked)
            .all(|s| s.revoked_reason.as_deref() == Some(REASON_MOBILE_RELOGIN)));
        Ok(())
    }

    #[tokio::test]
    async fn different_devices_coexist() -> anyhow::Result<()> {
        let (manager, _, _) = manager();
        let user = Uuid::new_v4();
        manager.start_session(user, &mobile("phone-1")).await?;
        manager.start_session(user, &mobile("tablet-1")).await?;
        manager.start_session(user, &browser("10.1.1.1")).await?;

        let sessions = manager.list_active_sessions(user, "tablet-1").await?;
        assert_eq!(sessions.len(), 3);
        assert_eq!(sessions.iter().filter(|s| s.is_current).count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn sessions_listed_by_last_use() -> anyhow::Result<()> {
        let (manager, _, clock) = manager();
        let user = Uuid::new_v4();
        let (first, _) = manager.start_session(user, &mobile("phone-1")).await?;
        clock.advance(Duration::minutes(1));
        manager.start_session(user, &mobile("tablet-1")).await?;
        clock.advance(Duration::minutes(1));
        manager.touch(first.id).await?;

        let sessions = manager.list_active_sessions(user, "phone-1").await?;
        let order: Vec<&str> = sessions.iter().map(|s| s.device_id.as_str()).collect();
        assert_eq!(order, vec!["phone-1", "tablet-1"]);
        assert!(sessions[0].is_current);
        Ok(())
    }

    #[tokio::test]
    async fn expired_sessions_are_not_listed() -> anyhow::Result<()> {
        let (manager, _, clock) = manager();
        let user = Uuid::new_v4();
        let (_, token) = manager.start_session(user, &browser("10.1.1.1")).await?;

        clock.advance(Duration::days(30));
        assert!(manager.find_active_by_token(&token).await?.is_some());

        clock.advance(Duration::seconds(1));
        assert!(manager.list_active_sessions(user, "").await?.is_empty());
        assert!(manager.find_active_by_token(&token).await?.is_none());
        assert!(manager.find_by_token(&token).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn revoke_twice_is_a_noop() -> anyhow::Result<()> {
        let (manager, store, clock) = manager();
        let user = Uuid::new_v4();
        let (session, _) = manager.start_session(user, &mobile("phone-1")).await?;

        manager.revoke(&session, REASON_LOGOUT).await?;
        let first = store.sessions_for(user).await;
        clock.advance(Duration::minutes(3));
        manager.revoke(&session, REASON_ADMIN).await?;
        let second = store.sessions_for(user).await;

        assert_eq!(first, second);
        assert_eq!(second[0].revoked_reason.as_deref(), Some(REASON_LOGOUT));
        Ok(())
    }

    #[tokio::test]
    async fn revoke_unknown_id_is_not_found() -> anyhow::Result<()> {
        let (manager, _, _) = manager();
        let result = manager.revoke_by_id(Uuid::new_v4(), REASON_ADMIN).await;
        assert!(matches!(result, Err(AuthError::NotFound { entity: "Session" })));
        Ok(())
    }

    #[tokio::test]
    async fn rotation_replaces_the_current_session() -> anyhow::Result<()> {
        let (manager, store, _) = manager();
        let user = Uuid::new_v4();
        let (current, _) = manager.start_session(user, &mobile("phone-1")).await?;

        let pending = manager.prepare_rotation(&current)?;
        let next = manager.commit(&pending).await?;
        assert_eq!(next.device_id, current.device_id);
        assert_ne!(next.token_hash, current.token_hash);

        let all = store.sessions_for(user).await;
        let old = all.iter().find(|s| s.id == current.id);
        assert_eq!(old.and_then(|s| s.revoked_reason.as_deref()), Some(REASON_ROTATED));

        // The old session can no longer be rotated.
        let stale = manager.prepare_rotation(&current)?;
        assert!(matches!(manager.commit(&stale).await, Err(AuthError::Unauthenticated)));
        Ok(())
    }

    #[tokio::test]
    async fn revoke_all_counts_changes() -> anyhow::Result<()> {
        let (manager, _, _) = manager();
        let user = Uuid::new_v4();
        manager.start_session(user, &mobile("phone-1")).await?;
        manager.start_session(user, &mobile("tablet-1")).await?;

        assert_eq!(manager.revoke_all(user, REASON_ADMIN).await?, 2);
        assert_eq!(manager.revoke_all(user, REASON_ADMIN).await?, 0);
        Ok(())
    }
}
