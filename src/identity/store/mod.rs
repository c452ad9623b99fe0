//! Storage seams for the identity core.
//!
//! [`SessionStore`] owns refresh-session records and the one-active-session-
//! per-device invariant. [`IdentityStore`] exposes the credential lookup and
//! the role/module/permission graph. Both are object-safe so the service
//! layer holds `Arc<dyn ...>` and tests swap in [`memory::MemoryStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{Identity, Module, PermissionType, RefreshSession, RoleAssignment};

pub mod memory;
pub mod postgres;

/// Which existing sessions a new one supersedes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RotationScope {
    /// Every non-revoked session of the identity on this device id,
    /// whatever platform it recorded. A browser that once sent mobile hints
    /// derives the same fingerprint, and a device id holds at most one
    /// active session.
    Device { device_id: String },
}

impl RotationScope {
    #[must_use]
    pub fn device_id(&self) -> &str {
        match self {
            Self::Device { device_id } => device_id,
        }
    }

    /// Whether an active session falls inside this scope.
    #[must_use]
    pub fn covers(&self, session: &RefreshSession) -> bool {
        match self {
            Self::Device { device_id } => session.device_id == *device_id,
        }
    }
}

/// Atomic "revoke what the scope covers, then insert" request.
#[derive(Clone, Debug)]
pub struct RotationRequest {
    pub scope: RotationScope,
    pub reason: String,
    pub session: RefreshSession,
    pub now: DateTime<Utc>,
    /// For refresh rotation: the session being replaced must still be active
    /// when the rotation commits, otherwise it was lost to a concurrent call.
    pub replaces: Option<Uuid>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RotationOutcome {
    Committed { revoked: Vec<Uuid> },
    /// `replaces` was no longer active; nothing was written.
    Superseded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked,
    AlreadyRevoked,
    NotFound,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Revoke every active session covered by the scope and insert the new
    /// one, all or nothing. Storage errors propagate; they never degrade into
    /// "nothing to revoke".
    async fn rotate(&self, request: &RotationRequest) -> anyhow::Result<RotationOutcome>;

    async fn find_by_token_hash(&self, token_hash: &[u8]) -> anyhow::Result<Option<RefreshSession>>;

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<RefreshSession>>;

    async fn revoke(&self, id: Uuid, reason: &str, now: DateTime<Utc>)
        -> anyhow::Result<RevokeOutcome>;

    /// Revoke every active session of an identity; returns how many changed.
    async fn revoke_all(&self, user_id: Uuid, reason: &str, now: DateTime<Utc>)
        -> anyhow::Result<u64>;

    /// Non-revoked, non-expired sessions, most recently used first.
    async fn list_active(&self, user_id: Uuid, now: DateTime<Utc>)
        -> anyhow::Result<Vec<RefreshSession>>;

    async fn touch(&self, id: Uuid, now: DateTime<Utc>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// `email` must already be normalized (trimmed, lower-cased).
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<Identity>>;

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<Identity>>;

    /// Every role held by the identity, enabled or not, with its grants.
    async fn role_assignments(&self, user_id: Uuid) -> anyhow::Result<Vec<RoleAssignment>>;

    /// Declared modules and permission types, used to build policies.
    async fn catalog(&self) -> anyhow::Result<(Vec<Module>, Vec<PermissionType>)>;
}
