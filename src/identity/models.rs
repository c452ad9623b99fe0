//! Identity, role/permission graph and refresh-session records.
//!
//! These types mirror the persisted rows one-to-one. The permission graph is
//! loaded as [`RoleAssignment`] values (role plus its grants, with module and
//! permission type joined in) so the resolver can apply enablement filters
//! without going back to storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Stored identity. `email` is always lower-cased.
#[derive(Clone, Debug)]
pub struct Identity {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub enabled: bool,
}

/// A functional area of the application (e.g. `Catalog`, `Identity`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub enabled: bool,
}

/// An action kind (e.g. `Leer`, `Administrar`). `code` is upper-cased.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionType {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub description: String,
}

/// A (role, module, permission type) triple; unique per triple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionGrant {
    pub id: Uuid,
    pub role_id: Uuid,
    pub module_id: Uuid,
    pub permission_type_id: Uuid,
    pub assigned_at: DateTime<Utc>,
}

/// A grant with its module and permission type joined in.
#[derive(Clone, Debug)]
pub struct ResolvedGrant {
    pub module: Module,
    pub permission_type: PermissionType,
}

/// One role held by an identity, together with every grant of that role.
#[derive(Clone, Debug)]
pub struct RoleAssignment {
    pub role: Role,
    pub grants: Vec<ResolvedGrant>,
}

/// Session policy family, fixed at creation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionFlavor {
    /// Durable per-install device id, long-lived, app version tracked.
    Mobile,
    /// Fingerprint device id, shorter-lived, user agent and IP tracked.
    Web,
}

impl SessionFlavor {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Web => "web",
        }
    }

    /// Parse the persisted label; unknown labels are rejected.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mobile" => Some(Self::Mobile),
            "web" => Some(Self::Web),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refresh-token record. One row per login; rows are revoked, never deleted.
///
/// Only the SHA-256 of the opaque token is stored; the raw value is handed to
/// the client once at issuance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: Vec<u8>,
    pub flavor: SessionFlavor,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_reason: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
    pub app_version: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl RefreshSession {
    /// Expiry is derived, never stored as a transition. A session is still
    /// usable at exactly `expires_at`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired(now)
    }

    /// Mark revoked. Returns `false` if it already was (no state change).
    pub fn revoke(&mut self, reason: &str, now: DateTime<Utc>) -> bool {
        if self.revoked {
            return false;
        }
        self.revoked = true;
        self.revoked_reason = Some(reason.to_string());
        self.revoked_at = Some(now);
        true
    }
}
