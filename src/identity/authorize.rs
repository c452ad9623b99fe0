//! Authorization decision point.
//!
//! A requirement is a `(module, permission type)` pair, addressed by the
//! policy name `Permission.{Module}.{PermissionType}`. Policies are built once
//! at startup from the declared catalog.
//!
//! Permissions embedded in the access token are advisory by default: with
//! [`PermissionSource::Live`] every check re-resolves against storage, so a
//! disabled module, role or account takes effect on the next request. With
//! [`PermissionSource::Token`] the embedded claims are trusted until the token
//! expires, trading up to one token lifetime of staleness for no lookup.

use anyhow::{anyhow, Context};
use serde::Serialize;
use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc, time::Duration};
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    blacklist::TokenBlacklist,
    clock::Clock,
    error::{AuthError, AuthResult},
    models::{Module, PermissionType},
    permissions::{permission_string, PermissionResolver},
    store::IdentityStore,
    login::DEFAULT_STORAGE_TIMEOUT,
    token::{Principal, TokenCodec},
};

pub const POLICY_PREFIX: &str = "Permission";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    pub module: String,
    pub permission_type: String,
}

impl Requirement {
    #[must_use]
    pub fn new(module: impl Into<String>, permission_type: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            permission_type: permission_type.into(),
        }
    }

    #[must_use]
    pub fn policy_name(&self) -> String {
        format!("{POLICY_PREFIX}.{}.{}", self.module, self.permission_type)
    }

    #[must_use]
    pub fn permission_string(&self) -> String {
        permission_string(&self.module, &self.permission_type)
    }
}

/// Explicit policy table, built at startup.
#[derive(Clone, Debug, Default)]
pub struct PolicyRegistry {
    policies: BTreeMap<String, Requirement>,
}

impl PolicyRegistry {
    /// One policy per declared module × permission type, enabled or not.
    /// Disabled modules still resolve to a policy; they simply never allow.
    #[must_use]
    pub fn build(modules: &[Module], permission_types: &[PermissionType]) -> Self {
        let mut policies = BTreeMap::new();
        for module in modules {
            for permission_type in permission_types {
                let requirement = Requirement::new(&module.name, &permission_type.name);
                policies.insert(requirement.policy_name(), requirement);
            }
        }
        Self { policies }
    }

    /// # Errors
    /// Storage failures propagate.
    pub async fn from_store(store: &dyn IdentityStore) -> AuthResult<Self> {
        let (modules, permission_types) = store.catalog().await?;
        Ok(Self::build(&modules, &permission_types))
    }

    #[must_use]
    pub fn lookup(&self, policy_name: &str) -> Option<&Requirement> {
        self.policies.get(policy_name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PermissionSource {
    /// Re-resolve on every check.
    #[default]
    Live,
    /// Trust the claims embedded at issuance.
    Token,
}

impl PermissionSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Token => "token",
        }
    }
}

impl fmt::Display for PermissionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionSource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "token" => Ok(Self::Token),
            other => Err(format!("unknown permission source: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

pub struct AuthorizationService {
    codec: Arc<TokenCodec>,
    resolver: PermissionResolver,
    identities: Arc<dyn IdentityStore>,
    blacklist: Option<Arc<TokenBlacklist>>,
    clock: Arc<dyn Clock>,
    source: PermissionSource,
    storage_timeout: Duration,
}

impl AuthorizationService {
    #[must_use]
    pub fn new(
        codec: Arc<TokenCodec>,
        identities: Arc<dyn IdentityStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            codec,
            resolver: PermissionResolver::new(identities.clone()),
            identities,
            blacklist: None,
            clock,
            source: PermissionSource::Live,
            storage_timeout: DEFAULT_STORAGE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_blacklist(mut self, blacklist: Arc<TokenBlacklist>) -> Self {
        self.blacklist = Some(blacklist);
        self
    }

    #[must_use]
    pub fn with_permission_source(mut self, source: PermissionSource) -> Self {
        self.source = source;
        self
    }

    /// Deadline for the live lookups.
    #[must_use]
    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = timeout;
        self
    }

    #[must_use]
    pub fn permission_source(&self) -> PermissionSource {
        self.source
    }

    /// Verify a bearer token. Every failure is the same
    /// [`AuthError::Unauthenticated`]; the reason is only logged.
    ///
    /// # Errors
    /// [`AuthError::Unauthenticated`].
    pub fn authenticate(&self, bearer: &str) -> AuthResult<Principal> {
        let principal = self.codec.validate(bearer).map_err(|err| {
            debug!("rejected access token: {err}");
            AuthError::Unauthenticated
        })?;

        if let Some(blacklist) = &self.blacklist {
            if blacklist.is_revoked(&principal.jti, self.clock.now()) {
                debug!("rejected blacklisted access token");
                return Err(AuthError::Unauthenticated);
            }
        }

        Ok(principal)
    }

    /// Decide a requirement for an already verified principal.
    ///
    /// # Errors
    /// Storage failures propagate (live mode only).
    #[instrument(skip(self, principal), fields(policy = %requirement.policy_name()))]
    pub async fn authorize(
        &self,
        principal: &Principal,
        requirement: &Requirement,
    ) -> AuthResult<Decision> {
        let Some(user_id) = principal.user_id else {
            warn!("principal carries no usable user_id claim");
            return Ok(Decision::Deny);
        };
        let wanted = requirement.permission_string();

        let allowed = match self.source {
            PermissionSource::Token => principal.has_permission(&wanted),
            PermissionSource::Live => {
                tokio::time::timeout(self.storage_timeout, self.live_check(user_id, &wanted))
                    .await
                    .map_err(|_| anyhow!("storage deadline exceeded"))
                    .context("authorization lookup aborted")??
            }
        };

        debug!(allowed, "authorization decided");
        Ok(if allowed { Decision::Allow } else { Decision::Deny })
    }

    async fn live_check(&self, user_id: Uuid, wanted: &str) -> AuthResult<bool> {
        let enabled = self
            .identities
            .find_by_id(user_id)
            .await?
            .is_some_and(|identity| identity.enabled);
        Ok(enabled && self.resolver.has_permission(user_id, wanted).await?)
    }

    /// Authenticate then authorize.
    ///
    /// # Errors
    /// [`AuthError::Unauthenticated`] for a bad token, storage failures
    /// otherwise.
    pub async fn check(&self, bearer: &str, requirement: &Requirement) -> AuthResult<Decision> {
        let principal = self.authenticate(bearer)?;
        self.authorize(&principal, requirement).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(name: &str) -> Module {
        Module {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            enabled: true,
        }
    }

    fn permission_type(name: &str) -> PermissionType {
        PermissionType {
            id: Uuid::new_v4(),
            name: name.to_string(),
            code: name.to_uppercase(),
            description: String::new(),
        }
    }

    #[test]
    fn policy_names_are_deterministic() {
        let requirement = Requirement::new("Catalog", "Leer");
        assert_eq!(requirement.policy_name(), "Permission.Catalog.Leer");
        assert_eq!(requirement.permission_string(), "Catalog:Leer");
    }

    #[test]
    fn registry_covers_every_pair() {
        let registry = PolicyRegistry::build(
            &[module("Catalog"), module("Identity")],
            &[permission_type("Leer"), permission_type("Administrar")],
        );
        assert_eq!(registry.len(), 4);
        assert_eq!(
            registry.lookup("Permission.Identity.Administrar"),
            Some(&Requirement::new("Identity", "Administrar"))
        );
        assert_eq!(registry.lookup("Permission.Billing.Leer"), None);
        assert!(registry.names().all(|name| name.starts_with("Permission.")));
    }

    #[test]
    fn permission_source_parses() {
        assert_eq!("live".parse::<PermissionSource>(), Ok(PermissionSource::Live));
        assert_eq!(" Token ".parse::<PermissionSource>(), Ok(PermissionSource::Token));
        assert!("cache".parse::<PermissionSource>().is_err());
        assert_eq!(PermissionSource::default(), PermissionSource::Live);
    }
}
