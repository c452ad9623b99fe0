//! In-process store for tests and `memory://` development runs.
//!
//! All state sits behind one `tokio::sync::Mutex`. Each mutation completes
//! under a single lock acquisition with no await point inside, so a
//! cancelled caller never leaves a partial write behind.

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{IdentityStore, RevokeOutcome, RotationOutcome, RotationRequest, SessionStore};
use crate::identity::{
    error::AuthError,
    models::{
        Identity, Module, PermissionGrant, PermissionType, RefreshSession, ResolvedGrant, Role,
        RoleAssignment,
    },
};

#[derive(Debug, Default)]
struct State {
    identities: HashMap<Uuid, Identity>,
    roles: HashMap<Uuid, Role>,
    modules: BTreeMap<String, Module>,
    permission_types: BTreeMap<String, PermissionType>,
    user_roles: HashMap<Uuid, Vec<Uuid>>,
    grants: Vec<PermissionGrant>,
    sessions: HashMap<Uuid, RefreshSession>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// [`AuthError::AlreadyExists`] if the email is taken.
    pub async fn insert_identity(&self, identity: Identity) -> Result<(), AuthError> {
        let mut state = self.state.lock().await;
        let email = identity.email.trim().to_lowercase();
        if state.identities.values().any(|existing| existing.email == email) {
            return Err(AuthError::AlreadyExists { entity: "User" });
        }
        state.identities.insert(identity.id, Identity { email, ..identity });
        Ok(())
    }

    /// # Errors
    /// [`AuthError::AlreadyExists`] if a role with the same name exists.
    pub async fn insert_role(&self, role: Role) -> Result<(), AuthError> {
        let mut state = self.state.lock().await;
        if state.roles.values().any(|existing| existing.name == role.name) {
            return Err(AuthError::AlreadyExists { entity: "Role" });
        }
        state.roles.insert(role.id, role);
        Ok(())
    }

    pub async fn insert_module(&self, module: Module) {
        self.state
            .lock()
            .await
            .modules
            .insert(module.name.clone(), module);
    }

    pub async fn insert_permission_type(&self, permission_type: PermissionType) {
        self.state
            .lock()
            .await
            .permission_types
            .insert(permission_type.name.clone(), permission_type);
    }

    /// # Errors
    /// [`AuthError::NotFound`] if the identity or role is unknown.
    pub async fn assign_role(&self, user_id: Uuid, role_id: Uuid) -> Result<(), AuthError> {
        let mut state = self.state.lock().await;
        if !state.identities.contains_key(&user_id) {
            return Err(AuthError::NotFound { entity: "User" });
        }
        if !state.roles.contains_key(&role_id) {
            return Err(AuthError::NotFound { entity: "Role" });
        }
        let roles = state.user_roles.entry(user_id).or_default();
        if !roles.contains(&role_id) {
            roles.push(role_id);
        }
        Ok(())
    }

    /// Grant a (module, permission type) pair to a role.
    ///
    /// # Errors
    /// [`AuthError::AlreadyExists`] if the role already holds the pair.
    pub async fn grant_permission(
        &self,
        role_id: Uuid,
        module_id: Uuid,
        permission_type_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PermissionGrant, AuthError> {
        let mut state = self.state.lock().await;
        if !state.roles.contains_key(&role_id) {
            return Err(AuthError::NotFound { entity: "Role" });
        }
        if !state.modules.values().any(|m| m.id == module_id) {
            return Err(AuthError::NotFound { entity: "Module" });
        }
        if !state.permission_types.values().any(|p| p.id == permission_type_id) {
            return Err(AuthError::NotFound { entity: "PermissionType" });
        }
        let duplicate = state.grants.iter().any(|grant| {
            grant.role_id == role_id
                && grant.module_id == module_id
                && grant.permission_type_id == permission_type_id
        });
        if duplicate {
            return Err(AuthError::AlreadyExists { entity: "Permission" });
        }
        let grant = PermissionGrant {
            id: Uuid::new_v4(),
            role_id,
            module_id,
            permission_type_id,
            assigned_at: now,
        };
        state.grants.push(grant.clone());
        Ok(grant)
    }

    /// # Errors
    /// [`AuthError::NotFound`] if no module has that name.
    pub async fn set_module_enabled(&self, name: &str, enabled: bool) -> Result<(), AuthError> {
        let mut state = self.state.lock().await;
        let module = state
            .modules
            .get_mut(name)
            .ok_or(AuthError::NotFound { entity: "Module" })?;
        module.enabled = enabled;
        Ok(())
    }

    /// # Errors
    /// [`AuthError::NotFound`] if no role has that name.
    pub async fn set_role_enabled(&self, name: &str, enabled: bool) -> Result<(), AuthError> {
        let mut state = self.state.lock().await;
        let role = state
            .roles
            .values_mut()
            .find(|role| role.name == name)
            .ok_or(AuthError::NotFound { entity: "Role" })?;
        role.enabled = enabled;
        Ok(())
    }

    /// # Errors
    /// [`AuthError::NotFound`] if the identity is unknown.
    pub async fn set_identity_enabled(
        &self,
        user_id: Uuid,
        enabled: bool,
    ) -> Result<(), AuthError> {
        let mut state = self.state.lock().await;
        let identity = state
            .identities
            .get_mut(&user_id)
            .ok_or(AuthError::NotFound { entity: "User" })?;
        identity.enabled = enabled;
        Ok(())
    }

    pub async fn role_by_name(&self, name: &str) -> Option<Role> {
        let state = self.state.lock().await;
        state.roles.values().find(|role| role.name == name).cloned()
    }

    pub async fn module_by_name(&self, name: &str) -> Option<Module> {
        self.state.lock().await.modules.get(name).cloned()
    }

    pub async fn permission_type_by_name(&self, name: &str) -> Option<PermissionType> {
        self.state.lock().await.permission_types.get(name).cloned()
    }

    /// Every session of an identity, revoked ones included.
    pub async fn sessions_for(&self, user_id: Uuid) -> Vec<RefreshSession> {
        let state = self.state.lock().await;
        let mut sessions: Vec<RefreshSession> = state
            .sessions
            .values()
            .filter(|session| session.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|session| session.issued_at);
        sessions
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn rotate(&self, request: &RotationRequest) -> anyhow::Result<RotationOutcome> {
        let mut state = self.state.lock().await;
        let user_id = request.session.user_id;
        let now = request.now;

        if let Some(replaced) = request.replaces {
            let still_active = state
                .sessions
                .get(&replaced)
                .is_some_and(|session| session.is_active(now));
            if !still_active {
                return Ok(RotationOutcome::Superseded);
            }
        }

        if state
            .sessions
            .values()
            .any(|session| session.token_hash == request.session.token_hash)
        {
            bail!("refresh token hash collision");
        }

        let covered: Vec<Uuid> = state
            .sessions
            .values()
            .filter(|session| {
                session.user_id == user_id
                    && !session.revoked
                    && (request.scope.covers(session) || Some(session.id) == request.replaces)
            })
            .map(|session| session.id)
            .collect();

        // Same unique rule as the partial index on (user_id, device_id).
        let conflict = state.sessions.values().any(|session| {
            session.user_id == user_id
                && !session.revoked
                && session.device_id == request.session.device_id
                && !covered.contains(&session.id)
        });
        if conflict {
            bail!("an active session outside the rotation scope holds this device id");
        }

        for id in &covered {
            if let Some(session) = state.sessions.get_mut(id) {
                session.revoke(&request.reason, now);
            }
        }
        state
            .sessions
            .insert(request.session.id, request.session.clone());

        Ok(RotationOutcome::Committed { revoked: covered })
    }

    async fn find_by_token_hash(
        &self,
        token_hash: &[u8],
    ) -> anyhow::Result<Option<RefreshSession>> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .values()
            .find(|session| session.token_hash == token_hash)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<RefreshSession>> {
        Ok(self.state.lock().await.sessions.get(&id).cloned())
    }

    async fn revoke(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RevokeOutcome> {
        let mut state = self.state.lock().await;
        Ok(match state.sessions.get_mut(&id) {
            None => RevokeOutcome::NotFound,
            Some(session) => {
                if session.revoke(reason, now) {
                    RevokeOutcome::Revoked
                } else {
                    RevokeOutcome::AlreadyRevoked
                }
            }
        })
    }

    async fn revoke_all(
        &self,
        user_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for session in state.sessions.values_mut() {
            if session.user_id == user_id && session.revoke(reason, now) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_active(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<RefreshSession>> {
        let state = self.state.lock().await;
        let mut sessions: Vec<RefreshSession> = state
            .sessions
            .values()
            .filter(|session| session.user_id == user_id && session.is_active(now))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        Ok(sessions)
    }

    async fn touch(&self, id: Uuid, now: DateTime<Utc>) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(&id) {
            session.last_used = now;
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<Identity>> {
        let state = self.state.lock().await;
        Ok(state
            .identities
            .values()
            .find(|identity| identity.email == email)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<Identity>> {
        Ok(self.state.lock().await.identities.get(&id).cloned())
    }

    async fn role_assignments(&self, user_id: Uuid) -> anyhow::Result<Vec<RoleAssignment>> {
        let state = self.state.lock().await;
        let Some(role_ids) = state.user_roles.get(&user_id) else {
            return Ok(Vec::new());
        };

        let modules: HashMap<Uuid, &Module> =
            state.modules.values().map(|m| (m.id, m)).collect();
        let permission_types: HashMap<Uuid, &PermissionType> =
            state.permission_types.values().map(|p| (p.id, p)).collect();

        let mut seen = HashSet::new();
        let mut assignments = Vec::new();
        for role_id in role_ids {
            if !seen.insert(*role_id) {
                continue;
            }
            let Some(role) = state.roles.get(role_id) else {
                continue;
            };
            let grants = state
                .grants
                .iter()
                .filter(|grant| grant.role_id == *role_id)
                .filter_map(|grant| {
                    Some(ResolvedGrant {
                        module: (*modules.get(&grant.module_id)?).clone(),
                        permission_type: (*permission_types.get(&grant.permission_type_id)?)
                            .clone(),
                    })
                })
                .collect();
            assignments.push(RoleAssignment {
                role: role.clone(),
                grants,
            });
        }
        Ok(assignments)
    }

    async fn catalog(&self) -> anyhow::Result<(Vec<Module>, Vec<PermissionType>)> {
        let state = self.state.lock().await;
        Ok((
            state.modules.values().cloned().collect(),
            state.permission_types.values().cloned().collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{models::SessionFlavor, store::RotationScope};
    use chrono::Duration;

    fn session(
        user_id: Uuid,
        device_id: &str,
        platform: &str,
        now: DateTime<Utc>,
    ) -> RefreshSession {
        RefreshSession {
            id: Uuid::new_v4(),
            user_id,
            token_hash: Uuid::new_v4().as_bytes().to_vec(),
            flavor: if platform == "web" {
                SessionFlavor::Web
            } else {
                SessionFlavor::Mobile
            },
            issued_at: now,
            expires_at: now + Duration::days(30),
            last_used: now,
            revoked: false,
            revoked_reason: None,
            revoked_at: None,
            device_id: device_id.to_string(),
            device_name: "device".to_string(),
            platform: platform.to_string(),
            app_version: None,
            user_agent: None,
            ip_address: None,
        }
    }

    fn rotation(session: RefreshSession, now: DateTime<Utc>) -> RotationRequest {
        RotationRequest {
            scope: RotationScope::Device {
                device_id: session.device_id.clone(),
            },
            reason: "New login on same device".to_string(),
            session,
            now,
            replaces: None,
        }
    }

    #[tokio::test]
    async fn rotate_revokes_covered_sessions() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        let first = session(user, "phone", "android", now);
        store.rotate(&rotation(first.clone(), now)).await?;
        let second = session(user, "phone", "android", now);
        let outcome = store.rotate(&rotation(second.clone(), now)).await?;

        assert_eq!(
            outcome,
            RotationOutcome::Committed {
                revoked: vec![first.id]
            }
        );
        let active = store.list_active(user, now).await?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
        Ok(())
    }

    #[tokio::test]
    async fn rotate_detects_lost_refresh_race() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        let original = session(user, "phone", "android", now);
        store.rotate(&rotation(original.clone(), now)).await?;
        store.revoke(original.id, "Logout", now).await?;

        let mut request = rotation(session(user, "phone", "android", now), now);
        request.replaces = Some(original.id);
        assert_eq!(store.rotate(&request).await?, RotationOutcome::Superseded);
        assert!(store.list_active(user, now).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn revoke_reports_each_outcome() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();
        let record = session(user, "laptop", "web", now);
        store.rotate(&rotation(record.clone(), now)).await?;

        assert_eq!(store.revoke(record.id, "Logout", now).await?, RevokeOutcome::Revoked);
        assert_eq!(
            store.revoke(record.id, "Logout", now).await?,
            RevokeOutcome::AlreadyRevoked
        );
        assert_eq!(
            store.revoke(Uuid::new_v4(), "Logout", now).await?,
            RevokeOutcome::NotFound
        );
        Ok(())
    }

    #[tokio::test]
    async fn rotate_sweeps_other_platforms_on_same_device() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        let mobile_hinted = session(user, "fingerprint", "ios", now);
        store.rotate(&rotation(mobile_hinted.clone(), now)).await?;
        let web = session(user, "fingerprint", "web", now);
        let outcome = store.rotate(&rotation(web.clone(), now)).await?;

        assert_eq!(
            outcome,
            RotationOutcome::Committed {
                revoked: vec![mobile_hinted.id]
            }
        );
        let active = store.list_active(user, now).await?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, web.id);
        Ok(())
    }

    #[tokio::test]
    async fn list_active_orders_by_last_used() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();

        let older = session(user, "tablet", "ios", now);
        let newer = session(user, "phone", "android", now);
        store.rotate(&rotation(older.clone(), now)).await?;
        store.rotate(&rotation(newer.clone(), now)).await?;
        store.touch(newer.id, now + Duration::minutes(5)).await?;

        let active = store.list_active(user, now + Duration::minutes(6)).await?;
        let ids: Vec<Uuid> = active.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_grant_is_rejected() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let role = Role {
            id: Uuid::new_v4(),
            name: "Usuario".to_string(),
            description: String::new(),
            enabled: true,
        };
        let module = Module {
            id: Uuid::new_v4(),
            name: "Catalog".to_string(),
            description: String::new(),
            enabled: true,
        };
        let read = PermissionType {
            id: Uuid::new_v4(),
            name: "Leer".to_string(),
            code: "LEER".to_string(),
            description: String::new(),
        };
        store.insert_role(role.clone()).await?;
        store.insert_module(module.clone()).await;
        store.insert_permission_type(read.clone()).await;

        let now = Utc::now();
        store.grant_permission(role.id, module.id, read.id, now).await?;
        let duplicate = store.grant_permission(role.id, module.id, read.id, now).await;
        assert!(matches!(
            duplicate,
            Err(AuthError::AlreadyExists { entity: "Permission" })
        ));
        Ok(())
    }
}
