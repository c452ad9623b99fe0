//! Role → module → permission-type aggregation.

use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{error::AuthResult, models::RoleAssignment, store::IdentityStore};

/// The flattened view of what an identity may do.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedAccess {
    /// Names of enabled roles, sorted.
    pub roles: Vec<String>,
    /// Distinct `"{Module}:{PermissionType}"` strings, sorted.
    pub permissions: Vec<String>,
}

impl ResolvedAccess {
    #[must_use]
    pub fn contains(&self, permission: &str) -> bool {
        self.permissions.binary_search_by(|p| p.as_str().cmp(permission)).is_ok()
    }
}

#[must_use]
pub fn permission_string(module: &str, permission_type: &str) -> String {
    format!("{module}:{permission_type}")
}

/// Apply the enablement filters and deduplicate.
///
/// Disabled roles contribute nothing, grants on disabled modules are skipped.
/// Stored grants are never touched, so re-enabling restores them.
#[must_use]
pub fn flatten(assignments: &[RoleAssignment]) -> ResolvedAccess {
    let mut roles = BTreeSet::new();
    let mut permissions = BTreeSet::new();

    for assignment in assignments.iter().filter(|a| a.role.enabled) {
        roles.insert(assignment.role.name.clone());
        for grant in assignment.grants.iter().filter(|g| g.module.enabled) {
            permissions.insert(permission_string(
                &grant.module.name,
                &grant.permission_type.name,
            ));
        }
    }

    ResolvedAccess {
        roles: roles.into_iter().collect(),
        permissions: permissions.into_iter().collect(),
    }
}

#[derive(Clone)]
pub struct PermissionResolver {
    store: Arc<dyn IdentityStore>,
}

impl PermissionResolver {
    #[must_use]
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    /// # Errors
    /// Storage failures propagate as infrastructure errors.
    #[instrument(skip(self))]
    pub async fn resolve(&self, user_id: Uuid) -> AuthResult<ResolvedAccess> {
        let assignments = self.store.role_assignments(user_id).await?;
        let access = flatten(&assignments);
        debug!(
            roles = access.roles.len(),
            permissions = access.permissions.len(),
            "resolved permissions"
        );
        Ok(access)
    }

    /// Live check of a single permission string.
    ///
    /// # Errors
    /// Storage failures propagate as infrastructure errors.
    pub async fn has_permission(&self, user_id: Uuid, permission: &str) -> AuthResult<bool> {
        Ok(self.resolve(user_id).await?.contains(permission))
    }
}
