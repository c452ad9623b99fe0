//! Default catalog: permission types, modules, roles and the bootstrap
//! administrator.

use chrono::Utc;
use uuid::Uuid;

use super::{
    credentials::PasswordHasher,
    error::AuthResult,
    models::{Identity, Module, PermissionType, Role},
    store::memory::MemoryStore,
};

pub const PERMISSION_TYPES: [(&str, &str); 5] = [
    ("Crear", "Create new records"),
    ("Leer", "View records"),
    ("Actualizar", "Modify existing records"),
    ("Eliminar", "Delete records"),
    ("Administrar", "Full access to the module"),
];

pub const MODULES: [(&str, &str); 4] = [
    ("Catalog", "Products and categories"),
    ("Basket", "Shopping baskets"),
    ("Ordering", "Orders"),
    ("Identity", "Users and permissions"),
];

pub const ROLES: [(&str, &str); 3] = [
    ("Administrador", "Full system access"),
    ("Usuario", "Basic system access"),
    ("Operador", "Access for specific operations"),
];

pub const ADMIN_ROLE: &str = "Administrador";
pub const ADMIN_PERMISSION_TYPE: &str = "Administrar";
pub const ADMIN_NAME: &str = "Administrador";
pub const ADMIN_EMAIL: &str = "admin@eshop.com";
pub const ADMIN_PASSWORD: &str = "Admin123!";

#[must_use]
pub fn permission_types() -> Vec<PermissionType> {
    PERMISSION_TYPES
        .iter()
        .map(|(name, description)| PermissionType {
            id: Uuid::new_v4(),
            name: (*name).to_string(),
            code: name.to_uppercase(),
            description: (*description).to_string(),
        })
        .collect()
}

#[must_use]
pub fn modules() -> Vec<Module> {
    MODULES
        .iter()
        .map(|(name, description)| Module {
            id: Uuid::new_v4(),
            name: (*name).to_string(),
            description: (*description).to_string(),
            enabled: true,
        })
        .collect()
}

#[must_use]
pub fn roles() -> Vec<Role> {
    ROLES
        .iter()
        .map(|(name, description)| Role {
            id: Uuid::new_v4(),
            name: (*name).to_string(),
            description: (*description).to_string(),
            enabled: true,
        })
        .collect()
}

/// Build the bootstrap administrator with a freshly hashed password.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn admin_identity(hasher: &dyn PasswordHasher) -> anyhow::Result<Identity> {
    Ok(Identity {
        id: Uuid::new_v4(),
        name: ADMIN_NAME.to_string(),
        email: ADMIN_EMAIL.to_string(),
        password_hash: hasher.hash(ADMIN_PASSWORD)?,
        enabled: true,
    })
}

/// Load the default catalog into a memory store and return the admin.
///
/// The administrator role receives `Administrar` on every module.
///
/// # Errors
/// Fails if the store already holds conflicting entries or hashing fails.
pub async fn default_catalog(
    store: &MemoryStore,
    hasher: &dyn PasswordHasher,
) -> AuthResult<Identity> {
    let permission_types = permission_types();
    let modules = modules();
    let roles = roles();

    for permission_type in &permission_types {
        store.insert_permission_type(permission_type.clone()).await;
    }
    for module in &modules {
        store.insert_module(module.clone()).await;
    }
    for role in &roles {
        store.insert_role(role.clone()).await?;
    }

    let admin = admin_identity(hasher)?;
    store.insert_identity(admin.clone()).await?;

    let admin_role = roles
        .iter()
        .find(|role| role.name == ADMIN_ROLE)
        .ok_or_else(|| anyhow::anyhow!("default roles lack {ADMIN_ROLE}"))?;
    store.assign_role(admin.id, admin_role.id).await?;

    let administer = permission_types
        .iter()
        .find(|permission_type| permission_type.name == ADMIN_PERMISSION_TYPE)
        .ok_or_else(|| anyhow::anyhow!("default permission types lack {ADMIN_PERMISSION_TYPE}"))?;
    let now = Utc::now();
    for module in &modules {
        store
            .grant_permission(admin_role.id, module.id, administer.id, now)
            .await?;
    }

    Ok(admin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{
        credentials::BcryptHasher, permissions::PermissionResolver, store::IdentityStore,
    };
    use std::sync::Arc;

    #[tokio::test]
    async fn admin_administers_every_module() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let admin = default_catalog(&store, &BcryptHasher::new(4)).await?;

        let access = PermissionResolver::new(store.clone()).resolve(admin.id).await?;
        assert_eq!(access.roles, vec!["Administrador"]);
        assert_eq!(
            access.permissions,
            vec![
                "Basket:Administrar",
                "Catalog:Administrar",
                "Identity:Administrar",
                "Ordering:Administrar",
            ]
        );

        let (modules, permission_types) = store.catalog().await?;
        assert_eq!(modules.len(), 4);
        assert_eq!(permission_types.len(), 5);
        assert!(permission_types.iter().any(|p| p.code == "ADMINISTRAR"));
        Ok(())
    }

    #[tokio::test]
    async fn seeding_twice_conflicts() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let hasher = BcryptHasher::new(4);
        default_catalog(&store, &hasher).await?;
        assert!(default_catalog(&store, &hasher).await.is_err());
        Ok(())
    }
}
