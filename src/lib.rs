//! # Umbral (authentication and authorization core)
//!
//! `umbral` issues and validates signed access tokens, manages device-aware
//! refresh sessions, and decides permission checks against a
//! role/module/permission-type graph.
//!
//! ## Sessions
//!
//! Every login opens a refresh session bound to a device. Mobile clients
//! supply a durable device id; web clients are fingerprinted from their user
//! agent and address. A device never holds more than one active session per
//! identity: logging in again on the same device revokes the previous one in
//! the same atomic write that creates the new one.
//!
//! ## Permissions
//!
//! Permissions are `{Module}:{PermissionType}` strings flattened from every
//! enabled role of an identity, skipping disabled modules. Authorization
//! policies are named `Permission.{Module}.{PermissionType}`. Checks resolve
//! against live data by default; embedded token claims are advisory.

pub mod api;
pub mod cli;
pub mod identity;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{ensure, Context, Result};
    use std::{fs, path::PathBuf};

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }

    // Normalize SQL to avoid brittle formatting checks in schema tests.
    fn canonicalize_sql(sql: &str) -> String {
        sql.chars()
            .filter(|ch| !ch.is_whitespace())
            .map(|ch| ch.to_ascii_lowercase())
            .collect()
    }

    #[test]
    fn schema_sql_integrity() -> Result<()> {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("db/sql/01_umbral.sql");
        let sql = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read SQL file at {}", path.display()))?;
        let canonical = canonicalize_sql(&sql);

        ensure!(
            canonical.contains("onrefresh_tokens(user_id,device_id)wherenotis_revoked"),
            "active device index is missing in {}",
            path.display()
        );
        ensure!(
            canonical.contains("unique(role_id,module_id,permission_type_id)"),
            "permission triple uniqueness is missing in {}",
            path.display()
        );
        ensure!(
            canonical.contains("users_email_keyonusers(lower(email))"),
            "case-insensitive email index is missing in {}",
            path.display()
        );
        Ok(())
    }
}
