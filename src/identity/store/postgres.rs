//! Postgres-backed store.
//!
//! Rotation revokes and inserts inside one transaction. The partial unique
//! index `refresh_tokens_active_device_key` is what makes the
//! one-active-session-per-device rule hold under concurrency: two racing
//! logins for the same device cannot both commit an active row, the loser
//! gets a unique violation and retries the whole transaction.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgPool, Postgres, Row, Transaction,
};
use std::time::Duration;
use tracing::{debug, Instrument};
use uuid::Uuid;

use super::{IdentityStore, RevokeOutcome, RotationOutcome, RotationRequest, SessionStore};
use crate::identity::{
    credentials::PasswordHasher,
    models::{
        Identity, Module, PermissionType, RefreshSession, ResolvedGrant, Role, RoleAssignment,
        SessionFlavor,
    },
    seed,
};

pub const SCHEMA: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/db/sql/01_umbral.sql"));

const ROTATION_ATTEMPTS: usize = 3;

const SESSION_COLUMNS: &str = "id, user_id, token_hash, session_type, issued_at, expires_at, \
     last_used, is_revoked, revoked_reason, revoked_at, device_id, device_name, platform, \
     app_version, user_agent, ip_address";

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// # Errors
    /// Returns an error if the database is unreachable.
    pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    ///
    /// # Errors
    /// Returns an error if a statement fails.
    pub async fn apply_schema(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to apply schema")?;
        Ok(())
    }

    /// Seed the default catalog when the database has no users yet.
    /// Returns `true` if anything was written.
    ///
    /// # Errors
    /// Returns an error if any insert fails.
    pub async fn seed_default_catalog(&self, hasher: &dyn PasswordHasher) -> anyhow::Result<bool> {
        let query = "SELECT EXISTS (SELECT 1 FROM users)";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let has_users: bool = sqlx::query_scalar(query)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to check for users")?;
        if has_users {
            return Ok(false);
        }

        let admin = seed::admin_identity(hasher)?;
        let mut tx = self.pool.begin().await.context("failed to begin seed")?;

        for permission_type in seed::permission_types() {
            sqlx::query(
                "INSERT INTO permission_types (id, name, code, description) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(permission_type.id)
            .bind(&permission_type.name)
            .bind(&permission_type.code)
            .bind(&permission_type.description)
            .execute(&mut *tx)
            .await
            .context("failed to seed permission types")?;
        }
        for module in seed::modules() {
            sqlx::query(
                "INSERT INTO modules (id, name, description, enabled) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(module.id)
            .bind(&module.name)
            .bind(&module.description)
            .bind(module.enabled)
            .execute(&mut *tx)
            .await
            .context("failed to seed modules")?;
        }
        for role in seed::roles() {
            sqlx::query(
                "INSERT INTO roles (id, name, description, enabled) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(role.id)
            .bind(&role.name)
            .bind(&role.description)
            .bind(role.enabled)
            .execute(&mut *tx)
            .await
            .context("failed to seed roles")?;
        }

        sqlx::query(
            "INSERT INTO users (id, name, email, password_hash, enabled) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(admin.id)
        .bind(&admin.name)
        .bind(&admin.email)
        .bind(&admin.password_hash)
        .bind(admin.enabled)
        .execute(&mut *tx)
        .await
        .context("failed to seed administrator")?;

        sqlx::query(
            "INSERT INTO user_roles (user_id, role_id) SELECT $1, id FROM roles WHERE name = $2 \
             ON CONFLICT DO NOTHING",
        )
        .bind(admin.id)
        .bind(seed::ADMIN_ROLE)
        .execute(&mut *tx)
        .await
        .context("failed to assign administrator role")?;

        sqlx::query(
            "INSERT INTO permissions (id, role_id, module_id, permission_type_id) \
             SELECT gen_random_uuid(), r.id, m.id, pt.id \
             FROM roles r CROSS JOIN modules m CROSS JOIN permission_types pt \
             WHERE r.name = $1 AND pt.name = $2 \
             ON CONFLICT (role_id, module_id, permission_type_id) DO NOTHING",
        )
        .bind(seed::ADMIN_ROLE)
        .bind(seed::ADMIN_PERMISSION_TYPE)
        .execute(&mut *tx)
        .await
        .context("failed to seed administrator grants")?;

        tx.commit().await.context("failed to commit seed")?;
        Ok(true)
    }

    async fn rotate_once(&self, request: &RotationRequest) -> Result<RotationOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        if let Some(replaced) = request.replaces {
            let query = r"
                SELECT id FROM refresh_tokens
                WHERE id = $1 AND NOT is_revoked AND expires_at >= $2
                FOR UPDATE
            ";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.statement = query
            );
            let row = sqlx::query(query)
                .bind(replaced)
                .bind(request.now)
                .fetch_optional(&mut *tx)
                .instrument(span)
                .await?;
            if row.is_none() {
                tx.rollback().await?;
                return Ok(RotationOutcome::Superseded);
            }
        }

        let revoked = revoke_scope(&mut tx, request).await?;
        insert_session(&mut tx, &request.session).await?;
        tx.commit().await?;

        Ok(RotationOutcome::Committed { revoked })
    }
}

async fn revoke_scope(
    tx: &mut Transaction<'_, Postgres>,
    request: &RotationRequest,
) -> Result<Vec<Uuid>, sqlx::Error> {
    let query = r"
        UPDATE refresh_tokens
        SET is_revoked = TRUE, revoked_reason = $3, revoked_at = $4
        WHERE user_id = $1 AND NOT is_revoked AND (device_id = $2 OR id = $5)
        RETURNING id
        ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(request.session.user_id)
        .bind(request.scope.device_id())
        .bind(&request.reason)
        .bind(request.now)
        .bind(request.replaces)
        .fetch_all(&mut **tx)
        .instrument(span)
        .await?;
    Ok(rows.iter().map(|row| row.get::<Uuid, _>("id")).collect())
}

async fn insert_session(
    tx: &mut Transaction<'_, Postgres>,
    session: &RefreshSession,
) -> Result<(), sqlx::Error> {
    let query = r"
        INSERT INTO refresh_tokens (
            id, user_id, token_hash, session_type, issued_at, expires_at, last_used,
            is_revoked, revoked_reason, revoked_at, device_id, device_name, platform,
            app_version, user_agent, ip_address
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session.id)
        .bind(session.user_id)
        .bind(&session.token_hash)
        .bind(session.flavor.as_str())
        .bind(session.issued_at)
        .bind(session.expires_at)
        .bind(session.last_used)
        .bind(session.revoked)
        .bind(&session.revoked_reason)
        .bind(session.revoked_at)
        .bind(&session.device_id)
        .bind(&session.device_name)
        .bind(&session.platform)
        .bind(&session.app_version)
        .bind(&session.user_agent)
        .bind(&session.ip_address)
        .execute(&mut **tx)
        .instrument(span)
        .await?;
    Ok(())
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn session_from_row(row: &PgRow) -> anyhow::Result<RefreshSession> {
    let session_type: String = row.get("session_type");
    let flavor = SessionFlavor::parse(&session_type)
        .ok_or_else(|| anyhow!("unknown session_type: {session_type}"))?;
    Ok(RefreshSession {
        id: row.get("id"),
        user_id: row.get("user_id"),
        token_hash: row.get("token_hash"),
        flavor,
        issued_at: row.get("issued_at"),
        expires_at: row.get("expires_at"),
        last_used: row.get("last_used"),
        revoked: row.get("is_revoked"),
        revoked_reason: row.get("revoked_reason"),
        revoked_at: row.get("revoked_at"),
        device_id: row.get("device_id"),
        device_name: row.get("device_name"),
        platform: row.get("platform"),
        app_version: row.get("app_version"),
        user_agent: row.get("user_agent"),
        ip_address: row.get("ip_address"),
    })
}

fn identity_from_row(row: &PgRow) -> Identity {
    Identity {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        enabled: row.get("enabled"),
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn rotate(&self, request: &RotationRequest) -> anyhow::Result<RotationOutcome> {
        for attempt in 1..=ROTATION_ATTEMPTS {
            match self.rotate_once(request).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if is_unique_violation(&err) => {
                    debug!(attempt, "concurrent session write, retrying rotation");
                }
                Err(err) => return Err(err).context("failed to rotate session"),
            }
        }
        Err(anyhow!(
            "failed to rotate session after {ROTATION_ATTEMPTS} attempts"
        ))
    }

    async fn find_by_token_hash(
        &self,
        token_hash: &[u8],
    ) -> anyhow::Result<Option<RefreshSession>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM refresh_tokens WHERE token_hash = $1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup session by token")?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<RefreshSession>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM refresh_tokens WHERE id = $1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup session")?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn revoke(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RevokeOutcome> {
        // A single statement tells the three outcomes apart without a race.
        let query = r"
            WITH target AS (
                SELECT id, is_revoked FROM refresh_tokens WHERE id = $1 FOR UPDATE
            ), updated AS (
                UPDATE refresh_tokens
                SET is_revoked = TRUE, revoked_reason = $2, revoked_at = $3
                WHERE id = $1 AND NOT is_revoked
                RETURNING id
            )
            SELECT
                (SELECT COUNT(*) FROM target) AS found,
                (SELECT COUNT(*) FROM updated) AS changed
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(id)
            .bind(reason)
            .bind(now)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke session")?;

        let found: i64 = row.get("found");
        let changed: i64 = row.get("changed");
        Ok(match (found, changed) {
            (0, _) => RevokeOutcome::NotFound,
            (_, 0) => RevokeOutcome::AlreadyRevoked,
            _ => RevokeOutcome::Revoked,
        })
    }

    async fn revoke_all(
        &self,
        user_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let query = r"
            UPDATE refresh_tokens
            SET is_revoked = TRUE, revoked_reason = $2, revoked_at = $3
            WHERE user_id = $1 AND NOT is_revoked
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(reason)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke sessions")?;
        Ok(result.rows_affected())
    }

    async fn list_active(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<RefreshSession>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM refresh_tokens \
             WHERE user_id = $1 AND NOT is_revoked AND expires_at >= $2 \
             ORDER BY last_used DESC"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(now)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to list sessions")?;
        rows.iter().map(session_from_row).collect()
    }

    async fn touch(&self, id: Uuid, now: DateTime<Utc>) -> anyhow::Result<()> {
        // Record activity without extending the session lifetime.
        let query = "UPDATE refresh_tokens SET last_used = $2 WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to touch session")?;
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for PgStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<Identity>> {
        let query = r"
            SELECT id, name, email, password_hash, enabled
            FROM users
            WHERE LOWER(email) = LOWER($1)
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user by email")?;
        Ok(row.as_ref().map(identity_from_row))
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<Identity>> {
        let query = "SELECT id, name, email, password_hash, enabled FROM users WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user")?;
        Ok(row.as_ref().map(identity_from_row))
    }

    async fn role_assignments(&self, user_id: Uuid) -> anyhow::Result<Vec<RoleAssignment>> {
        let query = r"
            SELECT
                r.id, r.name, r.description, r.enabled,
                m.id AS module_id, m.name AS module_name,
                m.description AS module_description, m.enabled AS module_enabled,
                pt.id AS permission_type_id, pt.name AS permission_type_name,
                pt.code AS permission_type_code, pt.description AS permission_type_description
            FROM user_roles ur
            JOIN roles r ON r.id = ur.role_id
            LEFT JOIN permissions p ON p.role_id = r.id
            LEFT JOIN modules m ON m.id = p.module_id
            LEFT JOIN permission_types pt ON pt.id = p.permission_type_id
            WHERE ur.user_id = $1
            ORDER BY r.name, m.name, pt.name
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to load role assignments")?;

        let mut assignments: Vec<RoleAssignment> = Vec::new();
        for row in &rows {
            let role_id: Uuid = row.get("id");
            if assignments.last().map(|a| a.role.id) != Some(role_id) {
                assignments.push(RoleAssignment {
                    role: Role {
                        id: role_id,
                        name: row.get("name"),
                        description: row.get("description"),
                        enabled: row.get("enabled"),
                    },
                    grants: Vec::new(),
                });
            }

            let module_id: Option<Uuid> = row.get("module_id");
            let permission_type_id: Option<Uuid> = row.get("permission_type_id");
            let (Some(module_id), Some(permission_type_id), Some(assignment)) =
                (module_id, permission_type_id, assignments.last_mut())
            else {
                continue;
            };
            assignment.grants.push(ResolvedGrant {
                module: Module {
                    id: module_id,
                    name: row.get("module_name"),
                    description: row.get("module_description"),
                    enabled: row.get("module_enabled"),
                },
                permission_type: PermissionType {
                    id: permission_type_id,
                    name: row.get("permission_type_name"),
                    code: row.get("permission_type_code"),
                    description: row.get("permission_type_description"),
                },
            });
        }
        Ok(assignments)
    }

    async fn catalog(&self) -> anyhow::Result<(Vec<Module>, Vec<PermissionType>)> {
        let query = "SELECT id, name, description, enabled FROM modules ORDER BY name";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let modules = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to load modules")?
            .iter()
            .map(|row| Module {
                id: row.get("id"),
                name: row.get("name"),
                description: row.get("description"),
                enabled: row.get("enabled"),
            })
            .collect();

        let query = "SELECT id, name, code, description FROM permission_types ORDER BY name";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let permission_types = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to load permission types")?
            .iter()
            .map(|row| PermissionType {
                id: row.get("id"),
                name: row.get("name"),
                code: row.get("code"),
                description: row.get("description"),
            })
            .collect();

        Ok((modules, permission_types))
    }
}
