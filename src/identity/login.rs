//! Login orchestration plus the refresh and logout exchanges.
//!
//! Login runs: validate input → verify credentials → classify client →
//! prepare session → resolve permissions → sign access token → commit
//! session → list active sessions. The session write is the last mutation
//! and is atomic, so no success response exists without a durable session.
//! Everything after validation runs under the storage deadline; when it
//! fires the in-flight future is dropped, which rolls back any open
//! transaction.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tracing::{debug, error, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    blacklist::TokenBlacklist,
    client::{classify, ClientHints, ClientInfo, TransportMetadata},
    clock::Clock,
    credentials::{CredentialVerifier, PasswordHasher},
    error::{AuthError, AuthResult},
    models::{Identity, SessionFlavor},
    permissions::{PermissionResolver, ResolvedAccess},
    session::{SessionManager, SessionSummary, REASON_LOGOUT},
    store::{IdentityStore, SessionStore},
    token::{IssuedToken, TokenCodec},
    validation::{validate_login, validate_refresh_token},
};

pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .field("device_id", &self.device_id)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

impl LoginRequest {
    #[must_use]
    pub fn hints(&self) -> ClientHints {
        ClientHints {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            platform: self.platform.clone(),
            app_version: self.app_version.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub enabled: bool,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

impl UserSummary {
    fn new(identity: &Identity, access: ResolvedAccess) -> Self {
        Self {
            id: identity.id,
            name: identity.name.clone(),
            email: identity.email.clone(),
            enabled: identity.enabled,
            roles: access.roles,
            permissions: access.permissions,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub access_token_expiry: DateTime<Utc>,
    pub refresh_token_expiry: DateTime<Utc>,
    pub user: UserSummary,
    pub active_sessions: Vec<SessionSummary>,
    pub session_type: SessionFlavor,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub access_token_expiry: DateTime<Utc>,
    pub refresh_token_expiry: DateTime<Utc>,
    pub session_type: SessionFlavor,
}

pub struct LoginService {
    verifier: CredentialVerifier,
    sessions: SessionManager,
    resolver: PermissionResolver,
    identities: Arc<dyn IdentityStore>,
    codec: Arc<TokenCodec>,
    blacklist: Option<Arc<TokenBlacklist>>,
    clock: Arc<dyn Clock>,
    storage_timeout: Duration,
}

impl LoginService {
    /// # Errors
    /// Returns an error if the credential verifier cannot be initialized.
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        sessions: Arc<dyn SessionStore>,
        codec: Arc<TokenCodec>,
        hasher: Arc<dyn PasswordHasher>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let web_session_days = codec.settings().refresh_token_expiry_days();
        Ok(Self {
            verifier: CredentialVerifier::new(identities.clone(), hasher)?,
            sessions: SessionManager::new(sessions, clock.clone())
                .with_web_session_days(web_session_days),
            resolver: PermissionResolver::new(identities.clone()),
            identities,
            codec,
            blacklist: None,
            clock,
            storage_timeout: DEFAULT_STORAGE_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_blacklist(mut self, blacklist: Arc<TokenBlacklist>) -> Self {
        self.blacklist = Some(blacklist);
        self
    }

    #[must_use]
    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = timeout;
        self
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    #[must_use]
    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// Authenticate with email and password and open a session.
    ///
    /// # Errors
    /// Validation, [`AuthError::InvalidCredentials`],
    /// [`AuthError::InactiveUser`], or an infrastructure error. Nothing is
    /// persisted on error.
    #[instrument(skip_all, fields(email = %request.email))]
    pub async fn login(
        &self,
        request: &LoginRequest,
        transport: &TransportMetadata,
    ) -> AuthResult<LoginResponse> {
        validate_login(&request.email, &request.password)?;
        let response = self
            .with_deadline(self.login_inner(request, transport))
            .await?;
        info!(
            user_id = %response.user.id,
            session_type = %response.session_type,
            "login succeeded"
        );
        Ok(response)
    }

    async fn login_inner(
        &self,
        request: &LoginRequest,
        transport: &TransportMetadata,
    ) -> AuthResult<LoginResponse> {
        let identity = self.verifier.verify(&request.email, &request.password).await?;
        let client = classify(&request.hints(), transport);
        debug!(
            is_mobile = client.is_mobile,
            platform = %client.platform,
            device_name = %client.device_name,
            "client classified"
        );

        let pending = self.sessions.prepare(identity.id, &client)?;
        let access = self.resolver.resolve(identity.id).await?;
        let issued = self.sign(&identity, &access)?;
        let session = self.sessions.commit(&pending).await?;

        let active_sessions = self
            .sessions
            .list_active_sessions(identity.id, &client.device_id)
            .await?;

        Ok(LoginResponse {
            access_token: issued.token,
            refresh_token: pending.refresh_token.clone(),
            access_token_expiry: issued.expires_at,
            refresh_token_expiry: session.expires_at,
            user: UserSummary::new(&identity, access),
            active_sessions,
            session_type: client.flavor(),
        })
    }

    /// Exchange a refresh token for a new access token and a new refresh
    /// token. The presented token is revoked ("Rotated") in the same write.
    ///
    /// # Errors
    /// [`AuthError::Unauthenticated`] for unknown, revoked, expired or
    /// concurrently rotated tokens; [`AuthError::InactiveUser`] if the
    /// account was disabled since login.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> AuthResult<RefreshResponse> {
        validate_refresh_token(refresh_token)?;
        self.with_deadline(self.refresh_inner(refresh_token)).await
    }

    async fn refresh_inner(&self, refresh_token: &str) -> AuthResult<RefreshResponse> {
        let current = self
            .sessions
            .find_active_by_token(refresh_token)
            .await?
            .ok_or(AuthError::Unauthenticated)?;

        let identity = self
            .identities
            .find_by_id(current.user_id)
            .await?
            .ok_or(AuthError::Unauthenticated)?;
        if !identity.enabled {
            return Err(AuthError::InactiveUser);
        }

        let pending = self.sessions.prepare_rotation(&current)?;
        let access = self.resolver.resolve(identity.id).await?;
        let issued = self.sign(&identity, &access)?;
        let session = self.sessions.commit(&pending).await?;
        debug!(user_id = %identity.id, "refresh token rotated");

        Ok(RefreshResponse {
            access_token: issued.token,
            refresh_token: pending.refresh_token.clone(),
            access_token_expiry: issued.expires_at,
            refresh_token_expiry: session.expires_at,
            session_type: session.flavor,
        })
    }

    /// Revoke the session behind `refresh_token`. Unknown or already revoked
    /// tokens succeed silently. With the blacklist enabled, a valid
    /// `access_token` is also rejected until its natural expiry.
    ///
    /// # Errors
    /// Infrastructure errors only.
    #[instrument(skip_all)]
    pub async fn logout(&self, refresh_token: &str, access_token: Option<&str>) -> AuthResult<()> {
        validate_refresh_token(refresh_token)?;
        self.with_deadline(async {
            if let Some(session) = self.sessions.find_by_token(refresh_token).await? {
                self.sessions.revoke(&session, REASON_LOGOUT).await?;
            }
            Ok(())
        })
        .await?;

        if let (Some(blacklist), Some(access_token)) = (&self.blacklist, access_token) {
            if let Ok(principal) = self.codec.validate(access_token) {
                blacklist.revoke(&principal.jti, principal.expires_at, self.clock.now());
                debug!("access token blacklisted");
            }
        }
        Ok(())
    }

    /// Active sessions for `user_id`, flagging the one on the caller's device.
    /// Listing counts as use of the caller's session, so its `last_used`
    /// moves to now.
    ///
    /// # Errors
    /// Infrastructure errors only.
    pub async fn active_sessions(
        &self,
        user_id: Uuid,
        hints: &ClientHints,
        transport: &TransportMetadata,
    ) -> AuthResult<Vec<SessionSummary>> {
        let client: ClientInfo = classify(hints, transport);
        self.with_deadline(async {
            if !self.sessions.touch_device(user_id, &client.device_id).await? {
                debug!("no active session on the calling device");
            }
            self.sessions
                .list_active_sessions(user_id, &client.device_id)
                .await
        })
        .await
    }

    fn sign(&self, identity: &Identity, access: &ResolvedAccess) -> AuthResult<IssuedToken> {
        self.codec
            .issue_access_token(identity, &access.roles, &access.permissions)
            .map_err(|err| {
                error!("failed to sign access token: {err}");
                AuthError::Infrastructure(
                    anyhow::Error::new(err).context("failed to sign access token"),
                )
            })
    }

    async fn with_deadline<T, F>(&self, operation: F) -> AuthResult<T>
    where
        F: Future<Output = AuthResult<T>>,
    {
        tokio::time::timeout(self.storage_timeout, operation)
            .await
            .map_err(|_| anyhow!("storage deadline exceeded"))
            .context("identity operation aborted")?
    }
}
