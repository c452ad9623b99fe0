//! Error taxonomy for the identity core.
//!
//! Three families: validation (field-level, raised before any storage access),
//! business (stable codes the caller is expected to branch on) and
//! infrastructure (opaque to clients, logged with full context server-side).

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const CODE_VALIDATION: &str = "Validation.Failed";
pub const CODE_INVALID_CREDENTIALS: &str = "Users.InvalidCredentials";
pub const CODE_INACTIVE_USER: &str = "Users.InactiveUser";
pub const CODE_UNAUTHENTICATED: &str = "Auth.Unauthenticated";
pub const CODE_INTERNAL: &str = "Internal.ServerError";

/// A single failed input rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    pub property_name: String,
    pub error_message: String,
}

impl FieldError {
    #[must_use]
    pub fn new(property_name: &str, error_message: &str) -> Self {
        Self {
            property_name: property_name.to_string(),
            error_message: error_message.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Validation errors occurred")]
    Validation(Vec<FieldError>),

    /// Unknown email and wrong password are deliberately the same error.
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("User account is inactive")]
    InactiveUser,

    /// Every token or session failure collapses to this.
    #[error("Authentication required")]
    Unauthenticated,

    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("{entity} already exists")]
    AlreadyExists { entity: &'static str },

    #[error("infrastructure failure: {0:#}")]
    Infrastructure(#[from] anyhow::Error),
}

pub type AuthResult<T> = Result<T, AuthError>;

impl AuthError {
    /// Stable machine-readable code surfaced to clients.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::Validation(_) => CODE_VALIDATION.to_string(),
            Self::InvalidCredentials => CODE_INVALID_CREDENTIALS.to_string(),
            Self::InactiveUser => CODE_INACTIVE_USER.to_string(),
            Self::Unauthenticated => CODE_UNAUTHENTICATED.to_string(),
            Self::NotFound { entity } => format!("{entity}s.NotFound"),
            Self::AlreadyExists { entity } => format!("{entity}s.AlreadyExists"),
            Self::Infrastructure(_) => CODE_INTERNAL.to_string(),
        }
    }

    /// Message safe to return to a client. Infrastructure details never leave
    /// the process.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Infrastructure(_) => "An unexpected error occurred".to_string(),
            other => other.to_string(),
        }
    }

    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Infrastructure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AuthError::InvalidCredentials.code(), "Users.InvalidCredentials");
        assert_eq!(AuthError::InactiveUser.code(), "Users.InactiveUser");
        assert_eq!(
            AuthError::NotFound { entity: "Session" }.code(),
            "Sessions.NotFound"
        );
        assert_eq!(
            AuthError::AlreadyExists { entity: "Permission" }.code(),
            "Permissions.AlreadyExists"
        );
        assert_eq!(
            AuthError::Validation(Vec::new()).code(),
            "Validation.Failed"
        );
    }

    #[test]
    fn infrastructure_message_is_redacted() {
        let err = AuthError::from(anyhow!("connection refused: postgres://db:5432"));
        assert!(err.is_infrastructure());
        assert_eq!(err.code(), "Internal.ServerError");
        assert!(!err.public_message().contains("postgres"));
        assert!(err.to_string().contains("connection refused"));
    }
}
