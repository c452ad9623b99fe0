//! Error responses.
//!
//! Every failure leaves as `{ code, message, errors? }`. Infrastructure
//! failures are logged here with full context and leave as a generic 500.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;

use crate::identity::error::{AuthError, FieldError};

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
}

impl ErrorBody {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            errors: Vec::new(),
        }
    }
}

#[must_use]
pub fn status_for(err: &AuthError) -> StatusCode {
    match err {
        AuthError::Validation(_) => StatusCode::BAD_REQUEST,
        AuthError::InvalidCredentials | AuthError::Unauthenticated => StatusCode::UNAUTHORIZED,
        AuthError::InactiveUser => StatusCode::FORBIDDEN,
        AuthError::NotFound { .. } => StatusCode::NOT_FOUND,
        AuthError::AlreadyExists { .. } => StatusCode::CONFLICT,
        AuthError::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if let Self::Infrastructure(cause) = &self {
            error!("request failed: {cause:#}");
        }

        let status = status_for(&self);
        let mut body = ErrorBody::new(self.code(), self.public_message());
        if let Self::Validation(errors) = self {
            body.errors = errors;
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn status_mapping() {
        assert_eq!(
            status_for(&AuthError::Validation(Vec::new())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&AuthError::InvalidCredentials),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_for(&AuthError::InactiveUser), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(&AuthError::Unauthenticated),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&AuthError::NotFound { entity: "Session" }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&AuthError::AlreadyExists { entity: "Role" }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&AuthError::Infrastructure(anyhow!("db down"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn error_body_omits_empty_field_list() -> anyhow::Result<()> {
        let body = serde_json::to_value(ErrorBody::new("Auth.Unauthenticated", "nope"))?;
        assert!(body.get("errors").is_none());

        let mut body = ErrorBody::new("Validation.Failed", "bad");
        body.errors = vec![FieldError::new("Email", "Email is required")];
        let json = serde_json::to_value(&body)?;
        assert_eq!(json["errors"][0]["propertyName"], "Email");
        Ok(())
    }
}
