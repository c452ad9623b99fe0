use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{error::ErrorBody, extract_bearer_token};
use crate::{
    api::ApiState,
    identity::{AuthError, Requirement},
};

pub const CODE_POLICY_NOT_FOUND: &str = "Policies.NotFound";

#[utoipa::path(
    get,
    path = "/v1/auth/authorize/{module}/{permission}",
    params(
        ("module" = String, Path, description = "Module name, e.g. Catalog"),
        ("permission" = String, Path, description = "Permission type name, e.g. Leer")
    ),
    responses(
        (status = 204, description = "Allowed"),
        (status = 401, description = "Missing or invalid access token", body = ErrorBody),
        (status = 403, description = "Denied"),
        (status = 404, description = "No such policy", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "authorize"
)]
#[instrument(skip_all)]
pub async fn authorize(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
    Path((module, permission)): Path<(String, String)>,
) -> Response {
    let Some(bearer) = extract_bearer_token(&headers) else {
        return AuthError::Unauthenticated.into_response();
    };
    // Anonymous callers learn nothing about which policies exist.
    let principal = match state.authorization.authenticate(&bearer) {
        Ok(principal) => principal,
        Err(err) => return err.into_response(),
    };

    let policy_name = Requirement::new(module, permission).policy_name();
    let Some(requirement) = state.policies.lookup(&policy_name) else {
        debug!(policy = %policy_name, "unknown policy");
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorBody::new(
                CODE_POLICY_NOT_FOUND,
                format!("Policy {policy_name} is not registered"),
            )),
        )
            .into_response();
    };

    match state.authorization.authorize(&principal, requirement).await {
        Ok(decision) if decision.is_allowed() => StatusCode::NO_CONTENT.into_response(),
        Ok(_) => StatusCode::FORBIDDEN.into_response(),
        Err(err) => err.into_response(),
    }
}
