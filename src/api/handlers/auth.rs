use axum::{
    extract::{ConnectInfo, Extension, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tracing::{debug, instrument};
use utoipa::{IntoParams, ToSchema};

use super::{error::ErrorBody, extract_bearer_token, transport_metadata};
use crate::{
    api::ApiState,
    identity::{
        client::ClientHints,
        error::{AuthError, FieldError},
        login::{LoginRequest, LoginResponse, RefreshResponse},
        session::SessionSummary,
    },
};

#[derive(ToSchema, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    pub refresh_token: String,
}

#[derive(IntoParams, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct SessionsQuery {
    /// Device id of the calling installation; web callers omit it.
    pub device_id: Option<String>,
}

fn missing_body() -> AuthError {
    AuthError::Validation(vec![FieldError::new("Body", "Request body is required")])
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login succeeded", body = LoginResponse),
        (status = 400, description = "Invalid input", body = ErrorBody),
        (status = 401, description = "Invalid email or password", body = ErrorBody),
        (status = 403, description = "User account is inactive", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn login(
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    state: Extension<Arc<ApiState>>,
    payload: Option<Json<LoginRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return missing_body().into_response();
    };
    let transport = transport_metadata(&headers, peer.map(|ConnectInfo(addr)| addr));

    match state.login.login(&request, &transport).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Tokens rotated", body = RefreshResponse),
        (status = 400, description = "Invalid input", body = ErrorBody),
        (status = 401, description = "Refresh token is unknown, revoked or expired", body = ErrorBody),
        (status = 403, description = "User account is inactive", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn refresh(
    state: Extension<Arc<ApiState>>,
    payload: Option<Json<RefreshRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return missing_body().into_response();
    };

    match state.login.refresh(&request.refresh_token).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    request_body = LogoutRequest,
    responses(
        (status = 204, description = "Session revoked"),
        (status = 400, description = "Invalid input", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn logout(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
    payload: Option<Json<LogoutRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return missing_body().into_response();
    };
    let access_token = extract_bearer_token(&headers);

    match state
        .login
        .logout(&request.refresh_token, access_token.as_deref())
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/v1/auth/sessions",
    params(SessionsQuery),
    responses(
        (status = 200, description = "Active sessions, most recently used first", body = [SessionSummary]),
        (status = 401, description = "Missing or invalid access token", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn sessions(
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    state: Extension<Arc<ApiState>>,
    query: Option<Query<SessionsQuery>>,
) -> Response {
    let Some(bearer) = extract_bearer_token(&headers) else {
        return AuthError::Unauthenticated.into_response();
    };
    let principal = match state.authorization.authenticate(&bearer) {
        Ok(principal) => principal,
        Err(err) => return err.into_response(),
    };
    let Some(user_id) = principal.user_id else {
        debug!("access token carries no user id");
        return AuthError::Unauthenticated.into_response();
    };

    let hints = ClientHints {
        device_id: query.and_then(|Query(query)| query.device_id),
        ..ClientHints::default()
    };
    let transport = transport_metadata(&headers, peer.map(|ConnectInfo(addr)| addr));

    match state
        .login
        .active_sessions(user_id, &hints, &transport)
        .await
    {
        Ok(sessions) => (StatusCode::OK, Json(sessions)).into_response(),
        Err(err) => err.into_response(),
    }
}
