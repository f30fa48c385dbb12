//! Axum JSON API over the listing service.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use remm_core::{Caller, Listing, ListingId, ModerationErrorKind, ModerationResult, UserId};
use remm_moderation::{ListingService, ListingServiceError, ListingUpdate, NewListing};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "remm-web";

/// Stand-in for the authentication layer: the caller's user id.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub listings: Arc<ListingService>,
}

impl AppState {
    pub fn new(listings: Arc<ListingService>) -> Self {
        Self { listings }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/listings", post(create_handler))
        .route(
            "/listings/{id}",
            get(get_handler).patch(update_handler).delete(delete_handler),
        )
        .route("/listings/{id}/publish", post(publish_handler))
        .route("/listings/{id}/unpublish", post(unpublish_handler))
        .route("/listings/{id}/archive", post(archive_handler))
        .route("/listings/{id}/unarchive", post(unarchive_handler))
        .route("/listings/{id}/moderation", post(moderation_handler))
        .with_state(Arc::new(state))
}

/// Serves until ctrl-c, then drains open connections.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(err) => {
            warn!(error = %err, "cannot listen for ctrl-c; running until killed");
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

#[derive(Debug)]
pub enum ApiError {
    MissingIdentity,
    BadIdentity(String),
    Service(ListingServiceError),
}

impl From<ListingServiceError> for ApiError {
    fn from(err: ListingServiceError) -> Self {
        Self::Service(err)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::MissingIdentity => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::BadIdentity(_) => (StatusCode::BAD_REQUEST, "bad_identity"),
            Self::Service(err) => match err {
                ListingServiceError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation"),
                ListingServiceError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                ListingServiceError::Forbidden { .. } => (StatusCode::FORBIDDEN, "forbidden"),
                ListingServiceError::Transition(_) => (StatusCode::CONFLICT, "invalid_transition"),
                ListingServiceError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
                ListingServiceError::Moderation(err) => match err.kind {
                    ModerationErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
                    ModerationErrorKind::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
                    ModerationErrorKind::ClassificationTransport
                    | ModerationErrorKind::ClassificationParse => {
                        (StatusCode::BAD_GATEWAY, err.kind.as_str())
                    }
                    ModerationErrorKind::Storage => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
                },
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = match &self {
            Self::MissingIdentity => format!("missing {USER_ID_HEADER} header"),
            Self::BadIdentity(raw) => format!("invalid {USER_ID_HEADER} header `{raw}`"),
            Self::Service(err) => err.to_string(),
        };
        if status.is_server_error() {
            error!(%status, %message, "request failed");
        }
        (status, Json(ErrorBody { error: code, message })).into_response()
    }
}

fn identity(headers: &HeaderMap) -> Result<Option<UserId>, ApiError> {
    let Some(value) = headers.get(USER_ID_HEADER) else {
        return Ok(None);
    };
    let raw = value
        .to_str()
        .map_err(|_| ApiError::BadIdentity("<non-ascii>".to_string()))?;
    raw.parse::<UserId>()
        .map(Some)
        .map_err(|_| ApiError::BadIdentity(raw.to_string()))
}

fn require_identity(headers: &HeaderMap) -> Result<UserId, ApiError> {
    identity(headers)?.ok_or(ApiError::MissingIdentity)
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        service: CRATE_NAME,
    })
}

async fn create_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<NewListing>,
) -> Result<(StatusCode, Json<Listing>), ApiError> {
    let owner = require_identity(&headers)?;
    let listing = state.listings.create_listing(owner, input).await?;
    Ok((StatusCode::CREATED, Json(listing)))
}

async fn get_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<ListingId>,
) -> Result<Json<Listing>, ApiError> {
    let viewer = identity(&headers)?;
    Ok(Json(state.listings.get_listing(id, viewer).await?))
}

async fn update_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<ListingId>,
    Json(update): Json<ListingUpdate>,
) -> Result<Json<Listing>, ApiError> {
    let user = require_identity(&headers)?;
    Ok(Json(state.listings.update_listing(id, user, update).await?))
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<ListingId>,
) -> Result<StatusCode, ApiError> {
    let user = require_identity(&headers)?;
    state.listings.delete_listing(id, user).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn publish_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<ListingId>,
) -> Result<Json<Listing>, ApiError> {
    let user = require_identity(&headers)?;
    Ok(Json(state.listings.publish_listing(id, user).await?))
}

async fn unpublish_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<ListingId>,
) -> Result<Json<Listing>, ApiError> {
    let user = require_identity(&headers)?;
    Ok(Json(state.listings.unpublish_listing(id, user).await?))
}

async fn archive_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<ListingId>,
) -> Result<Json<Listing>, ApiError> {
    let user = require_identity(&headers)?;
    Ok(Json(state.listings.archive_listing(id, user).await?))
}

async fn unarchive_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<ListingId>,
) -> Result<Json<Listing>, ApiError> {
    let user = require_identity(&headers)?;
    Ok(Json(state.listings.unarchive_listing(id, user).await?))
}

async fn moderation_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<ListingId>,
) -> Result<Json<ModerationResult>, ApiError> {
    let user = require_identity(&headers)?;
    let result = state
        .listings
        .recheck_moderation(id, Caller::User(user))
        .await?;
    Ok(Json(result))
}
