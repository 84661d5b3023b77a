//! Axum router and all HTTP handlers for esn-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. Handlers map the store's tagged failures to
//! the documented status codes: NotFound→404, Conflict→400 with a reason,
//! Expired→400 with `expired=true`, Unavailable→503, Invariant→500 (no
//! internals leaked).

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use esn_schemas::{CheckInStatus, JobPayload, Observer, ReleaseCause};
use esn_db::StoreError;
use tracing::info;
use uuid::Uuid;

use crate::api_types::{
    AdminActionResponse, AdminUserRequest, CheckInStatusResponse, ConfirmRequest, ConfirmResponse,
    ErrorResponse, HealthResponse, QueueDepth, StatusResponse, TokenQuery, TrusteeAccessInfoResponse,
    TrusteeAccessRequest, TrusteeVaultResponse,
};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        // public check-in surface (token is the credential)
        .route("/checkin/status", get(check_in_status))
        .route("/checkin/confirm", post(check_in_confirm))
        // session-authenticated manual confirmation
        .route("/checkin", post(manual_check_in))
        // administrative overrides
        .route("/admin/checkin", post(admin_check_in))
        .route("/admin/trigger", post(admin_trigger))
        .route("/admin/pause", post(admin_pause))
        .route("/admin/resume", post(admin_resume))
        // trustee vault access
        .route("/trustee/access", get(trustee_access_info))
        .route("/trustee/access", post(trustee_access_vault))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn error_response(e: StoreError) -> Response {
    match e {
        StoreError::NotFound(what) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("{what} not found"))),
        )
            .into_response(),
        StoreError::AlreadyResolved { status } => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::with_reason(
                "already resolved",
                status.as_str(),
            )),
        )
            .into_response(),
        StoreError::Expired => {
            (StatusCode::BAD_REQUEST, Json(ErrorResponse::expired())).into_response()
        }
        StoreError::Conflict(reason) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::with_reason("conflict", reason)),
        )
            .into_response(),
        StoreError::Unavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new("temporarily unavailable; retry")),
        )
            .into_response(),
        StoreError::Invariant(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("internal error")),
        )
            .into_response(),
    }
}

fn observer_from(headers: &HeaderMap) -> Observer {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Observer {
        ip: header_str("x-forwarded-for"),
        user_agent: header_str("user-agent"),
    }
}

/// Admin gate: `Authorization: Bearer <token>`. With no token configured
/// the whole surface is closed.
fn admin_allowed(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.admin_token else {
        return false;
    };
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|got| got == expected)
        .unwrap_or(false)
}

fn admin_refused() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(ErrorResponse::new("admin authorization required")),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> Response {
    let configs = match st.store.status_counts().await {
        Ok(c) => c,
        Err(e) => return error_response(e),
    };

    let mut queues = Vec::new();
    for q in esn_schemas::jobs::ALL_QUEUES {
        match st.queue.depth(q).await {
            Ok(depth) => queues.push(QueueDepth {
                queue: q.as_str().to_string(),
                depth,
            }),
            Err(_) => queues.push(QueueDepth {
                queue: q.as_str().to_string(),
                depth: -1,
            }),
        }
    }
    let dead_lettered = st.queue.dead_letter_count().await.unwrap_or(-1);

    (
        StatusCode::OK,
        Json(StatusResponse {
            configs,
            queues,
            dead_lettered,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /checkin/status?token=T
// ---------------------------------------------------------------------------

pub(crate) async fn check_in_status(
    State(st): State<Arc<AppState>>,
    Query(q): Query<TokenQuery>,
) -> Response {
    let now = st.clock.now();
    match st.store.check_in_status(&q.token, now).await {
        Ok(view) => (
            StatusCode::OK,
            Json(CheckInStatusResponse {
                status: view.status.as_str().to_string(),
                expires_at: view.expires_at,
                is_expired: view.is_expired,
                user_name: view.user_name,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// POST /checkin/confirm {token}
// ---------------------------------------------------------------------------

pub(crate) async fn check_in_confirm(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ConfirmRequest>,
) -> Response {
    if req.token.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("token is required")),
        )
            .into_response();
    }

    let now = st.clock.now();
    let observer = observer_from(&headers);
    match st.store.confirm_check_in(&req.token, now, &observer).await {
        Ok(confirmation) => {
            info!(user_id = %confirmation.user_id, "check-in confirmed");
            (
                StatusCode::OK,
                Json(ConfirmResponse {
                    status: CheckInStatus::Confirmed.as_str().to_string(),
                    next_check_in_due: Some(confirmation.next_check_in_due),
                }),
            )
                .into_response()
        }
        // Idempotent at the token level: a repeat of a CONFIRMED token is a
        // success reporting the frozen status, not an error.
        Err(StoreError::AlreadyResolved {
            status: CheckInStatus::Confirmed,
        }) => (
            StatusCode::OK,
            Json(ConfirmResponse {
                status: CheckInStatus::Confirmed.as_str().to_string(),
                next_check_in_due: None,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// POST /checkin   (session user; auth terminated upstream)
// ---------------------------------------------------------------------------

pub(crate) async fn manual_check_in(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    // The session layer in front of the core resolves the cookie and passes
    // the subject along; an absent header is an unauthenticated request.
    let Some(user_id) = headers
        .get("x-session-user")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
    else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new("session required")),
        )
            .into_response();
    };

    let now = st.clock.now();
    let observer = observer_from(&headers);
    match st
        .store
        .confirm_latest_for_user(user_id, now, &observer)
        .await
    {
        Ok(confirmation) => (
            StatusCode::OK,
            Json(ConfirmResponse {
                status: CheckInStatus::Confirmed.as_str().to_string(),
                next_check_in_due: Some(confirmation.next_check_in_due),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// POST /admin/checkin {user_id}
// ---------------------------------------------------------------------------

pub(crate) async fn admin_check_in(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AdminUserRequest>,
) -> Response {
    if !admin_allowed(&st, &headers) {
        return admin_refused();
    }

    let now = st.clock.now();
    let observer = observer_from(&headers);
    match st
        .store
        .admin_force_check_in(req.user_id, now, &observer)
        .await
    {
        Ok(cfg) => {
            info!(user_id = %req.user_id, "admin force check-in");
            (
                StatusCode::OK,
                Json(AdminActionResponse {
                    user_id: req.user_id,
                    status: cfg.status.as_str().to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// POST /admin/trigger {user_id}
// ---------------------------------------------------------------------------

pub(crate) async fn admin_trigger(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AdminUserRequest>,
) -> Response {
    if !admin_allowed(&st, &headers) {
        return admin_refused();
    }

    let now = st.clock.now();
    let observer = observer_from(&headers);
    if let Err(e) = st.store.record_admin_trigger(req.user_id, now, &observer).await {
        return error_response(e);
    }

    // The terminal transition itself happens inside the release worker's
    // transaction; this only arms the job with zero delay.
    if let Err(e) = st
        .queue
        .enqueue(
            JobPayload::Release {
                user_id: req.user_id,
                cause: ReleaseCause::Admin,
            },
            now,
            now,
        )
        .await
    {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new(format!("enqueue failed: {e}"))),
        )
            .into_response();
    }

    info!(user_id = %req.user_id, "admin trigger enqueued");
    (
        StatusCode::OK,
        Json(AdminActionResponse {
            user_id: req.user_id,
            status: "RELEASE_ENQUEUED".to_string(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// POST /admin/pause  /admin/resume
// ---------------------------------------------------------------------------

pub(crate) async fn admin_pause(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AdminUserRequest>,
) -> Response {
    if !admin_allowed(&st, &headers) {
        return admin_refused();
    }
    let now = st.clock.now();
    let observer = observer_from(&headers);
    match st.store.pause_polling(req.user_id, now, &observer).await {
        Ok(cfg) => (
            StatusCode::OK,
            Json(AdminActionResponse {
                user_id: req.user_id,
                status: cfg.status.as_str().to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

pub(crate) async fn admin_resume(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AdminUserRequest>,
) -> Response {
    if !admin_allowed(&st, &headers) {
        return admin_refused();
    }
    let now = st.clock.now();
    let observer = observer_from(&headers);
    match st.store.resume_polling(req.user_id, now, &observer).await {
        Ok(cfg) => (
            StatusCode::OK,
            Json(AdminActionResponse {
                user_id: req.user_id,
                status: cfg.status.as_str().to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// GET /trustee/access?token=A
// ---------------------------------------------------------------------------

pub(crate) async fn trustee_access_info(
    State(st): State<Arc<AppState>>,
    Query(q): Query<TokenQuery>,
) -> Response {
    let now = st.clock.now();
    match st.store.trustee_by_access_token(&q.token).await {
        Ok((trustee, user)) => {
            let Some(expires_at) = trustee.access_expires_at else {
                return error_response(StoreError::Invariant(
                    "access token without expiry".to_string(),
                ));
            };
            if expires_at <= now {
                return (StatusCode::BAD_REQUEST, Json(ErrorResponse::expired()))
                    .into_response();
            }
            (
                StatusCode::OK,
                Json(TrusteeAccessInfoResponse {
                    trustee_name: trustee.name,
                    user_name: user.display_name,
                    access_expires_at: expires_at,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// POST /trustee/access {access_token}
// ---------------------------------------------------------------------------

pub(crate) async fn trustee_access_vault(
    State(st): State<Arc<AppState>>,
    Json(req): Json<TrusteeAccessRequest>,
) -> Response {
    let now = st.clock.now();
    let (trustee, _user) = match st.store.trustee_by_access_token(&req.access_token).await {
        Ok(pair) => pair,
        Err(e) => return error_response(e),
    };
    let Some(expires_at) = trustee.access_expires_at else {
        return error_response(StoreError::Invariant(
            "access token without expiry".to_string(),
        ));
    };
    if expires_at <= now {
        return (StatusCode::BAD_REQUEST, Json(ErrorResponse::expired())).into_response();
    }

    match st.store.vault_for_user(trustee.user_id).await {
        Ok(vault) => {
            info!(trustee_id = %trustee.id, "vault served to trustee");
            (
                StatusCode::OK,
                Json(TrusteeVaultResponse {
                    vault,
                    access_expires_at: expires_at,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}
