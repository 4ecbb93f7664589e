/**
 * API REST SMOKEWATCH - Surface de lecture pour la couche de présentation
 *
 * RÔLE :
 * Expose les dernières lectures et l'historique depuis le store, l'état
 * d'ingestion et le registre des destinataires d'alerte. Ne parle jamais
 * au broker : la présentation interroge le store, pas le flux MQTT.
 *
 * ROUTES :
 * - GET  /health                      : liveness, toujours ouvert
 * - GET  /system/health               : compteurs d'ingestion + état connexion
 * - GET  /readings/latest/{kind}      : dernière lecture (404 = pas de donnée)
 * - GET  /readings?limit=N            : lectures récentes, plus récentes d'abord
 * - GET  /readings/history?kind=&minutes=
 * - GET|POST|DELETE /alerts/recipients
 *
 * SÉCURITÉ :
 * Si SMOKEWATCH_API_KEY est défini, header x-api-key requis sauf sur /health.
 * Sans clé, l'API est en lecture seule : POST/DELETE refusés (401).
 * Une erreur store côté lecture = "pas de donnée", jamais un 500 détaillé.
 */

use crate::health::{HealthTracker, IngestHealth};
use crate::models::{AlertRecipient, Reading, ReadingKind};
use crate::ports::SharedStore;
use crate::recipients::{RecipientError, RecipientRegistry};
use crate::subscription::ConnectionState;
use axum::extract::{Path, Query, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::watch;
use tracing::{debug, warn};

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;
const DEFAULT_HISTORY_MINUTES: i64 = 60;
/// Fenêtre d'historique maximale : un an
const MAX_HISTORY_MINUTES: i64 = 366 * 24 * 60;

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub recipients: RecipientRegistry,
    pub health: HealthTracker,
    pub connection: watch::Receiver<ConnectionState>,
    pub api_key: Option<Arc<str>>,
}

fn is_authorized(api_key: Option<&str>, method: &Method, path: &str, provided: Option<&str>) -> bool {
    if path == "/health" {
        return true;
    }
    match api_key {
        Some(expected) => provided.is_some_and(|v| v == expected),
        None => *method == Method::GET || *method == Method::HEAD,
    }
}

async fn require_api_key(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());
    if !is_authorized(app.api_key.as_deref(), req.method(), req.uri().path(), provided) {
        warn!(method = %req.method(), path = %req.uri().path(), "rejected request without valid API key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/readings", get(get_recent))
        .route("/readings/latest/{kind}", get(get_latest))
        .route("/readings/history", get(get_history))
        .route(
            "/alerts/recipients",
            get(list_recipients).post(add_recipient).delete(remove_recipient),
        )
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<IngestHealth> {
    let connection = *app.connection.borrow();
    Json(app.health.get_health(connection, app.store.info()))
}

// GET /readings/latest/{kind}
async fn get_latest(
    State(app): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<Reading>, StatusCode> {
    let kind: ReadingKind = kind.parse().map_err(|_| StatusCode::NOT_FOUND)?;
    match app.store.latest(kind) {
        Ok(Some(reading)) => Ok(Json(reading)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            debug!(error = %e, "latest query failed");
            Err(StatusCode::NOT_FOUND)
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RecentParams {
    limit: Option<usize>,
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
}

// GET /readings?limit=N
async fn get_recent(
    State(app): State<AppState>,
    Query(params): Query<RecentParams>,
) -> Json<Vec<Reading>> {
    let readings = app.store.recent(clamp_limit(params.limit)).unwrap_or_else(|e| {
        debug!(error = %e, "recent query failed");
        Vec::new()
    });
    Json(readings)
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    kind: String,
    minutes: Option<i64>,
    limit: Option<usize>,
}

// GET /readings/history?kind=smoke&minutes=30
async fn get_history(
    State(app): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<Reading>>, StatusCode> {
    let kind: ReadingKind = params.kind.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    let minutes = params.minutes.unwrap_or(DEFAULT_HISTORY_MINUTES).clamp(0, MAX_HISTORY_MINUTES);
    let since = OffsetDateTime::now_utc()
        .checked_sub(Duration::minutes(minutes))
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);

    let readings = app
        .store
        .history(kind, since, clamp_limit(params.limit))
        .unwrap_or_else(|e| {
            debug!(error = %e, "history query failed");
            Vec::new()
        });
    Ok(Json(readings))
}

// GET /alerts/recipients
async fn list_recipients(State(app): State<AppState>) -> Json<Vec<AlertRecipient>> {
    Json(app.recipients.list())
}

// POST /alerts/recipients {"email": "..."}
async fn add_recipient(
    State(app): State<AppState>,
    Json(body): Json<AlertRecipient>,
) -> Result<(StatusCode, Json<AlertRecipient>), (StatusCode, Json<serde_json::Value>)> {
    match app.recipients.register(&body.email) {
        Ok(recipient) => Ok((StatusCode::CREATED, Json(recipient))),
        Err(e) => {
            let code = match e {
                RecipientError::EmptyEmail => StatusCode::BAD_REQUEST,
                RecipientError::AlreadyRegistered(_) => StatusCode::CONFLICT,
            };
            Err((code, Json(serde_json::json!({ "error": e.to_string() }))))
        }
    }
}

// DELETE /alerts/recipients {"email": "..."}
async fn remove_recipient(
    State(app): State<AppState>,
    Json(body): Json<AlertRecipient>,
) -> StatusCode {
    if app.recipients.remove(&body.email) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
