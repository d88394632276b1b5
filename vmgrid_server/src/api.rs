//! Admin and reporting surface under `/api`.
//!
//! Every reply is wrapped as `{"metacode": <int>, "result": <any>}`; the
//! HTTP status stays 200 and the metacode carries the outcome. Errors ride
//! the same envelope through [`ApiError`]. User endpoints require a valid
//! token in the `X-Token` header.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use vmgrid_persistence::{PersistenceError, SessionRecord, SessionStatus, UserRecord};

use crate::error::{ApiError, ApiResult};
use crate::AppState;

fn render_json(result: Value, metacode: u16) -> Json<Value> {
    Json(json!({ "metacode": metacode, "result": result }))
}

pub async fn status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(render_json(
        json!({
            "platforms": platform_list(&state),
            "sessions": session_list(&state)?,
            "queue": queue_list(&state),
            "pool": pool_info(&state),
        }),
        200,
    ))
}

pub async fn platforms(State(state): State<AppState>) -> Json<Value> {
    render_json(json!({ "platforms": platform_list(&state) }), 200)
}

pub async fn sessions(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(render_json(json!({ "sessions": session_list(&state)? }), 200))
}

pub async fn pool(State(state): State<AppState>) -> Json<Value> {
    render_json(json!({ "pool": pool_info(&state) }), 200)
}

pub async fn queue(State(state): State<AppState>) -> Json<Value> {
    render_json(json!({ "queue": queue_list(&state) }), 200)
}

pub async fn session(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    match state.db.get_session(session_id)? {
        Some(record) => Ok(render_json(session_info(&record), 200)),
        None => Ok(render_json(
            json!(format!("Session {session_id} not found")),
            404,
        )),
    }
}

pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.sessions.close(session_id).await?;
    Ok(render_json(
        json!(format!("Session {session_id} closed successfully")),
        200,
    ))
}

pub async fn user_info(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    if authenticate(&state, &headers)?.is_none() {
        return Ok(render_json(json!("unauthorized"), 401));
    }
    match state.db.get_user(user_id)? {
        Some(user) => Ok(render_json(json!({ "username": user.username }), 200)),
        None => Ok(render_json(json!(format!("User {user_id} not found")), 404)),
    }
}

pub async fn regenerate_token(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    if authenticate(&state, &headers)?.is_none() {
        return Ok(render_json(json!("unauthorized"), 401));
    }
    match state.db.regenerate_token(user_id)? {
        Some(_) => {
            let username = state
                .db
                .get_user(user_id)?
                .map(|user| user.username)
                .unwrap_or_else(|| user_id.to_string());
            Ok(render_json(
                json!(format!(
                    "Token for the user {username} regenerated successfully"
                )),
                200,
            ))
        }
        None => Ok(render_json(json!(format!("User {user_id} not found")), 404)),
    }
}

fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<UserRecord>, ApiError> {
    let Some(token) = headers.get("x-token").and_then(|value| value.to_str().ok()) else {
        return Ok(None);
    };
    Ok(state.db.get_user_by_token(token)?)
}

fn platform_list(state: &AppState) -> Value {
    let names: Vec<Value> = state
        .pool
        .platforms()
        .into_iter()
        .map(|platform| json!({ "name": platform.name, "node": platform.node }))
        .collect();
    Value::Array(names)
}

fn session_list(state: &AppState) -> Result<Value, PersistenceError> {
    let records = state.db.list_sessions()?;
    Ok(Value::Array(records.iter().map(session_info).collect()))
}

/// Sessions still waiting for their upstream to open.
fn queue_list(state: &AppState) -> Value {
    let waiting: Vec<Value> = state
        .sessions
        .active()
        .into_iter()
        .filter(|session| session.status() == SessionStatus::Waiting)
        .map(|session| json!({ "id": session.id, "platform": session.platform }))
        .collect();
    Value::Array(waiting)
}

fn pool_info(state: &AppState) -> Value {
    serde_json::to_value(state.pool.info()).unwrap_or(Value::Null)
}

fn session_info(record: &SessionRecord) -> Value {
    json!({
        "id": record.id,
        "name": record.name,
        "status": record.status.as_str(),
        "closed": record.closed,
        "timed_out": record.timed_out,
        "reason": record.reason,
        "error": record.error,
        "selenium_session": record.selenium_session,
        "endpoint_ip": record.endpoint_ip,
        "endpoint_name": record.endpoint_name,
        "created": record.created.to_rfc3339(),
        "modified": record.modified.to_rfc3339(),
        "deleted": record.deleted.map(|t| t.to_rfc3339()),
    })
}
