//! The intercepting WebDriver surface under `/wd/hub`.
//!
//! One client request becomes at most one upstream request. Session ids are
//! swapped in the path and body on the way out, and swapped back in the
//! reply. Every hop lands in the session log before it goes on the wire.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use serde_json::{json, Value};

use vmgrid_session::Session;

use crate::error::{WireError, WireResult};
use crate::{rewrite, screenshot, AppState};

/// Upper bound on buffered request/reply bodies.
const BODY_LIMIT: usize = 16 * 1024 * 1024;

pub async fn handle(State(state): State<AppState>, request: Request) -> WireResult<Response> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let headers = request.headers().clone();

    let body = match to_bytes(request.into_body(), BODY_LIMIT).await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
            log::warn!("client disconnected mid-request: {e}");
            return Ok(plain(StatusCode::BAD_REQUEST, "unreadable request body"));
        }
    };

    let control_line = format!("{method} {path} HTTP/1.1");

    if rewrite::is_create_session(method.as_str(), &path) {
        create_session(&state, &control_line, &body).await
    } else if rewrite::is_delete_session(method.as_str(), &path) {
        close_session(&state, &method, &path, &headers, &control_line, &body).await
    } else {
        transparent(&state, &method, &path, &headers, &control_line, &body).await
    }
}

/// `POST …/session`: allocate a VM, open the upstream session, hand the
/// client its own id.
async fn create_session(
    state: &AppState,
    control_line: &str,
    body: &[u8],
) -> WireResult<Response> {
    let parsed: Value =
        serde_json::from_slice(body).context("malformed session request")?;

    let outcome = state.sessions.create(&parsed, control_line, body).await?;

    let cid = outcome.session.id.to_string();
    let reply_body = rewrite::set_body_session_id(&outcome.reply.body, &cid);
    record_reply(state, outcome.session.id, outcome.reply.status, &reply_body);

    // The create reply is one of the moments worth a screenshot.
    capture_screenshot(state, &outcome.session, outcome.request_step).await;

    Ok(json_response(outcome.reply.status, reply_body))
}

/// `DELETE …/session/<id>`: forward the teardown upstream best-effort,
/// then close the session either way.
async fn close_session(
    state: &AppState,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    control_line: &str,
    body: &[u8],
) -> WireResult<Response> {
    let sid = rewrite::session_id_from_path(path)
        .ok_or_else(|| WireError(StatusCode::NOT_FOUND, anyhow!("no session id in path")))?;
    let session = state.sessions.get(sid)?;

    record_request(state, sid, control_line, body);

    let response = match forward(state, &session, method, path, headers, body).await {
        Ok(upstream) => {
            let reply_body = rewrite::set_body_session_id(&upstream.body, &sid.to_string());
            record_reply(state, sid, upstream.status, &reply_body);
            passthrough_response(upstream.status, &upstream.headers, reply_body)
        }
        Err(e) => {
            // The VM is going away regardless; answer the client cleanly.
            log::warn!("session {sid}: teardown forward failed: {e:#}");
            let reply_body =
                serde_json::to_vec(&json!({"sessionId": sid.to_string(), "status": 0}))
                    .unwrap_or_default();
            record_reply(state, sid, 200, &reply_body);
            json_response(200, reply_body)
        }
    };

    if let Err(e) = state.sessions.close(sid).await {
        log::error!("closing session {sid}: {e}");
    }

    Ok(response)
}

/// Everything else: swap ids, forward, swap back.
async fn transparent(
    state: &AppState,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    control_line: &str,
    body: &[u8],
) -> WireResult<Response> {
    let sid = rewrite::session_id_from_path(path)
        .ok_or_else(|| WireError(StatusCode::NOT_FOUND, anyhow!("no session id in path")))?;
    let session = state.sessions.get(sid)?;

    let request_step = record_request(state, sid, control_line, body);

    match forward(state, &session, method, path, headers, body).await {
        Ok(upstream) => {
            let reply_body = rewrite::set_body_session_id(&upstream.body, &sid.to_string());
            record_reply(state, sid, upstream.status, &reply_body);

            if rewrite::wants_screenshot(method.as_str(), path) {
                if let Some(step) = request_step {
                    capture_screenshot(state, &session, step).await;
                }
            }

            Ok(passthrough_response(upstream.status, &upstream.headers, reply_body))
        }
        Err(e) => {
            let text = format!("{e:#}");
            log::error!("session {sid}: {text}");
            state
                .sessions
                .fail(&session, "upstream request failed", Some(&text))
                .await;
            record_reply(state, sid, 500, text.as_bytes());
            Ok(plain(StatusCode::INTERNAL_SERVER_ERROR, &text))
        }
    }
}

struct Forwarded {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
}

/// One upstream round trip with ids swapped to Selenium's view. Resets the
/// session's activity timer on success.
async fn forward(
    state: &AppState,
    session: &Arc<Session>,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> anyhow::Result<Forwarded> {
    let upstream_id = session
        .selenium_session()
        .context("upstream session not established")?;
    let vm = session.vm().context("session has no vm")?;
    let ip = vm.ip().context("vm has no address")?;

    let forward_path = rewrite::set_path_session_id(path, &upstream_id);
    let forward_body = rewrite::set_body_session_id(body, &upstream_id);
    let url = format!("http://{ip}:{}{forward_path}", state.proxy.selenium_port);

    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .context("unsupported method")?;
    let mut request = state.http.request(method, &url);
    for (name, value) in headers {
        if skip_on_forward(name.as_str()) {
            continue;
        }
        request = request.header(name.as_str(), value.as_bytes());
    }

    let reply = request
        .body(forward_body)
        .send()
        .await
        .with_context(|| format!("forwarding to {url}"))?;

    vm.restart_timer();

    let status = reply.status().as_u16();
    let mut reply_headers = HeaderMap::new();
    for (name, value) in reply.headers() {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::try_from(name.as_str()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            reply_headers.insert(name, value);
        }
    }
    let body = reply.bytes().await.context("reading upstream reply")?;

    Ok(Forwarded {
        status,
        headers: reply_headers,
        body: body.to_vec(),
    })
}

/// Headers the proxy owns or that do not survive re-framing. Content-Length
/// is recomputed after the id swap; Accept-Encoding is dropped so the body
/// stays rewritable.
fn skip_on_forward(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "host"
            | "content-length"
            | "connection"
            | "keep-alive"
            | "transfer-encoding"
            | "upgrade"
            | "te"
            | "trailer"
            | "proxy-connection"
            | "accept-encoding"
    )
}

fn record_request(state: &AppState, sid: i64, control_line: &str, body: &[u8]) -> Option<i64> {
    let text = String::from_utf8_lossy(body);
    match state.db.create_log_step(sid, control_line, Some(&text)) {
        Ok(step) => Some(step),
        Err(e) => {
            log::error!("recording request for session {sid}: {e}");
            None
        }
    }
}

fn record_reply(state: &AppState, sid: i64, status: u16, body: &[u8]) {
    let text = String::from_utf8_lossy(body);
    if let Err(e) = state
        .db
        .create_log_step(sid, &format!("HTTP/1.1 {status}"), Some(&text))
    {
        log::error!("recording reply for session {sid}: {e}");
    }
}

/// Grab a screenshot from the VM's agent and pin it to the request's log
/// step. Failures stay silent; capture must never block the reply.
async fn capture_screenshot(state: &AppState, session: &Arc<Session>, request_step: i64) {
    let Some(vm) = session.vm() else { return };
    let Some(ip) = vm.ip() else { return };

    let Some(png) =
        screenshot::take_screenshot(&state.http, ip, state.proxy.agent_port).await
    else {
        return;
    };

    let path =
        screenshot::screenshot_path(&state.proxy.screenshots_dir, session.id, request_step);
    if let Err(e) = screenshot::write_screenshot(&path, &png).await {
        log::warn!("writing screenshot {path:?}: {e}");
        return;
    }
    if let Err(e) = state
        .db
        .attach_screenshot(request_step, &path.to_string_lossy())
    {
        log::warn!("attaching screenshot to step {request_step}: {e}");
    }
}

fn json_response(status: u16, body: Vec<u8>) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "reply assembly failed"))
}

fn passthrough_response(status: u16, headers: &HeaderMap, body: Vec<u8>) -> Response {
    let mut builder =
        Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
    for (name, value) in headers {
        if matches!(
            name.as_str().to_ascii_lowercase().as_str(),
            "content-length" | "transfer-encoding" | "connection"
        ) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "reply assembly failed"))
}

fn plain(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(message.to_string()))
        .expect("static response")
}
