//! Proxy round trips through the full router: session creation, id
//! rewriting in both directions, transparent forwarding, teardown and the
//! admin surface. The upstream Selenium is a canned TCP server that records
//! what it was sent.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tower::ServiceExt;

use vmgrid_persistence::{Database, SessionStatus};
use vmgrid_pool::{PoolConfig, VmPool};
use vmgrid_provider::{Activation, CloneDriver, Platform, Provider};
use vmgrid_server::{router, AppState, ProxySettings};
use vmgrid_session::{Sessions, SessionsConfig};

struct MockDriver;

#[async_trait]
impl CloneDriver for MockDriver {
    async fn create(&self) -> vmgrid_provider::Result<Activation> {
        Ok(Activation {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            mac: Some("aa:bb".to_string()),
        })
    }

    async fn delete(&self) -> vmgrid_provider::Result<()> {
        Ok(())
    }

    async fn rebuild(&self) -> vmgrid_provider::Result<Activation> {
        self.create().await
    }

    async fn has_created(&self) -> vmgrid_provider::Result<bool> {
        Ok(true)
    }

    async fn exists(&self) -> vmgrid_provider::Result<bool> {
        Ok(true)
    }

    async fn get_ip(&self) -> vmgrid_provider::Result<IpAddr> {
        Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

struct MockProvider {
    max: usize,
    preloaded: HashMap<String, usize>,
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn max_vm_count(&self) -> usize {
        self.max
    }

    fn preloaded(&self) -> &HashMap<String, usize> {
        &self.preloaded
    }

    async fn discover_platforms(&self) -> vmgrid_provider::Result<Vec<Platform>> {
        Ok(vec![Platform {
            name: "origin_1".to_string(),
            node: "mock".to_string(),
        }])
    }

    fn make_clone(&self, _platform: &Platform, _name: &str) -> Arc<dyn CloneDriver> {
        Arc::new(MockDriver)
    }
}

#[derive(Debug, Clone)]
struct Captured {
    line: String,
    body: String,
}

type CaptureLog = Arc<Mutex<Vec<Captured>>>;

/// Canned upstream: answers every complete HTTP request with `canned_body`
/// and records the request line and body. Bare connects (liveness pings)
/// are dropped silently.
async fn fake_selenium(canned_body: &'static str) -> (u16, CaptureLog) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log: CaptureLog = Arc::new(Mutex::new(Vec::new()));
    let capture = log.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let capture = capture.clone();
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    match socket.read(&mut chunk).await {
                        Ok(0) => return,
                        Ok(n) => {
                            buffer.extend_from_slice(&chunk[..n]);
                            if let Some((line, body)) = parse_request(&buffer) {
                                capture.lock().push(Captured { line, body });
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    canned_body.len(),
                    canned_body
                );
                let _ = socket.write_all(reply.as_bytes()).await;
            });
        }
    });

    (port, log)
}

fn parse_request(buffer: &[u8]) -> Option<(String, String)> {
    let headers_end = buffer.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = String::from_utf8_lossy(&buffer[..headers_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    if buffer.len() < headers_end + 4 + content_length {
        return None;
    }
    let line = head.lines().next().unwrap_or_default().to_string();
    let body =
        String::from_utf8_lossy(&buffer[headers_end + 4..headers_end + 4 + content_length])
            .to_string();
    Some((line, body))
}

async fn harness(selenium_port: u16, max_vms: usize) -> (axum::Router, AppState) {
    let provider: Arc<dyn Provider> = Arc::new(MockProvider {
        max: max_vms,
        preloaded: HashMap::new(),
    });
    let pool = Arc::new(
        VmPool::new(
            vec![provider],
            PoolConfig {
                selenium_port,
                ping_timeout: Duration::from_secs(2),
            },
        )
        .await
        .unwrap(),
    );
    let db = Arc::new(Database::open_in_memory().unwrap());
    let sessions = Sessions::new(
        db.clone(),
        pool.clone(),
        SessionsConfig {
            timeout: Duration::from_secs(60),
            get_vm_timeout: Duration::ZERO,
            selenium_port,
            screenshots_dir: std::env::temp_dir().join("vmgrid-proxy-test"),
        },
    );
    let state = AppState {
        db,
        pool,
        sessions,
        http: reqwest::Client::new(),
        proxy: Arc::new(ProxySettings {
            selenium_port,
            // nothing listens here: screenshot capture must skip silently
            agent_port: 1,
            screenshots_dir: std::env::temp_dir().join("vmgrid-proxy-test"),
        }),
    };
    (router(state.clone()), state)
}

async fn send(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (u16, Value) {
    send_with_headers(app, method, uri, body, &[]).await
}

async fn send_with_headers(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (u16, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&value).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status().as_u16();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let parsed = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes).to_string()));
    (status, parsed)
}

fn create_body() -> Value {
    json!({"desiredCapabilities": {"platform": "origin_1"}})
}

#[tokio::test]
async fn create_returns_the_client_visible_id() {
    let (port, upstream) =
        fake_selenium(r#"{"sessionId":"UP123","status":0,"value":{}}"#).await;
    let (app, state) = harness(port, 2).await;

    let (status, reply) = send(&app, "POST", "/wd/hub/session", Some(create_body())).await;
    assert_eq!(status, 200);

    // the client never sees the upstream id
    let cid = reply["sessionId"].as_str().unwrap();
    assert_ne!(cid, "UP123");
    assert_eq!(reply["status"], 0);

    // the upstream saw the original create POST
    let captured = upstream.lock().clone();
    assert_eq!(captured.len(), 1);
    assert!(captured[0].line.starts_with("POST /wd/hub/session"));
    assert!(captured[0].body.contains("origin_1"));

    // request then reply on record, in wire order
    let steps = state.db.log_steps(cid.parse().unwrap()).unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps[0].control_line.starts_with("POST /wd/hub/session"));
    assert!(steps[1].control_line.starts_with("HTTP/1.1 200"));
}

#[tokio::test]
async fn forwarded_commands_swap_ids_both_ways() {
    let (port, upstream) =
        fake_selenium(r#"{"sessionId":"UP123","status":0,"value":null}"#).await;
    let (app, state) = harness(port, 2).await;

    let (_, reply) = send(&app, "POST", "/wd/hub/session", Some(create_body())).await;
    let cid = reply["sessionId"].as_str().unwrap().to_string();

    let command = json!({"sessionId": cid, "url": "http://example.com"});
    let (status, reply) = send(
        &app,
        "POST",
        &format!("/wd/hub/session/{cid}/url"),
        Some(command),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(reply["sessionId"], cid.as_str());

    let captured = upstream.lock().clone();
    let forwarded = captured.last().unwrap();
    // upstream sees its own id in both path and body
    assert!(
        forwarded.line.starts_with("POST /wd/hub/session/UP123/url"),
        "unexpected request line: {}",
        forwarded.line
    );
    assert!(forwarded.body.contains("UP123"));
    assert!(!forwarded.body.contains(&format!("\"{cid}\"")));

    // four steps now: create req/reply, command req/reply
    let steps = state.db.log_steps(cid.parse().unwrap()).unwrap();
    assert_eq!(steps.len(), 4);
    assert!(steps[2].control_line.contains(&format!("session/{cid}/url")));
}

#[tokio::test]
async fn delete_closes_the_session_and_frees_the_vm() {
    let (port, _upstream) =
        fake_selenium(r#"{"sessionId":"UP123","status":0,"value":null}"#).await;
    let (app, state) = harness(port, 2).await;

    let (_, reply) = send(&app, "POST", "/wd/hub/session", Some(create_body())).await;
    let cid = reply["sessionId"].as_str().unwrap().to_string();

    let (status, _) = send(&app, "DELETE", &format!("/wd/hub/session/{cid}"), None).await;
    assert_eq!(status, 200);

    let record = state.db.get_session(cid.parse().unwrap()).unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::Succeeded);
    assert!(record.closed);
    assert_eq!(state.pool.count(), 0);

    // the id is gone from the proxy surface
    let (status, _) = send(&app, "GET", &format!("/wd/hub/session/{cid}/url"), None).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn unknown_sessions_get_404() {
    let (port, _upstream) = fake_selenium(r#"{"status":0}"#).await;
    let (app, _state) = harness(port, 2).await;

    let (status, _) = send(&app, "GET", "/wd/hub/session/99/url", None).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn capacity_exhaustion_is_a_structured_500() {
    let (port, _upstream) = fake_selenium(r#"{"status":0}"#).await;
    let (app, state) = harness(port, 0).await;

    let (status, reply) = send(&app, "POST", "/wd/hub/session", Some(create_body())).await;
    assert_eq!(status, 500);
    assert_eq!(reply["status"], 13);
    assert!(reply["value"]["message"]
        .as_str()
        .unwrap()
        .contains("maximum count"));
    assert!(state.db.list_sessions().unwrap().is_empty());
}

#[tokio::test]
async fn api_status_wraps_the_metacode_envelope() {
    let (port, _upstream) = fake_selenium(r#"{"status":0}"#).await;
    let (app, _state) = harness(port, 2).await;

    let (status, reply) = send(&app, "GET", "/api/status", None).await;
    assert_eq!(status, 200);
    assert_eq!(reply["metacode"], 200);
    let result = &reply["result"];
    assert!(result["platforms"].is_array());
    assert!(result["sessions"].is_array());
    assert!(result["queue"].is_array());
    assert_eq!(result["pool"]["can_produce"], 2);
}

#[tokio::test]
async fn api_stop_closes_a_running_session() {
    let (port, _upstream) =
        fake_selenium(r#"{"sessionId":"UP123","status":0,"value":null}"#).await;
    let (app, state) = harness(port, 2).await;

    let (_, reply) = send(&app, "POST", "/wd/hub/session", Some(create_body())).await;
    let cid = reply["sessionId"].as_str().unwrap().to_string();

    let (_, reply) = send(&app, "POST", &format!("/api/session/{cid}/stop"), None).await;
    assert_eq!(reply["metacode"], 200);

    let record = state.db.get_session(cid.parse().unwrap()).unwrap().unwrap();
    assert!(record.closed);

    // stopping again reports not found
    let (_, reply) = send(&app, "POST", &format!("/api/session/{cid}/stop"), None).await;
    assert_eq!(reply["metacode"], 404);
}

#[tokio::test]
async fn user_endpoints_require_a_token() {
    let (port, _upstream) = fake_selenium(r#"{"status":0}"#).await;
    let (app, state) = harness(port, 2).await;

    let (_, reply) = send(&app, "GET", "/api/user/1", None).await;
    assert_eq!(reply["metacode"], 401);

    let user = state.db.get_user(1).unwrap().unwrap();
    let token = user.token.unwrap();
    let (_, reply) =
        send_with_headers(&app, "GET", "/api/user/1", None, &[("X-Token", &token)]).await;
    assert_eq!(reply["metacode"], 200);
    assert_eq!(reply["result"]["username"], "default");

    let (_, reply) = send_with_headers(
        &app,
        "POST",
        "/api/user/1/regenerate_token",
        None,
        &[("X-Token", &token)],
    )
    .await;
    assert_eq!(reply["metacode"], 200);
    // the old token no longer authenticates
    let (_, reply) =
        send_with_headers(&app, "GET", "/api/user/1", None, &[("X-Token", &token)]).await;
    assert_eq!(reply["metacode"], 401);
}
