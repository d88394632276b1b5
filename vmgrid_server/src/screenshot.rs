//! Synchronous screenshot capture from the agent running inside each VM.
//! Capture is best-effort: a missing or slow agent never blocks the reply.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;

/// The agent answers well under this on a healthy VM.
const AGENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetch a PNG from the agent on the VM. `None` on any failure.
pub async fn take_screenshot(
    http: &reqwest::Client,
    ip: IpAddr,
    agent_port: u16,
) -> Option<Vec<u8>> {
    let url = format!("http://{ip}:{agent_port}/takeScreenshot");
    let reply = http
        .get(&url)
        .timeout(AGENT_TIMEOUT)
        .send()
        .await
        .ok()?
        .error_for_status()
        .ok()?;
    let body = reply.bytes().await.ok()?;
    decode_agent_payload(&body)
}

/// The agent either sends a bare base64 string or wraps it in JSON as
/// `{"screenshot": "<base64>"}`.
fn decode_agent_payload(body: &[u8]) -> Option<Vec<u8>> {
    let engine = base64::engine::general_purpose::STANDARD;

    if let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(encoded) = parsed.get("screenshot").and_then(|v| v.as_str()) {
            return engine.decode(encoded.trim()).ok();
        }
    }

    let text = std::str::from_utf8(body).ok()?;
    engine.decode(text.trim()).ok()
}

/// Where a step's screenshot lives: `<root>/<session>/<logstep>.png`.
pub fn screenshot_path(root: &Path, session_id: i64, log_step_id: i64) -> PathBuf {
    root.join(session_id.to_string())
        .join(format!("{log_step_id}.png"))
}

/// Persist the image, creating the per-session directory as needed.
pub async fn write_screenshot(path: &Path, png: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, png).await
}
