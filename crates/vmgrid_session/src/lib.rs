//! Session management: the mapping from client-visible session ids to
//! upstream Selenium sessions, per-session state, and timeout enforcement.

use serde_json::Value;
use thiserror::Error;

mod session;
mod sessions;
mod worker;

pub use session::Session;
pub use sessions::{CreateOutcome, Sessions, SessionsConfig, UpstreamReply};
pub use worker::SessionWorker;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("unknown session: {0}")]
    UnknownSession(i64),

    #[error("invalid desired capabilities: {0}")]
    InvalidCapabilities(String),

    #[error("upstream selenium error: {0}")]
    Upstream(String),

    #[error(transparent)]
    Pool(#[from] vmgrid_pool::PoolError),

    #[error(transparent)]
    Database(#[from] vmgrid_persistence::PersistenceError),
}

/// The capability subset the hub acts on. Everything else passes through
/// to Selenium untouched.
#[derive(Debug, Clone)]
pub struct DesiredCapabilities {
    pub platform: String,
    pub name: Option<String>,
    pub user: Option<String>,
    pub take_screenshot: bool,
    pub run_script: Option<String>,
    /// The raw `desiredCapabilities` object, persisted with the session.
    pub raw: String,
}

impl DesiredCapabilities {
    /// Parse the body of a `POST /session` request.
    pub fn parse(body: &Value) -> Result<Self> {
        let dc = body
            .get("desiredCapabilities")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                SessionError::InvalidCapabilities(
                    "body carries no desiredCapabilities object".to_string(),
                )
            })?;

        let platform = dc
            .get("platform")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                SessionError::InvalidCapabilities("platform is required".to_string())
            })?
            .to_string();

        Ok(Self {
            platform,
            name: dc.get("name").and_then(Value::as_str).map(str::to_string),
            user: dc.get("user").and_then(Value::as_str).map(str::to_string),
            take_screenshot: dc
                .get("takeScreenshot")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            run_script: dc.get("runScript").map(Value::to_string),
            raw: Value::Object(dc.clone()).to_string(),
        })
    }
}
