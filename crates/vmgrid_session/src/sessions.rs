use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use vmgrid_persistence::{Database, NewSession, SessionStatus};
use vmgrid_pool::{CloneVm, PoolError, VmPool};

use crate::{DesiredCapabilities, Result, Session, SessionError};

/// Pause between allocation retries while waiting out `get_vm_timeout`.
const ALLOCATE_RETRY_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SessionsConfig {
    /// Idle time after which the worker reaps a session.
    pub timeout: Duration,
    /// How long a create request may wait for a VM.
    pub get_vm_timeout: Duration,
    /// Selenium port inside the VMs.
    pub selenium_port: u16,
    /// Screenshot root, purged together with stored sessions.
    pub screenshots_dir: PathBuf,
}

/// Upstream Selenium's answer to the create-session POST, before id rewrite.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Everything the proxy needs to answer a create-session request.
#[derive(Debug)]
pub struct CreateOutcome {
    pub session: Arc<Session>,
    /// LogStep recording the client's request; screenshots attach here.
    pub request_step: i64,
    pub reply: UpstreamReply,
}

/// The session table. Owns the VM handle for every active session and is
/// the only component that moves sessions into terminal states.
pub struct Sessions {
    db: Arc<Database>,
    pool: Arc<VmPool>,
    http: reqwest::Client,
    registry: Mutex<HashMap<i64, Arc<Session>>>,
    config: SessionsConfig,
}

impl Sessions {
    pub fn new(db: Arc<Database>, pool: Arc<VmPool>, config: SessionsConfig) -> Arc<Self> {
        Arc::new(Self {
            db,
            pool,
            http: reqwest::Client::new(),
            registry: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &SessionsConfig {
        &self.config
    }

    /// Create a session end to end: parse capabilities, allocate a VM,
    /// record the client's request, open the upstream Selenium session and
    /// transition to running. Any failure after allocation releases the VM
    /// and leaves the session failed.
    pub async fn create(
        &self,
        body: &Value,
        control_line: &str,
        raw_body: &[u8],
    ) -> Result<CreateOutcome> {
        let dc = DesiredCapabilities::parse(body)?;

        let user_id = match &dc.user {
            Some(username) => self
                .db
                .get_user_by_username(username)?
                .map(|user| user.id)
                .unwrap_or(self.db.default_user_id()?),
            None => self.db.default_user_id()?,
        };

        let vm = self.allocate(&dc.platform).await?;

        // From here on the VM must not leak: destroy it on any error until
        // the session owns it, then let `fail` release it.
        let inserted = self.db.create_session(&NewSession {
            name: dc.name.clone(),
            user_id,
            dc: dc.raw.clone(),
            endpoint_ip: vm.ip().map(|ip| ip.to_string()),
            endpoint_name: Some(vm.name().to_string()),
            take_screenshot: dc.take_screenshot,
            run_script: dc.run_script.clone(),
        });
        let id = match inserted {
            Ok(id) => id,
            Err(e) => {
                self.pool.destroy(&vm).await;
                return Err(e.into());
            }
        };

        let name = match self.db.get_session(id) {
            Ok(Some(record)) => record.name,
            _ => format!("Unnamed session {id}"),
        };
        let session = Session::new(
            id,
            name,
            dc.platform.clone(),
            user_id,
            dc.take_screenshot,
            vm.clone(),
        );
        self.registry.lock().insert(id, session.clone());

        let request_step = match self.db.create_log_step(
            id,
            control_line,
            Some(&String::from_utf8_lossy(raw_body)),
        ) {
            Ok(step) => step,
            Err(e) => {
                self.fail(&session, "audit trail unavailable", Some(&e.to_string()))
                    .await;
                return Err(e.into());
            }
        };

        log::info!(
            "session {id} ({}) starting on {} at {:?}",
            session.name,
            vm.name(),
            vm.ip()
        );

        match self.open_upstream(&vm, raw_body).await {
            Ok((selenium_session, reply)) => {
                self.db.set_selenium_session(id, &selenium_session)?;
                self.db.set_session_status(id, SessionStatus::Running)?;
                session.set_running(selenium_session);
                vm.restart_timer();
                Ok(CreateOutcome {
                    session,
                    request_step,
                    reply,
                })
            }
            Err(e) => {
                self.fail(&session, "upstream session refused", Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Allocate a VM: prefer the ready pool, fall back to an on-demand add,
    /// absorbing transient misses until `get_vm_timeout` runs out.
    async fn allocate(&self, platform: &str) -> Result<Arc<CloneVm>> {
        let deadline = Instant::now() + self.config.get_vm_timeout;
        loop {
            if let Some(vm) = self.pool.get(platform).await {
                return Ok(vm);
            }
            match self.pool.add(platform).await {
                Ok(vm) => return Ok(vm),
                Err(PoolError::CapacityExceeded) if Instant::now() < deadline => {
                    tokio::time::sleep(ALLOCATE_RETRY_PAUSE).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Forward the client's original POST to the VM's Selenium server and
    /// pull the upstream session id out of the answer.
    async fn open_upstream(
        &self,
        vm: &Arc<CloneVm>,
        raw_body: &[u8],
    ) -> Result<(String, UpstreamReply)> {
        let ip = vm
            .ip()
            .ok_or_else(|| SessionError::Upstream("vm has no address".to_string()))?;
        let url = format!(
            "http://{ip}:{}/wd/hub/session",
            self.config.selenium_port
        );

        let reply = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .body(raw_body.to_vec())
            .send()
            .await
            .map_err(|e| SessionError::Upstream(e.to_string()))?;

        let status = reply.status().as_u16();
        let body = reply
            .bytes()
            .await
            .map_err(|e| SessionError::Upstream(e.to_string()))?
            .to_vec();

        let parsed: Value = serde_json::from_slice(&body)
            .map_err(|e| SessionError::Upstream(format!("unparseable reply: {e}")))?;
        let selenium_session = parsed
            .get("sessionId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                SessionError::Upstream(format!(
                    "selenium refused the session: {}",
                    String::from_utf8_lossy(&body)
                ))
            })?
            .to_string();

        Ok((selenium_session, UpstreamReply { status, body }))
    }

    /// Look up an active session.
    pub fn get(&self, id: i64) -> Result<Arc<Session>> {
        self.registry
            .lock()
            .get(&id)
            .filter(|session| !session.is_closed())
            .cloned()
            .ok_or(SessionError::UnknownSession(id))
    }

    pub fn get_clone(&self, id: i64) -> Result<Arc<CloneVm>> {
        self.get(id)?
            .vm()
            .ok_or(SessionError::UnknownSession(id))
    }

    pub fn get_selenium_session(&self, id: i64) -> Result<String> {
        self.get(id)?
            .selenium_session()
            .ok_or(SessionError::UnknownSession(id))
    }

    /// Sessions whose status is waiting or running.
    pub fn active(&self) -> Vec<Arc<Session>> {
        self.registry
            .lock()
            .values()
            .filter(|session| session.is_active())
            .cloned()
            .collect()
    }

    /// Close a session: destroy its VM, finalize the log, transition to
    /// succeeded unless it already failed. Idempotent.
    pub async fn close(&self, id: i64) -> Result<()> {
        let session = {
            let registry = self.registry.lock();
            registry.get(&id).cloned()
        }
        .ok_or(SessionError::UnknownSession(id))?;

        if session.is_closed() {
            return Ok(());
        }

        let vm = session.finish(SessionStatus::Succeeded);
        let status = session.status();
        log::info!("closing session {id} as {status}");

        if let Some(vm) = vm {
            self.pool.destroy(&vm).await;
        }
        self.db.close_session(id, status)?;
        self.registry.lock().remove(&id);

        self.enforce_retention(session.user_id).await;
        Ok(())
    }

    /// Mark a session failed and release its VM.
    pub async fn fail(&self, session: &Arc<Session>, reason: &str, error: Option<&str>) {
        self.fail_with(session, reason, error, false).await;
    }

    async fn fail_with(
        &self,
        session: &Arc<Session>,
        reason: &str,
        error: Option<&str>,
        timed_out: bool,
    ) {
        if session.is_closed() {
            return;
        }
        log::warn!("session {} failed: {reason}", session.id);

        let vm = session.finish(SessionStatus::Failed);
        if let Some(vm) = vm {
            self.pool.destroy(&vm).await;
        }
        if let Err(e) = self
            .db
            .fail_session(session.id, reason, error, timed_out)
        {
            log::error!("recording failure of session {}: {e}", session.id);
        }
        if let Err(e) = self.db.close_session(session.id, SessionStatus::Failed) {
            log::error!("closing failed session {}: {e}", session.id);
        }
        self.registry.lock().remove(&session.id);

        self.enforce_retention(session.user_id).await;
    }

    /// One reaper pass: time out idle sessions, finalize sessions whose VM
    /// is gone. Called by the worker.
    pub async fn reap_idle(&self) {
        for session in self.active() {
            let Some(vm) = session.vm() else { continue };

            if vm.idle() > self.config.timeout {
                self.fail_with(&session, "session timeout", None, true).await;
            } else if !vm.ready() {
                self.fail_with(&session, "vm became unavailable", None, false)
                    .await;
            }
        }
    }

    /// Block until every active session finished, bounded by `limit`.
    pub async fn wait_for_drain(&self, limit: Duration) {
        let deadline = Instant::now() + limit;
        loop {
            let active = self.active();
            if active.is_empty() {
                log::info!("all active sessions have completed");
                return;
            }
            if Instant::now() >= deadline {
                log::warn!("{} session(s) still active at shutdown", active.len());
                return;
            }
            log::info!("waiting for {} active session(s)", active.len());
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Apply the owner's `max_stored_sessions` quota, removing screenshot
    /// directories of purged sessions best-effort.
    async fn enforce_retention(&self, user_id: i64) {
        let max_stored = self
            .db
            .get_user(user_id)
            .ok()
            .flatten()
            .map(|user| user.max_stored_sessions)
            .unwrap_or(100);

        match self.db.purge_stored_sessions(user_id, max_stored) {
            Ok(purged) => {
                for id in purged {
                    let dir = self.config.screenshots_dir.join(id.to_string());
                    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            log::warn!("removing {dir:?}: {e}");
                        }
                    }
                }
            }
            Err(e) => log::error!("retention purge for user {user_id}: {e}"),
        }
    }
}
