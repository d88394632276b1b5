use std::sync::Arc;

use parking_lot::Mutex;

use vmgrid_persistence::SessionStatus;
use vmgrid_pool::CloneVm;

struct SessionState {
    status: SessionStatus,
    selenium_session: Option<String>,
    closed: bool,
    vm: Option<Arc<CloneVm>>,
}

/// One client-visible session.
///
/// The id is the client-facing identifier the proxy puts back into every
/// reply; the upstream Selenium id lives in the state and is only written
/// at create and close time.
pub struct Session {
    pub id: i64,
    pub name: String,
    pub platform: String,
    pub user_id: i64,
    pub take_screenshot: bool,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new(
        id: i64,
        name: String,
        platform: String,
        user_id: i64,
        take_screenshot: bool,
        vm: Arc<CloneVm>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            platform,
            user_id,
            take_screenshot,
            state: Mutex::new(SessionState {
                status: SessionStatus::Waiting,
                selenium_session: None,
                closed: false,
                vm: Some(vm),
            }),
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status(),
            SessionStatus::Waiting | SessionStatus::Running
        )
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn selenium_session(&self) -> Option<String> {
        self.state.lock().selenium_session.clone()
    }

    pub fn vm(&self) -> Option<Arc<CloneVm>> {
        self.state.lock().vm.clone()
    }

    pub(crate) fn set_running(&self, selenium_session: String) {
        let mut state = self.state.lock();
        state.selenium_session = Some(selenium_session);
        state.status = SessionStatus::Running;
    }

    /// Move to a terminal status and give up the VM reference. Returns the
    /// VM exactly once; terminal states are never overwritten.
    pub(crate) fn finish(&self, status: SessionStatus) -> Option<Arc<CloneVm>> {
        let mut state = self.state.lock();
        if !state.status.is_terminal() {
            state.status = status;
        }
        state.closed = true;
        state.vm.take()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("status", &self.status())
            .finish()
    }
}
