use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use vmgrid_provider::{ping_vm, Activation, CloneDriver};

/// Prefix of VMs created on demand for a waiting session.
pub const ONDEMAND_PREFIX: &str = "ondemand";

/// Prefix of VMs created ahead of demand by the preloader.
pub const PRELOADED_PREFIX: &str = "preloaded";

/// One virtual machine cloned from an origin image.
///
/// The identity fields are fixed at construction; the mutable bits (`ip`,
/// `mac`, `ready`, `checking`, the activity timer) are touched from request
/// handlers and the background workers, so they carry their own locks and
/// never require the pool's structural lock.
pub struct CloneVm {
    name: String,
    platform: String,
    prefix: String,
    created: DateTime<Utc>,
    driver: Arc<dyn CloneDriver>,

    ip: Mutex<Option<IpAddr>>,
    mac: Mutex<Option<String>>,
    ready: AtomicBool,
    checking: AtomicBool,
    timer: Mutex<Instant>,
}

impl CloneVm {
    /// `name` must be the same name the driver was minted for.
    pub fn new(name: String, platform: &str, prefix: &str, driver: Arc<dyn CloneDriver>) -> Arc<Self> {
        Arc::new(Self {
            name,
            platform: platform.to_string(),
            prefix: prefix.to_string(),
            created: Utc::now(),
            driver,
            ip: Mutex::new(None),
            mac: Mutex::new(None),
            ready: AtomicBool::new(false),
            checking: AtomicBool::new(false),
            timer: Mutex::new(Instant::now()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn driver(&self) -> &Arc<dyn CloneDriver> {
        &self.driver
    }

    pub fn is_preloaded(&self) -> bool {
        self.prefix == PRELOADED_PREFIX
    }

    pub fn ip(&self) -> Option<IpAddr> {
        *self.ip.lock()
    }

    pub fn mac(&self) -> Option<String> {
        self.mac.lock().clone()
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn checking(&self) -> bool {
        self.checking.load(Ordering::Acquire)
    }

    pub fn set_checking(&self, checking: bool) {
        self.checking.store(checking, Ordering::Release);
    }

    /// Record a successful activation: address, MAC, readiness, fresh timer.
    pub fn record_activation(&self, activation: &Activation) {
        *self.ip.lock() = Some(activation.ip);
        *self.mac.lock() = activation.mac.clone();
        self.set_ready(true);
        self.restart_timer();
    }

    /// Reset the last-activity timer. Called on every forwarded request.
    pub fn restart_timer(&self) {
        *self.timer.lock() = Instant::now();
    }

    /// Time since the last recorded activity.
    pub fn idle(&self) -> Duration {
        self.timer.lock().elapsed()
    }

    /// Liveness: does the guest service answer its port right now?
    pub async fn vm_is_ready(&self, port: u16, deadline: Duration) -> bool {
        match self.ip() {
            Some(ip) => ping_vm(ip, port, deadline).await,
            None => false,
        }
    }
}

impl std::fmt::Debug for CloneVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloneVm")
            .field("name", &self.name)
            .field("platform", &self.platform)
            .field("ip", &self.ip())
            .field("ready", &self.ready())
            .field("checking", &self.checking())
            .finish()
    }
}
