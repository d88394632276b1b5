use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use vmgrid_provider::{Platform, Provider};

use crate::clone::{CloneVm, ONDEMAND_PREFIX, PRELOADED_PREFIX};
use crate::{PoolError, Result};

/// Pool-wide knobs. The ports and probe deadline are shared by allocation
/// validation and the health checker.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub selenium_port: u16,
    pub ping_timeout: Duration,
}

/// Where an admitted VM lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dest {
    /// Ready pool, waiting for a session.
    Pool,
    /// In-use set, owned by a session.
    Using,
}

#[derive(Default)]
struct PoolState {
    pool: Vec<Arc<CloneVm>>,
    using: Vec<Arc<CloneVm>>,
}

/// The canonical VM registry.
///
/// Both lists live behind one mutex; every membership check and mutation
/// happens under it. Provider calls are slow and never happen while the
/// lock is held: admission inserts the VM first, releases the lock, drives
/// the provider, then takes the lock again to record the outcome.
pub struct VmPool {
    providers: Vec<Arc<dyn Provider>>,
    platforms: HashMap<String, (Platform, usize)>,
    state: Mutex<PoolState>,
    config: PoolConfig,
}

impl VmPool {
    /// Build the pool, discovering platforms from every provider.
    pub async fn new(
        providers: Vec<Arc<dyn Provider>>,
        config: PoolConfig,
    ) -> Result<Self> {
        let mut platforms = HashMap::new();
        for (index, provider) in providers.iter().enumerate() {
            for platform in provider.discover_platforms().await? {
                log::info!(
                    "platform {} on {} ({})",
                    platform.name,
                    platform.node,
                    provider.name()
                );
                platforms.insert(platform.name.clone(), (platform, index));
            }
        }

        Ok(Self {
            providers,
            platforms,
            state: Mutex::new(PoolState::default()),
            config,
        })
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.platforms.values().map(|(p, _)| p.clone()).collect()
    }

    /// Merged preload targets across providers.
    pub fn preload_targets(&self) -> HashMap<String, usize> {
        let mut merged = HashMap::new();
        for provider in &self.providers {
            merged.extend(provider.preloaded().clone());
        }
        merged
    }

    /// Global cap: the sum of per-provider caps.
    pub fn capacity(&self) -> usize {
        self.providers.iter().map(|p| p.max_vm_count()).sum()
    }

    pub fn count(&self) -> usize {
        let state = self.state.lock();
        state.pool.len() + state.using.len()
    }

    pub fn can_produce(&self) -> usize {
        self.capacity().saturating_sub(self.count())
    }

    /// Is a VM for `platform` available for allocation right now?
    pub fn has(&self, platform: &str) -> bool {
        let state = self.state.lock();
        state
            .pool
            .iter()
            .any(|vm| vm.platform() == platform && vm.ready() && !vm.checking())
    }

    /// Admit one on-demand VM into the in-use set.
    pub async fn add(&self, platform: &str) -> Result<Arc<CloneVm>> {
        self.add_to(platform, ONDEMAND_PREFIX, Dest::Using).await
    }

    /// Admit one warm VM into the ready pool.
    pub async fn preload(&self, platform: &str) -> Result<Arc<CloneVm>> {
        self.add_to(platform, PRELOADED_PREFIX, Dest::Pool).await
    }

    async fn add_to(&self, platform: &str, prefix: &str, dest: Dest) -> Result<Arc<CloneVm>> {
        let (origin, provider) = self
            .platforms
            .get(platform)
            .map(|(p, index)| (p.clone(), self.providers[*index].clone()))
            .ok_or_else(|| PoolError::UnknownPlatform(platform.to_string()))?;

        // Reserve the slot under the lock so concurrent admissions cannot
        // overshoot the cap, then create outside it.
        let vm = {
            let mut state = self.state.lock();
            if state.pool.len() + state.using.len() >= self.capacity() {
                return Err(PoolError::CapacityExceeded);
            }
            let name = format!("{}-{}", prefix, uuid::Uuid::new_v4());
            let driver = provider.make_clone(&origin, &name);
            let vm = CloneVm::new(name, platform, prefix, driver);
            match dest {
                Dest::Pool => state.pool.push(vm.clone()),
                Dest::Using => state.using.push(vm.clone()),
            }
            vm
        };

        match vm.driver().create().await {
            Ok(activation) => {
                vm.record_activation(&activation);
                log::info!(
                    "vm {} ({}) active at {}",
                    vm.name(),
                    vm.platform(),
                    activation.ip
                );
                Ok(vm)
            }
            Err(e) => {
                log::error!("creating vm {} failed: {e}", vm.name());
                if let Err(delete_error) = vm.driver().delete().await {
                    log::error!("cleanup of {} failed: {delete_error}", vm.name());
                }
                self.remove_vm(&vm);
                Err(e.into())
            }
        }
    }

    /// Take the oldest ready VM for `platform` out of the pool, re-validating
    /// its liveness first. A VM that fails validation is destroyed and `None`
    /// is returned; the caller decides whether to fall back to `add`.
    pub async fn get(&self, platform: &str) -> Option<Arc<CloneVm>> {
        let candidate = {
            let state = self.state.lock();
            let vm = state
                .pool
                .iter()
                .filter(|vm| vm.platform() == platform && vm.ready() && !vm.checking())
                .min_by_key(|vm| vm.created())
                .cloned()?;
            // Suppress concurrent allocation while we probe off-lock.
            vm.set_checking(true);
            vm
        };

        let alive = candidate
            .vm_is_ready(self.config.selenium_port, self.config.ping_timeout)
            .await;

        if alive {
            {
                let mut state = self.state.lock();
                if let Some(index) = index_of(&state.pool, &candidate) {
                    let vm = state.pool.remove(index);
                    state.using.push(vm);
                }
            }
            candidate.set_checking(false);
            candidate.restart_timer();
            Some(candidate)
        } else {
            log::warn!("pooled vm {} failed validation, destroying", candidate.name());
            candidate.set_checking(false);
            self.destroy(&candidate).await;
            None
        }
    }

    /// Move a VM from the in-use set back to the ready pool. Only rebuild
    /// paths use this; session teardown destroys instead.
    pub fn return_vm(&self, vm: &Arc<CloneVm>) {
        let mut state = self.state.lock();
        if let Some(index) = index_of(&state.using, vm) {
            let vm = state.using.remove(index);
            state.pool.push(vm);
        }
    }

    /// Drop the VM from whichever list holds it. The caller owns the VM
    /// afterwards and must destroy it or hand it over.
    pub fn remove_vm(&self, vm: &Arc<CloneVm>) {
        let mut state = self.state.lock();
        if let Some(index) = index_of(&state.pool, vm) {
            state.pool.remove(index);
        }
        if let Some(index) = index_of(&state.using, vm) {
            state.using.remove(index);
        }
    }

    /// Remove and delete a VM.
    pub async fn destroy(&self, vm: &Arc<CloneVm>) {
        self.remove_vm(vm);
        vm.set_ready(false);
        if let Err(e) = vm.driver().delete().await {
            log::error!("deleting vm {} failed: {e}", vm.name());
        }
    }

    /// Purge both lists, destroying every VM. Terminal.
    pub async fn free(&self) {
        log::info!("freeing pool");
        let drained: Vec<Arc<CloneVm>> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.pool.drain(..).chain(state.using.drain(..)).collect()
        };
        for vm in drained {
            if let Err(e) = vm.driver().delete().await {
                log::error!("deleting vm {} failed: {e}", vm.name());
            }
        }
    }

    /// Snapshot of the ready pool, for the health checker.
    pub fn pooled_vms(&self) -> Vec<Arc<CloneVm>> {
        self.state.lock().pool.clone()
    }

    /// Per-platform counts of VMs with the preloaded prefix in both lists.
    pub fn preloaded_counts(&self) -> HashMap<String, usize> {
        let state = self.state.lock();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for vm in state.pool.iter().chain(state.using.iter()) {
            if vm.is_preloaded() {
                *counts.entry(vm.platform().to_string()).or_default() += 1;
            }
        }
        counts
    }

    /// Admin view of both lists.
    pub fn info(&self) -> PoolInfo {
        let state = self.state.lock();
        PoolInfo {
            pool: ListInfo::of(&state.pool),
            using: ListInfo::of(&state.using),
            can_produce: self
                .capacity()
                .saturating_sub(state.pool.len() + state.using.len()),
        }
    }
}

fn index_of(list: &[Arc<CloneVm>], vm: &Arc<CloneVm>) -> Option<usize> {
    list.iter().position(|candidate| Arc::ptr_eq(candidate, vm))
}

#[derive(Debug, Serialize)]
pub struct PoolInfo {
    pub pool: ListInfo,
    pub using: ListInfo,
    pub can_produce: usize,
}

#[derive(Debug, Serialize)]
pub struct ListInfo {
    pub count: HashMap<String, usize>,
    pub list: Vec<VmView>,
}

impl ListInfo {
    fn of(list: &[Arc<CloneVm>]) -> Self {
        let mut count: HashMap<String, usize> = HashMap::new();
        for vm in list {
            *count.entry(vm.platform().to_string()).or_default() += 1;
        }
        Self {
            count,
            list: list.iter().map(VmView::of).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VmView {
    pub name: String,
    pub platform: String,
    pub ip: Option<String>,
    pub ready: bool,
    pub checking: bool,
}

impl VmView {
    fn of(vm: &Arc<CloneVm>) -> Self {
        Self {
            name: vm.name().to_string(),
            platform: vm.platform().to_string(),
            ip: vm.ip().map(|ip| ip.to_string()),
            ready: vm.ready(),
            checking: vm.checking(),
        }
    }
}
