use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::pool::VmPool;

/// Background health check over the ready pool: probe each VM, rebuild the
/// broken ones, destroy what cannot be rebuilt. The `checking` flag keeps
/// a VM out of allocation while it is being probed.
pub struct VmChecker {
    pool: Arc<VmPool>,
    frequency: Duration,
}

impl VmChecker {
    pub fn new(pool: Arc<VmPool>, frequency: Duration) -> Self {
        Self { pool, frequency }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.frequency);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.fix_broken_vms().await,
                    _ = shutdown.changed() => break,
                }
            }
            log::info!("vm checker stopped");
        })
    }

    pub(crate) async fn fix_broken_vms(&self) {
        let config = self.pool.config();

        for vm in self.pool.pooled_vms() {
            vm.set_checking(true);
            log::info!(
                "checking {} at {:?}:{}",
                vm.name(),
                vm.ip(),
                config.selenium_port
            );

            if vm.ready()
                && !vm
                    .vm_is_ready(config.selenium_port, config.ping_timeout)
                    .await
            {
                match vm.driver().rebuild().await {
                    Ok(activation) => {
                        vm.record_activation(&activation);
                        log::info!("rebuilt {} at {}", vm.name(), activation.ip);
                    }
                    Err(e) => {
                        log::error!("rebuilding {} failed: {e}", vm.name());
                        self.pool.destroy(&vm).await;
                    }
                }
            }

            vm.set_checking(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use vmgrid_provider::{Activation, CloneDriver, Platform, Provider, ProviderError};

    use crate::pool::PoolConfig;

    #[derive(Default)]
    struct Stats {
        rebuilt: AtomicUsize,
        deleted: AtomicUsize,
    }

    struct BrittleDriver {
        stats: Arc<Stats>,
        fail_rebuild: bool,
    }

    #[async_trait]
    impl CloneDriver for BrittleDriver {
        async fn create(&self) -> vmgrid_provider::Result<Activation> {
            Ok(Activation {
                ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                mac: None,
            })
        }

        async fn delete(&self) -> vmgrid_provider::Result<()> {
            self.stats.deleted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rebuild(&self) -> vmgrid_provider::Result<Activation> {
            if self.fail_rebuild {
                return Err(ProviderError::Api("rebuild refused".to_string()));
            }
            self.stats.rebuilt.fetch_add(1, Ordering::SeqCst);
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

    struct BrittleProvider {
        stats: Arc<Stats>,
        fail_rebuild: bool,
        preloaded: HashMap<String, usize>,
    }

    #[async_trait]
    impl Provider for BrittleProvider {
        fn name(&self) -> &'static str {
            "brittle"
        }

        fn max_vm_count(&self) -> usize {
            4
        }

        fn preloaded(&self) -> &HashMap<String, usize> {
            &self.preloaded
        }

        async fn discover_platforms(&self) -> vmgrid_provider::Result<Vec<Platform>> {
            Ok(vec![Platform {
                name: "origin_1".to_string(),
                node: "brittle".to_string(),
            }])
        }

        fn make_clone(&self, _platform: &Platform, _name: &str) -> Arc<dyn CloneDriver> {
            Arc::new(BrittleDriver {
                stats: self.stats.clone(),
                fail_rebuild: self.fail_rebuild,
            })
        }
    }

    async fn broken_pool(fail_rebuild: bool) -> (Arc<VmPool>, Arc<Stats>) {
        // nothing listens on this port, so every probe fails
        let dead_port = {
            let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
                .await
                .unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);
            port
        };
        let stats = Arc::new(Stats::default());
        let provider: Arc<dyn Provider> = Arc::new(BrittleProvider {
            stats: stats.clone(),
            fail_rebuild,
            preloaded: HashMap::new(),
        });
        let pool = Arc::new(
            VmPool::new(
                vec![provider],
                PoolConfig {
                    selenium_port: dead_port,
                    ping_timeout: Duration::from_millis(100),
                },
            )
            .await
            .unwrap(),
        );
        (pool, stats)
    }

    #[tokio::test]
    async fn broken_vms_are_rebuilt_in_place() {
        let (pool, stats) = broken_pool(false).await;
        pool.preload("origin_1").await.unwrap();

        let checker = VmChecker::new(pool.clone(), Duration::from_secs(3600));
        checker.fix_broken_vms().await;

        assert_eq!(stats.rebuilt.load(Ordering::SeqCst), 1);
        assert_eq!(pool.count(), 1, "rebuilt vm stays pooled");
        let vm = &pool.pooled_vms()[0];
        assert!(vm.ready());
        assert!(!vm.checking());
    }

    #[tokio::test]
    async fn unrebuildable_vms_are_destroyed() {
        let (pool, stats) = broken_pool(true).await;
        pool.preload("origin_1").await.unwrap();

        let checker = VmChecker::new(pool.clone(), Duration::from_secs(3600));
        checker.fix_broken_vms().await;

        assert_eq!(pool.count(), 0);
        assert_eq!(stats.deleted.load(Ordering::SeqCst), 1);
    }
}
