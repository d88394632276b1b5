use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::pool::VmPool;

/// Background warm-up: keeps the configured number of preloaded VMs per
/// platform. One VM per tick, so the loop stays responsive to shutdown and
/// never bursts enough to starve on-demand admissions.
pub struct Preloader {
    pool: Arc<VmPool>,
    frequency: Duration,
}

impl Preloader {
    pub fn new(pool: Arc<VmPool>, frequency: Duration) -> Self {
        Self { pool, frequency }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.frequency);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick().await,
                    _ = shutdown.changed() => break,
                }
            }
            log::info!("preloader stopped");
        })
    }

    async fn tick(&self) {
        if self.pool.can_produce() == 0 {
            return;
        }
        if let Some(platform) = self.need_load() {
            log::info!("preloading vm for platform {platform}");
            if let Err(e) = self.pool.preload(&platform).await {
                log::error!("preloading {platform} failed: {e}");
            }
        }
    }

    /// First platform whose preloaded population (ready or in use) is below
    /// its configured target.
    fn need_load(&self) -> Option<String> {
        let targets = self.pool.preload_targets();
        let have = self.pool.preloaded_counts();
        need_load(&targets, &have)
    }
}

fn need_load(
    targets: &HashMap<String, usize>,
    have: &HashMap<String, usize>,
) -> Option<String> {
    let mut names: Vec<&String> = targets.keys().collect();
    names.sort();
    for name in names {
        let need = targets[name];
        let current = have.get(name).copied().unwrap_or(0);
        if need > current {
            return Some(name.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, usize)]) -> HashMap<String, usize> {
        entries
            .iter()
            .map(|(name, count)| (name.to_string(), *count))
            .collect()
    }

    #[test]
    fn picks_first_underfilled_platform() {
        let targets = map(&[("origin_1", 2), ("origin_2", 1)]);

        assert_eq!(
            need_load(&targets, &map(&[])),
            Some("origin_1".to_string())
        );
        assert_eq!(
            need_load(&targets, &map(&[("origin_1", 2)])),
            Some("origin_2".to_string())
        );
        assert_eq!(
            need_load(&targets, &map(&[("origin_1", 2), ("origin_2", 1)])),
            None
        );
    }

    #[test]
    fn overfilled_platforms_do_not_go_negative() {
        let targets = map(&[("origin_1", 1)]);
        assert_eq!(need_load(&targets, &map(&[("origin_1", 3)])), None);
    }
}
