use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::Sessions;

/// How often the reaper looks at active sessions.
const REAP_FREQUENCY: Duration = Duration::from_secs(1);

/// Background reaper: times out idle sessions and finalizes sessions whose
/// VM died underneath them.
pub struct SessionWorker {
    sessions: Arc<Sessions>,
}

impl SessionWorker {
    pub fn new(sessions: Arc<Sessions>) -> Self {
        Self { sessions }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_FREQUENCY);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sessions.reap_idle().await,
                    _ = shutdown.changed() => break,
                }
            }
            log::info!("session worker stopped");
        })
    }
}
