use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::NodeShared;
use crate::store::now_millis;
use crate::task::spawn_guarded;

/// Periodically retires leases whose holders stopped renewing them
///
/// Reclamation lags a job's timeout by up to one sweep period.
pub struct LeaseSweeper;

impl LeaseSweeper {
    pub fn spawn(shared: Arc<NodeShared>) -> tokio::task::JoinHandle<()> {
        let flag = shared.is_node_shutting_down.clone();
        spawn_guarded("lease-sweeper", flag, Self::run(shared))
    }

    async fn run(shared: Arc<NodeShared>) {
        let _guard = scopeguard::guard((), |_| {
            info!("LeaseSweeper is done");
        });
        let mut ticker = interval(shared.params.lease_sweep_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !shared.is_node_shutting_down() {
            // bound by a timeout, so we notice shutdown in a reasonable time
            if timeout(Duration::from_millis(500), ticker.tick())
                .await
                .is_err()
            {
                continue;
            }

            let is_leader = shared.state().is_leader();
            if !is_leader {
                debug!("No longer leading, stopping sweeps");
                return;
            }

            match shared.jobs.reclaim_expired(now_millis()).await {
                Ok(0) => trace!("No expired leases"),
                Ok(reclaimed) => info!(reclaimed, "Reclaimed expired leases"),
                Err(e) => warn!(error = %e, "Lease sweep failed"),
            }
        }
    }
}
