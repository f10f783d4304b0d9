// Settlement Scheduler - background cadence for the engine
//
// Two independent timers:
// - the sweep interval drives `run_sweep` for due bookings
// - the poll interval drives provider reconciliation for pending transfers
//
// Both tick on their own schedule inside one spawned task; a failing cycle
// is logged and the next tick proceeds normally.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::reconcile::Reconciler;
use crate::settlement::sweep::{SettlementEngine, SweepStatus};

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub sweep_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),
            poll_interval: Duration::from_secs(60),
        }
    }
}

pub struct SettlementScheduler {
    config: ScheduleConfig,
    engine: Arc<SettlementEngine>,
    reconciler: Arc<Reconciler>,
}

impl SettlementScheduler {
    pub fn new(
        config: ScheduleConfig,
        engine: Arc<SettlementEngine>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            config,
            engine,
            reconciler,
        }
    }

    /// Start the scheduler (runs in background).
    pub fn start(&self) -> JoinHandle<()> {
        let config = self.config.clone();
        let engine = self.engine.clone();
        let reconciler = self.reconciler.clone();

        tokio::spawn(async move {
            info!(
                sweep_interval_secs = config.sweep_interval.as_secs(),
                poll_interval_secs = config.poll_interval.as_secs(),
                "Settlement scheduler started"
            );

            let mut sweep_tick = interval(config.sweep_interval);
            let mut poll_tick = interval(config.poll_interval);
            // A long sweep should not cause a burst of catch-up sweeps.
            sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            poll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = sweep_tick.tick() => {
                        match engine.run_sweep().await {
                            Ok(report) if report.status == SweepStatus::SkippedAlreadyRunning => {}
                            Ok(report) if report.processed > 0 => {
                                info!(
                                    processed = report.processed,
                                    succeeded = report.succeeded,
                                    failed = report.failed,
                                    pending = report.pending,
                                    "Scheduled sweep completed"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "Scheduled sweep failed"),
                        }
                    }
                    _ = poll_tick.tick() => {
                        if let Err(e) = reconciler.poll_pending().await {
                            error!(error = %e, "Reconciliation poll failed");
                        }
                    }
                }
            }
        })
    }
}
