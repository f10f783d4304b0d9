pub mod scheduler;
pub mod sweep;

pub use scheduler::{ScheduleConfig, SettlementScheduler};
pub use sweep::{SettlementEngine, SweepConfig, SweepReport, SweepStatus, SWEEP_JOB_NAME};
