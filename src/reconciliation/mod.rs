pub mod desk;
pub mod engine;
pub mod matcher;
pub mod scheduler;

pub use desk::ResolutionDesk;
pub use engine::{IngestReport, Reconciler, ReconcilerSettings, RunReport};
pub use scheduler::{ReconciliationScheduler, ScheduleConfig};
