// Cron-driven scheduling of assignments with per-assignment single-flight

pub mod engine;

pub use engine::{cron_spec_for, normalize_cron, SchedulerEngine, SchedulerStatus};
