//! Clock/Tick Scheduler
//!
//! Produces exactly one [`TelemetryRecord`](crate::telemetry::TelemetryRecord)
//! per fixed period against a monotonic clock. After a stall, up to
//! `catch_up_cap` missed ticks are executed live back-to-back; older ones are
//! emitted as synthesized `missed_tick` placeholders so sequence numbers stay
//! gap-free.

mod sink;
mod ticker;

pub use sink::RecordSink;
pub use ticker::{CatchUpPlan, TickReport, TickScheduler};
