//! Delivery dispatch.
//!
//! - [`Dispatcher`]: live publish per record, offline routing of whatever failed
//! - [`DrainLoop`]: continuous drain of the offline queue with its own backoff
//! - [`DrainTrigger`]: event-driven wake-up for the drain loop
//! - [`DeliveryMetrics`]: counters surfaced through the status sink

mod dispatcher;
mod drain;
mod metrics;
mod trigger;

pub use dispatcher::{Dispatch, Dispatcher};
pub use drain::{CycleOutcome, DrainCycle, DrainLoop};
pub use metrics::{DeliveryMetrics, MetricsSnapshot};
pub use trigger::DrainTrigger;
