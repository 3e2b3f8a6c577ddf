//! modelgrid-reconcile — keeps placement records honest.
//!
//! The elected leader periodically asks every node what it actually runs
//! and corrects the durable artifact and task records to match.
//!
//! # Architecture
//!
//! ```text
//! ReconcileService (leader only, follows membership + settings)
//!   └── schedule_recurring(interval)
//!       └── ReconciliationLoop.run_once (single-flight)
//!           ├── ReportState → every live node
//!           ├── Correct(hosting, tasks) → every live node
//!           ├── decide() per artifact → one batched write
//!           └── finalize tasks nobody runs after the grace window
//! ```

pub mod error;
pub mod scheduler;
pub mod service;
pub mod sweep;

pub use error::{ReconcileError, ReconcileResult};
pub use scheduler::{Job, ScheduleHandle, schedule_recurring};
pub use service::ReconcileService;
pub use sweep::{ClusterSnapshot, ReconciliationLoop, SweepOutcome, SweepReport, decide};
