//! fleetgrid-maintenance — maintenance window evaluation.
//!
//! A maintenance window is a recurring interval during which a device may
//! install an update. It is described by a cron expression with six
//! mandatory fields (second, minute, hour, day-of-month, month, weekday)
//! and an optional year, a window duration, and a fixed UTC offset in which
//! the cron expression is interpreted.
//!
//! Everything here is a pure function of the schedule and `now`; nothing is
//! cached between calls.

pub mod window;

pub use window::{MaintenanceWindow, WindowError, WindowEvaluator};
