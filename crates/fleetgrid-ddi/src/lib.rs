//! fleetgrid-ddi — the device-facing polling protocol.
//!
//! Devices poll their controller resource, fetch deployment or cancel
//! instructions, and report progress as feedback. [`DdiGateway`] turns each
//! of those requests into reads and transitions on the deployment state;
//! the JSON documents exchanged with devices live in [`wire`].
//!
//! Every document is returned together with a validator derived from the
//! state it was built from, so an HTTP layer can answer conditional
//! requests without serializing anything.

pub mod error;
pub mod etag;
pub mod gateway;
pub mod handling;
pub mod wire;

pub use error::{DdiError, DdiResult};
pub use gateway::{DdiGateway, Tagged};
pub use handling::{HandlingType, MaintenanceWindowStatus};
