pub mod config;
pub mod duration;
pub mod error;

pub use config::{FleetConfig, SchedulerConfig, ServerConfig, TenantConfig};
pub use duration::{format_hms, parse_hms, DurationError};
pub use error::ErrorKind;
