//! Shared building blocks for the Vane controller crates.

pub mod clock;
pub mod config;
pub mod duration;
pub mod hash;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::VaneConfig;
pub use duration::{DurationError, parse_duration};
pub use hash::{canonical_json, template_hash};
