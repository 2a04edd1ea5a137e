//! Core host types
//!
//! The fundamental types shared by the host crates and integrations:
//! [`EntityId`], [`State`], [`Platform`], plus the recurring timer helper
//! used by integrations that poll on a fixed interval.

mod entity_id;
pub mod interval;
mod platform;
mod state;

pub use entity_id::{EntityId, EntityIdError};
pub use interval::{track_time_interval, IntervalHandle};
pub use platform::Platform;
pub use state::{Attributes, State};
