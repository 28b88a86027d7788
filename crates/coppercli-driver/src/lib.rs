//! # coppercli-driver
//!
//! `GrblDriver` (§4.2): the GRBL protocol state machine. Owns the four
//! command queues and the single dedicated worker thread that holds the
//! link's read and write ends.

pub mod config;
pub mod driver;
pub mod events;
pub mod parse;
pub mod queues;
mod shared;
pub mod state;
mod worker;

pub use config::DriverConfig;
pub use driver::{DriverSnapshot, GrblDriver, OverrideChannel};
pub use events::DriverEvent;
pub use shared::LinkHealth;
pub use state::{Overrides, PinStates};
