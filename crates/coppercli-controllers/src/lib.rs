//! # coppercli-controllers
//!
//! `ControllerCore` (§4.4), the FSM chassis every workflow controller
//! embeds, plus the three concrete workflows built on it: `MillingController`
//! (§4.5), `ProbeController` (§4.6), and `ToolChangeController` (§4.7).

pub mod chassis;
pub mod config;
pub mod milling;
pub mod probe;
pub mod tool_change;
mod util;

pub use chassis::{ControllerCore, ControllerEvent, ControllerState, UserInputRequest};
pub use config::{MillingConfig, ProbeConfig, ToolChangeConfig};
pub use milling::{MillingController, MillingOptions, MillingPhase};
pub use probe::{ProbeController, ProbePhase};
pub use tool_change::{ToolChangeController, ToolChangePhase};

use coppercli_core::Vector3;

/// Emitted by `MillingController` on M6 detection, consumed by
/// `ToolChangeController::handle_tool_change` (§4.5 step 6, §4.7).
#[derive(Debug, Clone)]
pub struct ToolChangeRequest {
    pub tool_number: Option<u32>,
    pub tool_name: Option<String>,
    pub return_pos_work: Vector3,
    pub line_number: usize,
}
