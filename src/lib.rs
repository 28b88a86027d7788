//! # coppercli
//!
//! A GRBL machine-control plane for PCB milling, organized as a workspace of
//! single-purpose crates:
//!
//! 1. **coppercli-core** - shared types, errors, events, G-code scanning, probe grids
//! 2. **coppercli-link** - serial/TCP transport
//! 3. **coppercli-driver** - `GrblDriver`: status polling, command queueing, state tracking
//! 4. **coppercli-wait** - `MachineWait`: composable waits over driver state
//! 5. **coppercli-controllers** - milling/probing/tool-change workflow state machines
//! 6. **coppercli-proxy** - `SerialProxy`: single-client TCP-to-serial bridge
//! 7. **coppercli** - this crate: configuration and composition root
//!
//! ## Features
//!
//! - Serial and TCP connectivity to GRBL 1.1-family controllers
//! - Streaming file milling with tool-change and pause/resume support
//! - Height-map probing with nearest-neighbor scheduling and slow-probe detection
//! - Automated tool-change workflows (touch-plate or manual)
//! - An independent serial-to-TCP bridge for remote GRBL clients

#![allow(dead_code)]

pub mod config;

pub use coppercli_core::{
    Error, EventDispatcher, ProbeGrid, Result,
};
pub use coppercli_driver::{DriverEvent, DriverSnapshot, GrblDriver};
pub use coppercli_wait::MachineWait;
pub use coppercli_controllers::{
    ControllerCore, ControllerState, MillingController, MillingOptions, ProbeController,
    ToolChangeController, ToolChangeRequest,
};
pub use coppercli_proxy::{ProxyConfig, ProxyEvent, SerialProxy};

pub use config::{Config, SettingsManager};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time by build.rs).
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize structured logging.
///
/// Sets up console output with pretty formatting, `RUST_LOG` environment
/// variable support, and thread/line annotations.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true)
        .pretty();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}
