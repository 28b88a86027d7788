//! # coppercli-core
//!
//! Data model, error types, and protocol scanner shared by the coppercli
//! machine control plane: the GRBL link layer, the workflow controllers, and
//! the serial-to-TCP proxy all build on these types.

pub mod cutting_path;
pub mod error;
pub mod event;
pub mod gcode_file;
pub mod geometry;
pub mod probe_grid;
pub mod scanner;
pub mod session;
pub mod status;

pub use cutting_path::CuttingPath;
pub use error::{Error, FirmwareError, ProtocolError, Result, TransportError, WorkflowError};
pub use event::EventDispatcher;
pub use gcode_file::GcodeFile;
pub use geometry::{Vector2, Vector3};
pub use probe_grid::{apply_probe_grid, ProbeGrid};
pub use session::Session;
pub use status::{ArcPlane, DistanceMode, DriverStatus, OperatingMode, Unit};
