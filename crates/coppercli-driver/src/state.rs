//! Observable driver state (§3, §4.2). A `parking_lot::RwLock`-guarded
//! snapshot, mirroring `GrblCommunicator`'s synchronous state store so the
//! worker thread can publish without an async runtime in the loop.

use coppercli_core::{ArcPlane, DistanceMode, DriverStatus, OperatingMode, Unit, Vector3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PinStates {
    pub probe_touched: bool,
    pub limit_x: bool,
    pub limit_y: bool,
    pub limit_z: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overrides {
    pub feed: i32,
    pub rapid: i32,
    pub spindle: i32,
}

impl Default for Overrides {
    fn default() -> Self {
        Self {
            feed: 100,
            rapid: 100,
            spindle: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastProbe {
    pub machine_pos: Vector3,
    pub work_pos: Vector3,
    pub success: bool,
}

/// The full observable snapshot (§4.2).
#[derive(Debug, Clone)]
pub struct StateInner {
    pub machine_position: Vector3,
    pub work_offset: Vector3,
    pub status: DriverStatus,
    pub mode: OperatingMode,
    pub distance_mode: DistanceMode,
    pub unit: Unit,
    pub arc_plane: ArcPlane,
    pub buffer_in_use: usize,
    pub pins: PinStates,
    pub overrides: Overrides,
    pub file: Vec<String>,
    pub file_position: usize,
    pub pause_lines: Vec<bool>,
    pub tlo: f64,
    pub last_probe: Option<LastProbe>,
    pub connected: bool,
}

impl Default for StateInner {
    fn default() -> Self {
        Self {
            machine_position: Vector3::default(),
            work_offset: Vector3::default(),
            status: DriverStatus::Disconnected,
            mode: OperatingMode::Disconnected,
            distance_mode: DistanceMode::Absolute,
            unit: Unit::Metric,
            arc_plane: ArcPlane::Xy,
            buffer_in_use: 0,
            pins: PinStates::default(),
            overrides: Overrides::default(),
            file: Vec::new(),
            file_position: 0,
            pause_lines: Vec::new(),
            tlo: 0.0,
            last_probe: None,
            connected: false,
        }
    }
}

impl StateInner {
    /// `WorkPosition = MachinePosition - WorkOffset` (§4.2).
    pub fn work_position(&self) -> Vector3 {
        self.machine_position.sub(&self.work_offset)
    }
}
