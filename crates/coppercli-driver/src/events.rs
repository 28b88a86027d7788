//! The driver's flat observable-change event list (§4.2): one variant per
//! observable, plus connection/probe/diagnostic events.

use coppercli_core::{ArcPlane, DistanceMode, DriverStatus, OperatingMode, Unit, Vector3};

use crate::state::{Overrides, PinStates};

#[derive(Debug, Clone)]
pub enum DriverEvent {
    MachinePositionChanged(Vector3),
    WorkOffsetChanged(Vector3),
    StatusChanged(DriverStatus),
    ModeChanged(OperatingMode),
    DistanceModeChanged(DistanceMode),
    UnitChanged(Unit),
    ArcPlaneChanged(ArcPlane),
    BufferInUseChanged(usize),
    PinsChanged(PinStates),
    OverridesChanged(Overrides),
    FilePositionChanged(usize),
    TloChanged(f64),
    ProbeFinished {
        work_pos: Vector3,
        success: bool,
    },
    ConnectionStateChanged(bool),
    /// An informational protocol line the driver did not classify otherwise.
    Info(String),
    /// A non-fatal parse error, `error:<n>` response, or `ALARM:<n>`.
    Error(String),
}
