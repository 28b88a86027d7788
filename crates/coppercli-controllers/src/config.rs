//! Tunables for the three workflow controllers, grounded in the named
//! constants of spec §4.5–§4.7 (`MillStartSafetyZ`, `MillCompleteZ`,
//! `ClearanceZ`, grid margins, `XAxisWeight`, `SlowProbeThreshold`, tool
//! setter geometry).

use std::time::Duration;

use coppercli_core::Vector2;

#[derive(Debug, Clone)]
pub struct MillingConfig {
    /// Machine-Z the safety retract targets before streaming starts.
    pub mill_start_safety_z: f64,
    /// Machine-Z commanded once the file finishes streaming, before
    /// `safe_completion`.
    pub mill_complete_z: f64,
    /// Machine-Z the cleanup path retracts to on any exit.
    pub clearance_z: f64,
    pub homing_timeout: Duration,
    /// How long `Idle` must hold continuously to declare settling or
    /// completion.
    pub idle_settle: Duration,
    /// Consecutive one-second `Idle` observations required to leave
    /// `Settling` (§4.5 step 1; default 5).
    pub settle_observations: u32,
    pub settle_interval: Duration,
    /// Work-Z below this adds the current XY to `CuttingPath` (§4.5 step 6).
    pub cutting_depth_threshold: f64,
    /// Lines searched backward from an M6 line for a `T<n>`/tool comment.
    pub tool_info_search_lines: usize,
}

impl Default for MillingConfig {
    fn default() -> Self {
        Self {
            mill_start_safety_z: -1.0,
            mill_complete_z: -5.0,
            clearance_z: -1.0,
            homing_timeout: Duration::from_secs(60),
            idle_settle: Duration::from_secs(1),
            settle_observations: 5,
            settle_interval: Duration::from_secs(1),
            cutting_depth_threshold: 0.1,
            tool_info_search_lines: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Work-Z used when rapiding between outline corners.
    pub trace_height: f64,
    /// Work-Z the probe retracts to after each point / on completion.
    pub safe_height: f64,
    /// Floor under which a successful probe's retract height never falls.
    pub minimum_height: f64,
    /// `G38.3 Z-<max_probe_depth>` seek distance.
    pub max_probe_depth: f64,
    pub probe_feed: f64,
    /// Weight applied to the X component of the nearest-neighbor distance
    /// (§4.6: `~1` approximates a serpentine, large values force row-major).
    pub x_axis_weight: f64,
    pub abort_on_fail: bool,
    /// A probe exceeding `avg * threshold` of the last 10 pauses the
    /// controller; `0` disables the watchdog.
    pub slow_probe_threshold: f64,
    pub mill_start_safety_z: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            trace_height: 5.0,
            safe_height: 5.0,
            minimum_height: 1.0,
            max_probe_depth: 5.0,
            probe_feed: 50.0,
            x_axis_weight: 1.0,
            abort_on_fail: true,
            slow_probe_threshold: 1.2,
            mill_start_safety_z: -1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolChangeConfig {
    pub has_tool_setter: bool,
    /// Fixed tool-setter XY, machine coordinates (Mode A only).
    pub tool_setter_xy: Vector2,
    /// Machine-Z the cleanup/return path raises to.
    pub clearance_z: f64,
    /// Extra Z clearance above a remembered tool-setter Z before probing
    /// again (§4.7 reference measurement).
    pub approach_clearance: f64,
    pub fast_feed: f64,
    pub slow_feed: f64,
    /// `G38.3` seek depth for the fast probe.
    pub probe_depth: f64,
    /// Distance retracted between the fast seek and the slow probe.
    pub retract: f64,
    /// Fixed point to present for user tool access; falls back to the
    /// return position captured at the start of the tool change.
    pub work_area_center: Option<Vector2>,
}

impl Default for ToolChangeConfig {
    fn default() -> Self {
        Self {
            has_tool_setter: false,
            tool_setter_xy: Vector2::new(0.0, 0.0),
            clearance_z: -1.0,
            approach_clearance: 5.0,
            fast_feed: 200.0,
            slow_feed: 30.0,
            probe_depth: 15.0,
            retract: 2.0,
            work_area_center: None,
        }
    }
}
