//! `GrblDriver` (§4.2): the public command surface and observable-state
//! accessor. All methods are idempotent and safe to call from any thread;
//! the worker thread (see [`crate::worker`]) does the actual I/O.

use std::sync::Arc;

use coppercli_core::{
    scanner, ArcPlane, DistanceMode, DriverStatus, Error, GcodeFile, OperatingMode, Unit, Vector3,
    WorkflowError,
};
use coppercli_link::{Link, SerialParams, TcpParams};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::DriverConfig;
use crate::events::DriverEvent;
use crate::queues::{
    CMD_CYCLE_START, CMD_FEED_HOLD, CMD_FEED_OV_DEC_10, CMD_FEED_OV_INC_10, CMD_FEED_OV_RESET,
    CMD_JOG_CANCEL, CMD_RAPID_OV_FULL, CMD_RAPID_OV_HALF, CMD_RAPID_OV_QUARTER, CMD_SOFT_RESET,
    CMD_SPINDLE_OV_DEC_10, CMD_SPINDLE_OV_INC_10, CMD_SPINDLE_OV_RESET,
};
use crate::shared::{LinkHealth, Shared};
use crate::state::{Overrides, PinStates, StateInner};

/// Which override channel a command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideChannel {
    Feed,
    Rapid,
    Spindle,
}

/// A snapshot of all driver observable state (§4.2), cheap to clone.
#[derive(Debug, Clone)]
pub struct DriverSnapshot {
    pub machine_position: Vector3,
    pub work_position: Vector3,
    pub work_offset: Vector3,
    pub status: DriverStatus,
    pub mode: OperatingMode,
    pub distance_mode: DistanceMode,
    pub unit: Unit,
    pub arc_plane: ArcPlane,
    pub buffer_in_use: usize,
    pub pins: PinStates,
    pub overrides: Overrides,
    pub file_position: usize,
    pub file_len: usize,
    pub tlo: f64,
    pub connected: bool,
}

impl From<&StateInner> for DriverSnapshot {
    fn from(s: &StateInner) -> Self {
        Self {
            machine_position: s.machine_position,
            work_position: s.work_position(),
            work_offset: s.work_offset,
            status: s.status.clone(),
            mode: s.mode,
            distance_mode: s.distance_mode,
            unit: s.unit,
            arc_plane: s.arc_plane,
            buffer_in_use: s.buffer_in_use,
            pins: s.pins,
            overrides: s.overrides,
            file_position: s.file_position,
            file_len: s.file.len(),
            tlo: s.tlo,
            connected: s.connected,
        }
    }
}

pub struct GrblDriver {
    shared: Arc<Shared>,
    worker: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl GrblDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
            worker: std::sync::Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.shared.events.subscribe()
    }

    pub fn snapshot(&self) -> DriverSnapshot {
        DriverSnapshot::from(&*self.shared.state.read())
    }

    pub fn link_health(&self) -> LinkHealth {
        self.shared.link_health()
    }

    fn start_worker(&self, link: Link) {
        *self.shared.link.lock() = Some(link);
        *self.shared.cancel.lock() = Some(CancellationToken::new());
        {
            let mut state = self.shared.state.write();
            state.connected = true;
            state.mode = OperatingMode::Manual;
            state.status = DriverStatus::Idle;
        }
        self.shared
            .events
            .publish(DriverEvent::ConnectionStateChanged(true))
            .ok();

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::spawn(move || crate::worker::run(shared));
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Connect over serial. Idempotent: a second call while already
    /// connected tears down the prior link first.
    pub fn connect_serial(&self, params: SerialParams) -> Result<(), Error> {
        self.disconnect();
        let link = Link::open_serial(&params)?;
        self.start_worker(link);
        Ok(())
    }

    /// Connect over TCP. Idempotent: a second call while already connected
    /// tears down the prior link first.
    pub fn connect_tcp(&self, params: TcpParams) -> Result<(), Error> {
        self.disconnect();
        let link = Link::open_tcp(&params)?;
        self.start_worker(link);
        Ok(())
    }

    /// Connect over an already-constructed link. Exposed for tests and for
    /// callers that built the link themselves (e.g. `MockStream`-backed
    /// links in downstream crates' test suites).
    pub fn connect_with(&self, link: Link) {
        self.disconnect();
        self.start_worker(link);
    }

    /// Tear down the worker and release the link. Idempotent.
    pub fn disconnect(&self) {
        if let Some(ct) = self.shared.cancel.lock().take() {
            ct.cancel();
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            info!("joining driver worker thread");
            let _ = handle.join();
        }
    }

    /// Enqueue a line to the normal send queue. Accepted only in `Manual`
    /// or `Probe` mode.
    pub fn send_line(&self, line: impl Into<String>) -> Result<(), Error> {
        let mode = self.shared.state.read().mode;
        if !matches!(mode, OperatingMode::Manual | OperatingMode::Probe) {
            return Err(WorkflowError::PreconditionViolated {
                reason: format!("send_line not accepted in {mode:?} mode"),
            }
            .into());
        }
        self.shared.queues.push_normal(line.into());
        Ok(())
    }

    /// Enqueue macro lines. Accepted only in `Manual`; switches mode to
    /// `SendMacro`.
    pub fn send_macro_lines(&self, lines: Vec<String>) -> Result<(), Error> {
        let mut state = self.shared.state.write();
        if state.mode != OperatingMode::Manual {
            return Err(WorkflowError::PreconditionViolated {
                reason: format!("send_macro_lines not accepted in {:?} mode", state.mode),
            }
            .into());
        }
        state.mode = OperatingMode::SendMacro;
        drop(state);
        self.shared.queues.push_macro_lines(lines);
        self.shared
            .events
            .publish(DriverEvent::ModeChanged(OperatingMode::SendMacro))
            .ok();
        Ok(())
    }

    /// Load a file's lines, computing `PauseLines` via `GcodeFile`. Only
    /// outside `SendFile`.
    pub fn set_file(&self, lines: Vec<String>) -> Result<(), Error> {
        let mut state = self.shared.state.write();
        if state.mode == OperatingMode::SendFile {
            return Err(WorkflowError::PreconditionViolated {
                reason: "cannot set_file while streaming".into(),
            }
            .into());
        }
        let gcode_file = GcodeFile::new("driver-file.nc", lines.clone());
        state.pause_lines = gcode_file.pause_lines.clone();
        state.file = lines;
        state.file_position = 0;
        Ok(())
    }

    /// Clear the loaded file. Only outside `SendFile`.
    pub fn clear_file(&self) -> Result<(), Error> {
        let mut state = self.shared.state.write();
        if state.mode == OperatingMode::SendFile {
            return Err(WorkflowError::PreconditionViolated {
                reason: "cannot clear_file while streaming".into(),
            }
            .into());
        }
        state.file.clear();
        state.file_position = 0;
        state.pause_lines.clear();
        Ok(())
    }

    pub fn file_start(&self) -> Result<(), Error> {
        let mut state = self.shared.state.write();
        if state.file.is_empty() {
            return Err(WorkflowError::PreconditionViolated {
                reason: "no file loaded".into(),
            }
            .into());
        }
        state.mode = OperatingMode::SendFile;
        drop(state);
        self.shared
            .events
            .publish(DriverEvent::ModeChanged(OperatingMode::SendFile))
            .ok();
        Ok(())
    }

    pub fn file_pause(&self) {
        let mut state = self.shared.state.write();
        if state.mode == OperatingMode::SendFile {
            state.mode = OperatingMode::Manual;
            drop(state);
            self.shared
                .events
                .publish(DriverEvent::ModeChanged(OperatingMode::Manual))
                .ok();
        }
    }

    pub fn file_goto(&self, line: usize) -> Result<(), Error> {
        let mut state = self.shared.state.write();
        if line > state.file.len() {
            return Err(WorkflowError::PreconditionViolated {
                reason: format!("line {line} is beyond end of file"),
            }
            .into());
        }
        state.file_position = line;
        drop(state);
        self.shared
            .events
            .publish(DriverEvent::FilePositionChanged(line))
            .ok();
        Ok(())
    }

    pub fn probe_start(&self) -> Result<(), Error> {
        let mut state = self.shared.state.write();
        if state.mode != OperatingMode::Manual {
            return Err(WorkflowError::PreconditionViolated {
                reason: format!("probe_start not accepted in {:?} mode", state.mode),
            }
            .into());
        }
        state.mode = OperatingMode::Probe;
        drop(state);
        self.shared
            .events
            .publish(DriverEvent::ModeChanged(OperatingMode::Probe))
            .ok();
        Ok(())
    }

    pub fn probe_stop(&self) {
        let mut state = self.shared.state.write();
        if state.mode == OperatingMode::Probe {
            state.mode = OperatingMode::Manual;
            drop(state);
            self.shared
                .events
                .publish(DriverEvent::ModeChanged(OperatingMode::Manual))
                .ok();
        }
    }

    pub fn soft_reset(&self) {
        self.shared.queues.push_priority(CMD_SOFT_RESET);
    }

    pub fn feed_hold(&self) {
        self.shared.queues.push_priority(CMD_FEED_HOLD);
    }

    pub fn cycle_start(&self) {
        self.shared.queues.push_priority(CMD_CYCLE_START);
    }

    pub fn jog_cancel(&self) {
        self.shared.queues.push_priority(CMD_JOG_CANCEL);
    }

    /// `jog(axis, distance, feed)`: enqueues `$J=G91 F<feed> <axis><distance>`.
    pub fn jog(&self, axis: char, distance: f64, feed: f64) -> Result<(), Error> {
        let line = format!("$J=G91 F{feed} {}{distance}", axis.to_ascii_uppercase());
        self.send_line(line)
    }

    pub fn override_increment(&self, channel: OverrideChannel) {
        let byte = match channel {
            OverrideChannel::Feed => CMD_FEED_OV_INC_10,
            OverrideChannel::Rapid => CMD_RAPID_OV_FULL,
            OverrideChannel::Spindle => CMD_SPINDLE_OV_INC_10,
        };
        self.shared.queues.push_priority(byte);
    }

    pub fn override_decrement(&self, channel: OverrideChannel) {
        let byte = match channel {
            OverrideChannel::Feed => CMD_FEED_OV_DEC_10,
            OverrideChannel::Rapid => CMD_RAPID_OV_QUARTER,
            OverrideChannel::Spindle => CMD_SPINDLE_OV_DEC_10,
        };
        self.shared.queues.push_priority(byte);
    }

    pub fn override_reset(&self, channel: OverrideChannel) {
        let byte = match channel {
            OverrideChannel::Feed => CMD_FEED_OV_RESET,
            OverrideChannel::Rapid => CMD_RAPID_OV_HALF,
            OverrideChannel::Spindle => CMD_SPINDLE_OV_RESET,
        };
        self.shared.queues.push_priority(byte);
    }

    /// Tool-number and comment extraction for an M6 line, for controllers
    /// that want to surface `ToolChangeInfo` without re-scanning themselves.
    pub fn scan_tool_change(&self, line: &str) -> Option<Option<u32>> {
        scanner::scan_m6(line)
    }

    /// The file line at `index`, if loaded. Lets `MillingController`
    /// inspect the streamed file (M6/M0 detection, tool comment search)
    /// without duplicating it outside the driver's owned state.
    pub fn file_line(&self, index: usize) -> Option<String> {
        self.shared.state.read().file.get(index).cloned()
    }
}

impl Drop for GrblDriver {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coppercli_link::MockStream;
    use std::time::Duration;

    #[test]
    fn open_serial_rejects_empty_port() {
        let err = Link::open_serial(&SerialParams {
            port: String::new(),
            baud_rate: 115200,
            dtr: true,
            timeout: Duration::from_millis(50),
        })
        .unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn send_line_rejected_before_connect() {
        let driver = GrblDriver::new(DriverConfig::default());
        let err = driver.send_line("G0 X0").unwrap_err();
        assert!(matches!(err, Error::Workflow(WorkflowError::PreconditionViolated { .. })));
    }

    #[test]
    fn set_file_computes_pause_lines() {
        let driver = GrblDriver::new(DriverConfig::default());
        driver
            .set_file(vec!["G90".into(), "M0".into(), "G0 X1".into()])
            .unwrap();
        assert_eq!(driver.shared.state.read().pause_lines, vec![false, true, false]);
    }

    #[test]
    fn connect_and_disconnect_flip_connected_state() {
        let driver = GrblDriver::new(DriverConfig {
            status_poll_interval: Duration::from_secs(60),
            read_timeout: Duration::from_millis(10),
            worker_sleep: Duration::from_millis(1),
            ..DriverConfig::default()
        });
        driver.connect_with(Link::from_mock(MockStream::new()));
        std::thread::sleep(Duration::from_millis(50));
        assert!(driver.snapshot().connected);

        driver.disconnect();
        assert!(!driver.snapshot().connected);
    }
}
