//! The single dedicated worker thread per driver (§4.2): holds both ends of
//! the link, performs the five-step iteration in strict order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use coppercli_core::scanner::scan_probe_report;
use coppercli_core::{OperatingMode, Vector3};
use tracing::{debug, info, trace, warn};

use crate::events::DriverEvent;
use crate::parse::{parse_gcode_state, parse_status, reports_work_position};
use crate::queues::CMD_QUERY_STATUS;
use crate::shared::Shared;
use crate::state::{Overrides, PinStates};

/// Absorb stale bytes left by a controller that was mid-line when the link
/// was last closed (§3 supplemental: startup pre-amble), grounded in the
/// `dacha` reference driver's `serial_writer_thread` preamble.
fn startup_preamble(shared: &Shared) {
    if let Some(link) = shared.link.lock().as_ref() {
        let _ = link.write_bytes(b"\r\n\r\n");
    }
    std::thread::sleep(Duration::from_millis(100));
    // Drain whatever the preamble provoked without interpreting it.
    if let Some(link) = shared.link.lock().as_ref() {
        while let Ok(Some(_)) = link.read_line(Duration::from_millis(20)) {}
    }
}

pub fn run(shared: Arc<Shared>) {
    startup_preamble(&shared);
    *shared.connected_at.write() = Some(Instant::now());

    let mut last_poll = Instant::now() - shared.config.status_poll_interval;

    loop {
        let cancelled = match shared.cancel.lock().as_ref() {
            Some(ct) => ct.is_cancelled(),
            None => true,
        };
        if cancelled {
            break;
        }

        if !drain_priority(&shared) {
            break;
        }

        dispatch_next_line(&shared);

        if last_poll.elapsed() >= shared.config.status_poll_interval {
            if write_byte(&shared, CMD_QUERY_STATUS).is_err() {
                break;
            }
            last_poll = Instant::now();
        }

        match read_one_line(&shared) {
            Ok(Some(line)) => handle_line(&shared, &line),
            Ok(None) => {}
            Err(WorkerIoError::Eof) => break,
            Err(WorkerIoError::Fatal) => break,
        }

        std::thread::sleep(shared.config.worker_sleep);
    }

    teardown(&shared);
}

enum WorkerIoError {
    Eof,
    Fatal,
}

fn write_byte(shared: &Shared, byte: u8) -> Result<(), ()> {
    let guard = shared.link.lock();
    match guard.as_ref() {
        Some(link) => link.write_bytes(&[byte]).map_err(|_| ()),
        None => Err(()),
    }
}

fn drain_priority(shared: &Shared) -> bool {
    for byte in shared.queues.drain_priority() {
        if write_byte(shared, byte).is_err() {
            return false;
        }
    }
    true
}

fn read_one_line(shared: &Shared) -> Result<Option<String>, WorkerIoError> {
    let guard = shared.link.lock();
    let link = match guard.as_ref() {
        Some(link) => link,
        None => return Err(WorkerIoError::Fatal),
    };
    match link.read_line(shared.config.read_timeout) {
        Ok(Some(line)) => Ok(Some(line)),
        Ok(None) => {
            if link.is_closed() {
                Err(WorkerIoError::Eof)
            } else {
                Ok(None)
            }
        }
        Err(_) => Err(WorkerIoError::Fatal),
    }
}

/// Step 2: choose and dispatch the next line per current `Mode` (§4.2). Each
/// `take_*_line` helper checks buffer room *before* mutating any queue or
/// mode state, so a line that doesn't fit is left exactly as it was found —
/// no state to roll back on the next iteration.
fn dispatch_next_line(shared: &Shared) {
    let mode = shared.state.read().mode;
    let available = shared.config.controller_buffer_size - shared.state.read().buffer_in_use;

    let line = match mode {
        OperatingMode::SendFile => take_file_line(shared, available),
        OperatingMode::SendMacro => take_macro_line(shared, available),
        OperatingMode::Disconnected => None,
        OperatingMode::Manual | OperatingMode::Probe => take_normal_line(shared, available),
    };

    let Some(trimmed) = line else { return };

    if write_bytes(shared, format!("{trimmed}\n").as_bytes()).is_err() {
        return;
    }

    {
        let mut state = shared.state.write();
        state.buffer_in_use += trimmed.len() + 1;
    }
    shared.queues.sent.lock().push_back(trimmed);
}

fn take_normal_line(shared: &Shared, available: usize) -> Option<String> {
    let mut normal = shared.queues.normal.lock();
    let trimmed = normal.front()?.trim().to_string();
    if trimmed.len() + 1 > available {
        return None;
    }
    normal.pop_front();
    Some(trimmed)
}

fn take_file_line(shared: &Shared, available: usize) -> Option<String> {
    let index = {
        let state = shared.state.read();
        if state.file_position >= state.file.len() {
            return None;
        }
        state.file_position
    };
    let trimmed = {
        let state = shared.state.read();
        state.file[index].trim().to_string()
    };
    if trimmed.len() + 1 > available {
        return None;
    }

    let mut state = shared.state.write();
    let paused = state.pause_lines.get(index).copied().unwrap_or(false);
    state.file_position = index + 1;
    let finished = state.file_position == state.file.len();
    if paused || finished {
        state.mode = OperatingMode::Manual;
    }
    drop(state);
    shared
        .events
        .publish(DriverEvent::FilePositionChanged(index + 1))
        .ok();
    if paused || finished {
        shared
            .events
            .publish(DriverEvent::ModeChanged(OperatingMode::Manual))
            .ok();
    }
    Some(trimmed)
}

/// Macro dispatch honors the "acknowledge single-shot" discipline: one line
/// only when `Idle`, `bufferInUse == 0`, and a status report has been seen
/// since the last macro line (§4.2).
fn take_macro_line(shared: &Shared, available: usize) -> Option<String> {
    let ready = {
        let state = shared.state.read();
        state.status.is_idle() && state.buffer_in_use == 0
    };
    if !ready {
        return None;
    }
    let mut awaiting = shared.macro_awaiting_ack.lock();
    if *awaiting {
        return None;
    }

    let trimmed = {
        let macro_lines = shared.queues.macro_lines.lock();
        macro_lines.front()?.trim().to_string()
    };
    if trimmed.len() + 1 > available {
        return None;
    }

    let mut macro_lines = shared.queues.macro_lines.lock();
    macro_lines.pop_front();
    let emptied = macro_lines.is_empty();
    drop(macro_lines);
    if emptied {
        let mut state = shared.state.write();
        state.mode = OperatingMode::Manual;
        drop(state);
        shared
            .events
            .publish(DriverEvent::ModeChanged(OperatingMode::Manual))
            .ok();
    }
    *awaiting = true;
    Some(trimmed)
}

fn write_bytes(shared: &Shared, bytes: &[u8]) -> Result<(), ()> {
    let guard = shared.link.lock();
    match guard.as_ref() {
        Some(link) => link.write_bytes(bytes).map_err(|_| ()),
        None => Err(()),
    }
}

fn handle_line(shared: &Shared, line: &str) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }

    *shared.macro_awaiting_ack.lock() = false;

    if trimmed == "ok" {
        on_ok(shared);
        return;
    }
    if let Some(rest) = trimmed.strip_prefix("error:") {
        on_error(shared, rest);
        return;
    }
    if let Some(rest) = trimmed.strip_prefix("ALARM:") {
        on_alarm(shared, rest);
        return;
    }
    if trimmed.starts_with("Grbl v") || trimmed.starts_with("Grbl ") {
        on_banner(shared, trimmed);
        return;
    }
    if trimmed.starts_with('<') {
        on_status(shared, trimmed);
        return;
    }
    if trimmed.starts_with('[') {
        on_bracketed(shared, trimmed);
        return;
    }

    trace!(line = trimmed, "unclassified protocol line");
    shared.events.publish(DriverEvent::Info(trimmed.to_string())).ok();
}

fn on_ok(shared: &Shared) {
    let popped = shared.queues.sent.lock().pop_front();
    match popped {
        Some(sent) => {
            let mut state = shared.state.write();
            state.buffer_in_use = state.buffer_in_use.saturating_sub(sent.len() + 1);
        }
        None => {
            let within_grace = shared
                .connected_at
                .read()
                .map(|t| t.elapsed() < shared.config.unsolicited_ok_grace)
                .unwrap_or(true);
            if !within_grace {
                warn!("ok with empty sent queue after grace window; resetting buffer accounting");
                shared.state.write().buffer_in_use = 0;
            }
        }
    }
}

fn on_error(shared: &Shared, rest: &str) {
    shared.queues.sent.lock().pop_front();
    shared.state.write().mode = OperatingMode::Manual;
    shared
        .events
        .publish(DriverEvent::ModeChanged(OperatingMode::Manual))
        .ok();
    shared
        .events
        .publish(DriverEvent::Error(format!("error:{rest}")))
        .ok();
}

fn on_alarm(shared: &Shared, rest: &str) {
    shared.queues.clear_normal_and_macro();
    shared.state.write().mode = OperatingMode::Manual;
    shared
        .events
        .publish(DriverEvent::ModeChanged(OperatingMode::Manual))
        .ok();
    shared
        .events
        .publish(DriverEvent::Error(format!("ALARM:{rest}")))
        .ok();
}

fn on_banner(shared: &Shared, line: &str) {
    info!(banner = line, "controller startup banner");
    let version_ok = line
        .to_lowercase()
        .contains(&shared.config.min_grbl_version.to_lowercase())
        || line.contains("1.1");
    if !version_ok {
        shared
            .events
            .publish(DriverEvent::Error(format!(
                "unsupported firmware version: {line}"
            )))
            .ok();
    }
}

fn on_status(shared: &Shared, line: &str) {
    *shared.last_status_report_at.write() = Some(Instant::now());

    let Some(update) = parse_status(line, shared.config.controller_buffer_size) else {
        debug!(line, "malformed status report");
        shared
            .events
            .publish(DriverEvent::Info(format!("bad status: {line}")))
            .ok();
        return;
    };

    let work_position_variant = reports_work_position(line);
    let mut state = shared.state.write();

    if let Some(status) = update.status {
        if state.status != status {
            state.status = status.clone();
            drop(state);
            shared.events.publish(DriverEvent::StatusChanged(status)).ok();
            state = shared.state.write();
        }
    }

    if let Some(wco) = update.work_offset {
        if state.work_offset != wco {
            state.work_offset = wco;
            drop(state);
            shared.events.publish(DriverEvent::WorkOffsetChanged(wco)).ok();
            state = shared.state.write();
        }
    }

    if let Some(reported) = update.machine_position {
        let mpos = if work_position_variant {
            reported.add(&state.work_offset)
        } else {
            reported
        };
        if state.machine_position != mpos {
            state.machine_position = mpos;
            drop(state);
            shared
                .events
                .publish(DriverEvent::MachinePositionChanged(mpos))
                .ok();
            state = shared.state.write();
        }
    }

    if let Some(buffer_in_use) = update.buffer_in_use {
        if state.buffer_in_use != buffer_in_use {
            state.buffer_in_use = buffer_in_use;
            drop(state);
            shared
                .events
                .publish(DriverEvent::BufferInUseChanged(buffer_in_use))
                .ok();
            state = shared.state.write();
        }
    }

    if let (Some(feed), Some(rapid), Some(spindle)) = (
        update.feed_override,
        update.rapid_override,
        update.spindle_override,
    ) {
        let overrides = Overrides { feed, rapid, spindle };
        if state.overrides != overrides {
            state.overrides = overrides;
            drop(state);
            shared
                .events
                .publish(DriverEvent::OverridesChanged(overrides))
                .ok();
            state = shared.state.write();
        }
    }

    if let (Some(probe_touched), Some(limit_x), Some(limit_y), Some(limit_z)) = (
        update.probe_touched,
        update.limit_x,
        update.limit_y,
        update.limit_z,
    ) {
        let pins = PinStates {
            probe_touched,
            limit_x,
            limit_y,
            limit_z,
        };
        if state.pins != pins {
            state.pins = pins;
            drop(state);
            shared.events.publish(DriverEvent::PinsChanged(pins)).ok();
        }
    }
}

fn on_bracketed(shared: &Shared, line: &str) {
    if let Some(report) = scan_probe_report(line) {
        let reported = Vector3::new(report.x, report.y, report.z);
        let work_offset = shared.state.read().work_offset;
        let work_pos = reported
            .sub(&work_offset)
            .add(&Vector3::new(shared.config.probe_offset.x, shared.config.probe_offset.y, 0.0));
        shared.state.write().last_probe = Some(crate::state::LastProbe {
            machine_pos: reported,
            work_pos,
            success: report.success,
        });
        shared
            .events
            .publish(DriverEvent::ProbeFinished {
                work_pos,
                success: report.success,
            })
            .ok();
        return;
    }

    let update = parse_gcode_state(line);
    let mut state = shared.state.write();
    if let Some(distance_mode) = update.distance_mode {
        if state.distance_mode != distance_mode {
            state.distance_mode = distance_mode;
            drop(state);
            shared
                .events
                .publish(DriverEvent::DistanceModeChanged(distance_mode))
                .ok();
            state = shared.state.write();
        }
    }
    if let Some(unit) = update.unit {
        if state.unit != unit {
            state.unit = unit;
            drop(state);
            shared.events.publish(DriverEvent::UnitChanged(unit)).ok();
            state = shared.state.write();
        }
    }
    if let Some(arc_plane) = update.arc_plane {
        if state.arc_plane != arc_plane {
            state.arc_plane = arc_plane;
            drop(state);
            shared.events.publish(DriverEvent::ArcPlaneChanged(arc_plane)).ok();
            state = shared.state.write();
        }
    }
    if let Some(tlo) = update.tlo {
        if (state.tlo - tlo).abs() > f64::EPSILON {
            state.tlo = tlo;
            drop(state);
            shared.events.publish(DriverEvent::TloChanged(tlo)).ok();
        }
    }
}

fn teardown(shared: &Shared) {
    if let Some(link) = shared.link.lock().take() {
        let _ = link.close();
    }
    shared.queues.clear_normal_and_macro();
    shared.queues.sent.lock().clear();
    {
        let mut state = shared.state.write();
        state.connected = false;
        state.mode = OperatingMode::Disconnected;
        state.status = coppercli_core::DriverStatus::Disconnected;
    }
    shared
        .events
        .publish(DriverEvent::ConnectionStateChanged(false))
        .ok();
}
