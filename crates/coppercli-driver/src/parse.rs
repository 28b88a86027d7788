//! Status/probe/g-code-state report parsing (§4.2), built on
//! `coppercli_core::scanner`.

use coppercli_core::{ArcPlane, DistanceMode, DriverStatus, Unit, Vector3};

use coppercli_core::scanner::{extract_bracketed_field, scan_gcode_tokens, strip_brackets};

#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub status: Option<DriverStatus>,
    pub machine_position: Option<Vector3>,
    pub work_offset: Option<Vector3>,
    pub buffer_in_use: Option<usize>,
    pub feed_override: Option<i32>,
    pub rapid_override: Option<i32>,
    pub spindle_override: Option<i32>,
    pub probe_touched: Option<bool>,
    pub limit_x: Option<bool>,
    pub limit_y: Option<bool>,
    pub limit_z: Option<bool>,
}

/// Parse a `<...>` status report. Returns `None` if the leading state token
/// is missing (malformed report).
pub fn parse_status(line: &str, controller_buffer_size: usize) -> Option<StatusUpdate> {
    let body = strip_brackets(line);
    let (state_token, rest) = body.split_once('|').unwrap_or((body, ""));
    if state_token.is_empty() {
        return None;
    }
    let mut update = StatusUpdate {
        status: Some(DriverStatus::parse(state_token)),
        ..Default::default()
    };

    if let Some(mpos) = extract_bracketed_field(rest, "MPos:").and_then(Vector3::parse) {
        update.machine_position = Some(mpos);
    } else if let Some(wpos) = extract_bracketed_field(rest, "WPos:").and_then(Vector3::parse) {
        // WPos is reported instead of MPos; derive MPos once WCO is known by
        // the caller (machine = work + offset). Stash as machine_position
        // here and let the caller reconcile against the current WorkOffset.
        update.machine_position = Some(wpos);
    }

    if let Some(wco) = extract_bracketed_field(rest, "WCO:").and_then(Vector3::parse) {
        update.work_offset = Some(wco);
    }

    if let Some(ov) = extract_bracketed_field(rest, "Ov:") {
        let mut parts = ov.split(',').filter_map(|p| p.trim().parse::<i32>().ok());
        if let (Some(f), Some(r), Some(s)) = (parts.next(), parts.next(), parts.next()) {
            update.feed_override = Some(f);
            update.rapid_override = Some(r);
            update.spindle_override = Some(s);
        }
    }

    if let Some(bf) = extract_bracketed_field(rest, "Bf:") {
        if let Some((_, available)) = bf.split_once(',') {
            if let Ok(available) = available.trim().parse::<usize>() {
                update.buffer_in_use = Some(controller_buffer_size.saturating_sub(available));
            }
        }
    }

    if let Some(pn) = extract_bracketed_field(rest, "Pn:") {
        update.probe_touched = Some(pn.contains('P'));
        update.limit_x = Some(pn.contains('X'));
        update.limit_y = Some(pn.contains('Y'));
        update.limit_z = Some(pn.contains('Z'));
    }

    Some(update)
}

/// True if the status body carried `WPos` rather than `MPos` (so the caller
/// must add `WorkOffset` back in to derive machine position).
pub fn reports_work_position(line: &str) -> bool {
    let body = strip_brackets(line);
    extract_bracketed_field(body, "MPos:").is_none() && extract_bracketed_field(body, "WPos:").is_some()
}

#[derive(Debug, Clone, Default)]
pub struct GcodeStateUpdate {
    pub distance_mode: Option<DistanceMode>,
    pub unit: Option<Unit>,
    pub arc_plane: Option<ArcPlane>,
    pub tlo: Option<f64>,
}

/// Parse a `[...]` g-code state snippet (any bracketed line that is not a
/// probe report), e.g. `[GC:G0 G54 G17 G21 G90 G94 M0 M5 M9 T0 F0. S0.]`.
pub fn parse_gcode_state(line: &str) -> GcodeStateUpdate {
    let body = strip_brackets(line);
    let mut update = GcodeStateUpdate::default();
    for token in scan_gcode_tokens(body) {
        match (token.letter, token.number) {
            (b'G', "90") => update.distance_mode = Some(DistanceMode::Absolute),
            (b'G', "91") => update.distance_mode = Some(DistanceMode::Incremental),
            (b'G', "20") => update.unit = Some(Unit::Imperial),
            (b'G', "21") => update.unit = Some(Unit::Metric),
            (b'G', "17") => update.arc_plane = Some(ArcPlane::Xy),
            (b'G', "18") => update.arc_plane = Some(ArcPlane::Zx),
            (b'G', "19") => update.arc_plane = Some(ArcPlane::Yz),
            (b'T', n) => {
                // Tool number token, not a TLO value; ignored here.
                let _ = n;
            }
            _ => {}
        }
    }
    if let Some(tlo_str) = extract_bracketed_field(body, "TLO:") {
        if let Ok(tlo) = tlo_str.trim().parse::<f64>() {
            update.tlo = Some(tlo);
        }
    }
    update
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_status_line() {
        let update = parse_status(
            "<Idle|MPos:1.000,2.000,-3.000|Bf:14,1|FS:500,8000|Ov:100,100,100|Pn:PXZ>",
            128,
        )
        .unwrap();
        assert_eq!(update.status, Some(DriverStatus::Idle));
        assert_eq!(update.machine_position, Some(Vector3::new(1.0, 2.0, -3.0)));
        assert_eq!(update.buffer_in_use, Some(128 - 1));
        assert_eq!(update.feed_override, Some(100));
        assert_eq!(update.probe_touched, Some(true));
        assert_eq!(update.limit_y, Some(false));
    }

    #[test]
    fn detects_work_position_variant() {
        assert!(reports_work_position("<Run|WPos:0,0,0>"));
        assert!(!reports_work_position("<Run|MPos:0,0,0>"));
    }

    #[test]
    fn parses_gcode_state_tokens() {
        let update = parse_gcode_state("[GC:G1 G91 G20 G18]");
        assert_eq!(update.distance_mode, Some(DistanceMode::Incremental));
        assert_eq!(update.unit, Some(Unit::Imperial));
        assert_eq!(update.arc_plane, Some(ArcPlane::Zx));
    }

    #[test]
    fn malformed_status_returns_none() {
        assert!(parse_status("garbage", 128).is_none());
    }
}
