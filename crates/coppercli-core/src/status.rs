//! Driver-observable enumerations (§3).

use serde::{Deserialize, Serialize};

/// A tagged label derived from the controller's `<...>` report.
///
/// Only the variant is semantically meaningful to the core; sub-fields are
/// opaque strings carried through for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DriverStatus {
    Idle,
    Run,
    Hold(String),
    Door(String),
    Alarm(String),
    Home,
    Jog,
    Check,
    Sleep,
    Disconnected,
}

impl DriverStatus {
    /// Parse the leading state token of a `<...>` report (before the first `:`
    /// or `|`), e.g. `Hold:0` -> `Hold("0")`.
    pub fn parse(token: &str) -> Self {
        let (prefix, sub) = match token.split_once(':') {
            Some((p, s)) => (p, s.to_string()),
            None => (token, String::new()),
        };
        match prefix {
            "Idle" => DriverStatus::Idle,
            "Run" => DriverStatus::Run,
            "Hold" => DriverStatus::Hold(sub),
            "Door" => DriverStatus::Door(sub),
            "Alarm" => DriverStatus::Alarm(sub),
            "Home" => DriverStatus::Home,
            "Jog" => DriverStatus::Jog,
            "Check" => DriverStatus::Check,
            "Sleep" => DriverStatus::Sleep,
            _ => DriverStatus::Disconnected,
        }
    }

    /// The variant prefix, ignoring any sub-field — the only part that is
    /// semantically meaningful per §3.
    pub fn prefix(&self) -> &'static str {
        match self {
            DriverStatus::Idle => "Idle",
            DriverStatus::Run => "Run",
            DriverStatus::Hold(_) => "Hold",
            DriverStatus::Door(_) => "Door",
            DriverStatus::Alarm(_) => "Alarm",
            DriverStatus::Home => "Home",
            DriverStatus::Jog => "Jog",
            DriverStatus::Check => "Check",
            DriverStatus::Sleep => "Sleep",
            DriverStatus::Disconnected => "Disconnected",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, DriverStatus::Idle)
    }

    pub fn is_alarm(&self) -> bool {
        matches!(self, DriverStatus::Alarm(_))
    }

    pub fn is_door(&self) -> bool {
        matches!(self, DriverStatus::Door(_))
    }

    pub fn is_run(&self) -> bool {
        matches!(self, DriverStatus::Run)
    }
}

/// The driver's current intent (§3). Transitions are driven exclusively by
/// driver methods; controllers only observe them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    Manual,
    SendFile,
    Probe,
    SendMacro,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMode {
    Absolute,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    Metric,
    Imperial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArcPlane {
    Xy,
    Yz,
    Zx,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hold_with_subcode() {
        let s = DriverStatus::parse("Hold:0");
        assert_eq!(s.prefix(), "Hold");
        assert!(matches!(s, DriverStatus::Hold(ref sub) if sub == "0"));
    }

    #[test]
    fn parses_bare_idle() {
        assert!(DriverStatus::parse("Idle").is_idle());
    }

    #[test]
    fn unknown_token_is_disconnected() {
        assert_eq!(DriverStatus::parse("Bogus").prefix(), "Disconnected");
    }
}
