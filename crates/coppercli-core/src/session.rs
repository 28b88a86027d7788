//! `Session` (§3): persistent work-zero and recent-path state. The core only
//! reads and writes this value; the external collaborator decides when to
//! persist it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::geometry::Vector3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Session {
    pub last_gcode_path: Option<PathBuf>,
    pub last_probe_dir: Option<PathBuf>,
    pub work_zero: Option<Vector3>,
    pub has_stored_work_zero: bool,
    pub is_work_zero_trusted: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_work_zero(&mut self, zero: Vector3, trusted: bool) {
        self.work_zero = Some(zero);
        self.has_stored_work_zero = true;
        self.is_work_zero_trusted = trusted;
    }

    pub fn clear_work_zero(&mut self) {
        self.work_zero = None;
        self.has_stored_work_zero = false;
        self.is_work_zero_trusted = false;
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut session = Session::new();
        session.set_work_zero(Vector3::new(1.0, 2.0, 3.0), true);
        let json = session.to_json().unwrap();
        let loaded = Session::from_json(&json).unwrap();
        assert_eq!(session, loaded);
    }
}
