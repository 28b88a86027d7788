//! Tunables for [`crate::MachineWait`] (§4.3).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// `wait_for_z` succeeds when within this many mm of target.
    pub position_tolerance: f64,
    /// Delay after sending a command that does not itself change status,
    /// to let GRBL absorb it before the next check.
    pub command_delay: Duration,
    /// Delay after a soft reset before polling resumes.
    pub reset_wait: Duration,
    /// Bound on how long homing may take to leave `Idle`.
    pub motion_start_timeout: Duration,
    /// Polling cadence for every `wait_*` primitive; matches the driver's
    /// `StatusPollInterval`.
    pub poll_interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            position_tolerance: 0.1,
            command_delay: Duration::from_millis(100),
            reset_wait: Duration::from_millis(500),
            motion_start_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
        }
    }
}
