//! Tunables for [`crate::GrblDriver`], grounded in the source project's
//! `constants.rs` (buffer size, baud rate) and the distilled spec's named
//! constants (status poll interval, grace window).

use std::time::Duration;

use coppercli_core::Vector2;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// GRBL's RX ring buffer size in bytes (default 128, per GRBL_DEFAULT_BUFFER_SIZE).
    pub controller_buffer_size: usize,
    /// How often the worker writes a `?` status query.
    pub status_poll_interval: Duration,
    /// Bound on a single non-blocking-ish read attempt per worker iteration.
    pub read_timeout: Duration,
    /// Delay between worker iterations.
    pub worker_sleep: Duration,
    /// Minimum accepted firmware version string, e.g. "1.1f".
    pub min_grbl_version: String,
    /// Grace window after connect during which an unsolicited `ok` is not
    /// treated as buffer desync (§4.2 failure semantics).
    pub unsolicited_ok_grace: Duration,
    /// Probe tip XY offset from the spindle centerline, added when deriving
    /// `workPos` from a `[PRB:...]` report.
    pub probe_offset: Vector2,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            controller_buffer_size: 128,
            status_poll_interval: Duration::from_millis(200),
            read_timeout: Duration::from_millis(50),
            worker_sleep: Duration::from_micros(500),
            min_grbl_version: "1.1f".to_string(),
            unsolicited_ok_grace: Duration::from_millis(200),
            probe_offset: Vector2::new(0.0, 0.0),
        }
    }
}
