//! # coppercli-wait
//!
//! `MachineWait` (§4.3): pure, cancellable, timeout-bounded synchronization
//! primitives layered over a [`GrblDriver`] handle. None of these hold any
//! state of their own beyond the homing flags they are explicitly
//! responsible for (`IsHoming`/`IsHomed`, §8).

pub mod config;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use coppercli_core::{Error, Vector3, WorkflowError};
use coppercli_driver::{DriverSnapshot, GrblDriver};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use config::WaitConfig;

/// Which coordinate frame a position-based wait should read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Work,
    Machine,
}

pub struct MachineWait {
    driver: Arc<GrblDriver>,
    config: WaitConfig,
    is_homing: AtomicBool,
    is_homed: AtomicBool,
}

impl MachineWait {
    pub fn new(driver: Arc<GrblDriver>, config: WaitConfig) -> Self {
        Self {
            driver,
            config,
            is_homing: AtomicBool::new(false),
            is_homed: AtomicBool::new(false),
        }
    }

    pub fn is_homing(&self) -> bool {
        self.is_homing.load(Ordering::SeqCst)
    }

    pub fn is_homed(&self) -> bool {
        self.is_homed.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> DriverSnapshot {
        self.driver.snapshot()
    }

    async fn sleep_cancellable(&self, ct: &CancellationToken, dur: Duration) -> Result<(), Error> {
        tokio::select! {
            _ = tokio::time::sleep(dur) => Ok(()),
            _ = ct.cancelled() => Err(WorkflowError::UserAborted.into()),
        }
    }

    /// Poll at `StatusPollInterval` until `predicate` is true or `timeout`
    /// elapses. `Ok(true)` on success, `Ok(false)` on timeout, cancellation
    /// failure on `ct.cancelled()`.
    async fn poll_until(
        &self,
        ct: &CancellationToken,
        timeout: Duration,
        mut predicate: impl FnMut(&DriverSnapshot) -> bool,
    ) -> Result<bool, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.snapshot()) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = ct.cancelled() => return Err(WorkflowError::UserAborted.into()),
            }
        }
    }

    pub async fn wait_for_idle(&self, ct: &CancellationToken, timeout: Duration) -> Result<bool, Error> {
        self.poll_until(ct, timeout, |s| s.status.is_idle()).await
    }

    /// `Idle` observed continuously for `settle`. Resets on any non-Idle
    /// observation.
    pub async fn wait_for_stable_idle(
        &self,
        ct: &CancellationToken,
        timeout: Duration,
        settle: Duration,
    ) -> Result<bool, Error> {
        let deadline = Instant::now() + timeout;
        let mut idle_since: Option<Instant> = None;
        loop {
            let snapshot = self.snapshot();
            if snapshot.status.is_idle() {
                let since = idle_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= settle {
                    return Ok(true);
                }
            } else {
                idle_since = None;
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = ct.cancelled() => return Err(WorkflowError::UserAborted.into()),
            }
        }
    }

    pub async fn wait_for_z(
        &self,
        ct: &CancellationToken,
        target: f64,
        timeout: Duration,
        frame: Frame,
    ) -> Result<bool, Error> {
        let tolerance = self.config.position_tolerance;
        self.poll_until(ct, timeout, |s| {
            let z = match frame {
                Frame::Work => s.work_position.z,
                Frame::Machine => s.machine_position.z,
            };
            (z - target).abs() < tolerance
        })
        .await
    }

    /// Position diverged from `start_z` OR `Status` prefix is `Run`.
    pub async fn wait_for_move_start(
        &self,
        ct: &CancellationToken,
        start_z: f64,
        timeout: Duration,
    ) -> Result<bool, Error> {
        let tolerance = self.config.position_tolerance;
        self.poll_until(ct, timeout, |s| {
            s.status.is_run() || (s.machine_position.z - start_z).abs() >= tolerance
        })
        .await
    }

    /// Returns the new status once it differs from `prev`, or `None` on
    /// timeout.
    pub async fn wait_for_status_change(
        &self,
        ct: &CancellationToken,
        prev: &coppercli_core::DriverStatus,
        timeout: Duration,
    ) -> Result<Option<coppercli_core::DriverStatus>, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.snapshot().status;
            if &current != prev {
                return Ok(Some(current));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = ct.cancelled() => return Err(WorkflowError::UserAborted.into()),
            }
        }
    }

    pub async fn clear_door(&self, ct: &CancellationToken) -> Result<(), Error> {
        if self.snapshot().status.is_door() {
            self.driver.cycle_start();
            self.sleep_cancellable(ct, self.config.command_delay).await?;
        }
        Ok(())
    }

    /// `clear_door`; `wait_for_idle`; `false` if the result is `Alarm`.
    pub async fn ensure_machine_ready(
        &self,
        ct: &CancellationToken,
        timeout: Duration,
    ) -> Result<bool, Error> {
        self.clear_door(ct).await?;
        self.wait_for_idle(ct, timeout).await?;
        Ok(!self.snapshot().status.is_alarm())
    }

    /// `FeedHold`; delay; `SoftReset`; delay; `$X` if `Alarm`; `wait_for_idle`.
    pub async fn stop_and_reset(&self, ct: &CancellationToken) -> Result<(), Error> {
        self.driver.feed_hold();
        self.sleep_cancellable(ct, self.config.command_delay).await?;
        self.driver.soft_reset();
        self.sleep_cancellable(ct, self.config.reset_wait).await?;
        if self.snapshot().status.is_alarm() {
            self.driver.send_line("$X")?;
        }
        self.wait_for_idle(ct, Duration::from_secs(10)).await?;
        Ok(())
    }

    /// `G10 L20 P1 <axes>`; absorb with a delay and `wait_for_idle` since
    /// this command does not itself change status.
    pub async fn zero_work_offset(&self, ct: &CancellationToken, axes: &str) -> Result<(), Error> {
        self.driver.send_line(format!("G10 L20 P1 {axes}"))?;
        self.sleep_cancellable(ct, self.config.command_delay).await?;
        self.wait_for_idle(ct, Duration::from_secs(5)).await?;
        Ok(())
    }

    /// Set `IsHoming`; `$H`; wait until status leaves `Idle`
    /// (`MotionStartTimeout`); then `wait_for_idle`; on success set
    /// `IsHomed`.
    pub async fn home(&self, ct: &CancellationToken, timeout: Duration) -> Result<bool, Error> {
        self.is_homing.store(true, Ordering::SeqCst);
        self.driver.send_line("$H")?;

        let left_idle = self
            .poll_until(ct, self.config.motion_start_timeout, |s| !s.status.is_idle())
            .await;
        let left_idle = match left_idle {
            Ok(v) => v,
            Err(e) => {
                self.is_homing.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        if !left_idle {
            debug!("home: status never left Idle within MotionStartTimeout");
        }

        let settled = self.wait_for_idle(ct, timeout).await?;
        self.is_homing.store(false, Ordering::SeqCst);
        if settled {
            self.is_homed.store(true, Ordering::SeqCst);
        }
        Ok(settled)
    }

    /// Spindle off; feed hold; soft reset; clear alarm; wait idle;
    /// optionally home.
    pub async fn safe_completion(&self, ct: &CancellationToken, home_after: bool) -> Result<(), Error> {
        self.driver.send_line("M5")?;
        self.stop_and_reset(ct).await?;
        if home_after {
            self.home(ct, Duration::from_secs(60)).await?;
        }
        Ok(())
    }

    /// `G90`; `G53 G0 Z<target>`; if already within tolerance, a brief wait
    /// suffices; else `wait_for_move_start` then `wait_for_z(machine)`.
    pub async fn safety_retract_z(
        &self,
        ct: &CancellationToken,
        target_machine_z: f64,
        timeout: Duration,
    ) -> Result<bool, Error> {
        let start_z = self.snapshot().machine_position.z;
        self.driver.send_line("G90")?;
        self.driver
            .send_line(format!("G53 G0 Z{target_machine_z}"))?;

        if (start_z - target_machine_z).abs() < self.config.position_tolerance {
            self.sleep_cancellable(ct, self.config.command_delay).await?;
            return Ok(true);
        }

        let started = self.wait_for_move_start(ct, start_z, timeout).await?;
        if !started {
            return Ok(false);
        }
        self.wait_for_z(ct, target_machine_z, timeout, Frame::Machine).await
    }

    /// Machine-coordinate position, read straight from the driver snapshot.
    pub fn machine_z(&self) -> f64 {
        self.snapshot().machine_position.z
    }

    pub fn work_position(&self) -> Vector3 {
        self.snapshot().work_position
    }

    /// The polling cadence every `wait_*` primitive uses; exposed so
    /// callers that build their own polling loops (controllers) stay in
    /// step with the driver's `StatusPollInterval`.
    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coppercli_driver::DriverConfig;
    use coppercli_link::{Link, MockStream};

    fn make_wait() -> (Arc<GrblDriver>, MachineWait) {
        let driver = Arc::new(GrblDriver::new(DriverConfig {
            status_poll_interval: Duration::from_secs(60),
            ..DriverConfig::default()
        }));
        driver.connect_with(Link::from_mock(MockStream::new()));
        let wait = MachineWait::new(
            Arc::clone(&driver),
            WaitConfig {
                poll_interval: Duration::from_millis(5),
                ..WaitConfig::default()
            },
        );
        (driver, wait)
    }

    #[tokio::test]
    async fn wait_for_idle_succeeds_immediately_when_already_idle() {
        let (driver, wait) = make_wait();
        std::thread::sleep(Duration::from_millis(30));
        let ct = CancellationToken::new();
        let ok = wait.wait_for_idle(&ct, Duration::from_millis(200)).await.unwrap();
        assert!(ok);
        driver.disconnect();
    }

    #[tokio::test]
    async fn wait_for_idle_times_out_when_never_idle() {
        let (driver, wait) = make_wait();
        driver.disconnect();
        // disconnected driver reports Disconnected, never Idle
        let ct = CancellationToken::new();
        let ok = wait.wait_for_idle(&ct, Duration::from_millis(30)).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn cancellation_aborts_a_wait() {
        let (driver, wait) = make_wait();
        driver.disconnect();
        let ct = CancellationToken::new();
        ct.cancel();
        let err = wait.wait_for_idle(&ct, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::Workflow(WorkflowError::UserAborted)));
    }
}
