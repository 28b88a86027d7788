//! `ProbeController` (§4.6): sweeps a `ProbeGrid`'s unprobed cells in
//! nearest-neighbor order, probing each via `G38.3`, with a slow-probe
//! watchdog and optional abort-on-fail.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use coppercli_core::{Error, ProbeGrid, Vector2, Vector3, WorkflowError};
use coppercli_driver::GrblDriver;
use coppercli_wait::{Frame, MachineWait};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chassis::{ControllerCore, ControllerEvent, ControllerState};
use crate::config::ProbeConfig;
use crate::util::await_probe_result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePhase {
    NotStarted,
    TracingOutline,
    Retracting,
    Probing,
    Completing,
    Completed,
}

pub struct ProbeController {
    driver: Arc<GrblDriver>,
    wait: Arc<MachineWait>,
    core: ControllerCore,
    config: ProbeConfig,
    phase: RwLock<ProbePhase>,
    grid: RwLock<Option<ProbeGrid>>,
}

impl ProbeController {
    pub fn new(driver: Arc<GrblDriver>, wait: Arc<MachineWait>, config: ProbeConfig) -> Self {
        Self {
            driver,
            wait,
            core: ControllerCore::new(),
            config,
            phase: RwLock::new(ProbePhase::NotStarted),
            grid: RwLock::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.core.subscribe()
    }

    pub fn state(&self) -> ControllerState {
        self.core.state()
    }

    pub fn phase(&self) -> ProbePhase {
        *self.phase.read()
    }

    /// A clone of the grid as it currently stands, for incremental display
    /// or for saving a partially completed run.
    pub fn grid(&self) -> Option<ProbeGrid> {
        self.grid.read().clone()
    }

    pub async fn start(&self, parent_ct: &CancellationToken, grid: ProbeGrid) -> Result<ProbeGrid, Error> {
        let ct = self.core.begin(parent_ct)?;
        *self.grid.write() = Some(grid);
        self.core.transition(ControllerState::Running)?;

        let result = self.run_workflow(&ct).await;
        self.cleanup().await;

        let outcome = match result {
            Ok(()) => {
                *self.phase.write() = ProbePhase::Completed;
                self.core.transition(ControllerState::Completing)?;
                self.core.transition(ControllerState::Completed)?;
                Ok(())
            }
            Err(e) => {
                self.core.report_error(e.to_string());
                let terminal = if matches!(e, Error::Workflow(WorkflowError::UserAborted)) {
                    ControllerState::Cancelled
                } else {
                    ControllerState::Failed
                };
                self.core.transition(terminal)?;
                Err(e)
            }
        };

        let grid = self.grid.write().take().expect("grid set at start of run");
        outcome.map(|()| grid)
    }

    pub fn pause(&self) -> Result<(), Error> {
        self.core.pause()
    }

    pub fn resume(&self) -> Result<(), Error> {
        self.core.resume()
    }

    pub fn stop(&self) {
        self.core.stop();
    }

    async fn run_workflow(&self, ct: &CancellationToken) -> Result<(), Error> {
        *self.phase.write() = ProbePhase::Retracting;
        let retracted = self
            .wait
            .safety_retract_z(ct, self.config.mill_start_safety_z, Duration::from_secs(30))
            .await?;
        if !retracted {
            return Err(WorkflowError::Safety {
                reason: "could not retract to safe height before probing".into(),
            }
            .into());
        }

        *self.phase.write() = ProbePhase::Probing;
        self.driver.probe_start()?;

        let mut recent_durations: VecDeque<Duration> = VecDeque::with_capacity(10);
        let total = {
            let grid = self.grid.read();
            let grid = grid.as_ref().expect("grid set at start of run");
            grid.size_x * grid.size_y
        };

        loop {
            if ct.is_cancelled() {
                return Err(WorkflowError::UserAborted.into());
            }
            while self.core.state() == ControllerState::Paused {
                self.sleep(ct, self.wait.poll_interval()).await?;
            }

            let next = self.next_point();
            let Some((ix, iy)) = next else { break };

            let target = {
                let grid = self.grid.read();
                grid.as_ref().expect("grid set at start of run").cell_coords(ix, iy)
            };

            let started = std::time::Instant::now();
            let probed = self.probe_one(ct, target).await;
            let elapsed = started.elapsed();

            match probed {
                Ok(Some(z)) => {
                    self.grid.write().as_mut().unwrap().add_point(ix, iy, z);
                    self.watch_slow_probe(&mut recent_durations, elapsed);
                }
                Ok(None) => {
                    if self.config.abort_on_fail {
                        return Err(WorkflowError::Safety {
                            reason: format!("probe failed at cell ({ix}, {iy})"),
                        }
                        .into());
                    }
                    warn!(ix, iy, "probe failed, AbortOnFail = false, skipping cell");
                    self.grid.write().as_mut().unwrap().skip_point(ix, iy);
                }
                Err(e) => return Err(e),
            }

            let progress = {
                let grid = self.grid.read();
                let grid = grid.as_ref().expect("grid set at start of run");
                (grid.progress() + grid.skipped_count()) as f64 / total as f64
            };
            self.core.progress(progress);
        }

        *self.phase.write() = ProbePhase::Completing;
        self.driver.probe_stop();
        self.driver
            .send_line(format!("G53 G0 Z{}", self.config.safe_height))?;
        self.wait.wait_for_idle(ct, Duration::from_secs(30)).await?;
        Ok(())
    }

    /// Nearest unprobed cell to the current work-XY position, weighted so
    /// a large `XAxisWeight` makes the sweep row-major and `~1`
    /// approximates a serpentine (§4.6).
    fn next_point(&self) -> Option<(usize, usize)> {
        let grid = self.grid.read();
        let grid = grid.as_ref()?;
        let candidates = grid.not_probed();
        if candidates.is_empty() {
            return None;
        }
        let work_xy = self.wait.work_position();

        candidates
            .iter()
            .copied()
            .min_by(|a, b| {
                let da = self.weighted_distance(grid, work_xy, *a);
                let db = self.weighted_distance(grid, work_xy, *b);
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    fn weighted_distance(&self, grid: &ProbeGrid, from: Vector3, to: (usize, usize)) -> f64 {
        let coords = grid.cell_coords(to.0, to.1);
        let dx = (coords.x - from.x) * self.config.x_axis_weight;
        let dy = coords.y - from.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Rapid to `target`, then probe down to `MaxProbeDepth` without waiting
    /// for the XY move to settle first — the controller pipelines the move
    /// and the probe (§4.6 per-point sequence) — then rendezvous on the
    /// resulting `[PRB:...]` report and retract to `max(z + MinimumHeight,
    /// MinimumHeight)`.
    async fn probe_one(&self, ct: &CancellationToken, target: Vector2) -> Result<Option<f64>, Error> {
        self.driver
            .send_line(format!("G1 X{:.4} Y{:.4} F{}", target.x, target.y, self.config.probe_feed))?;

        self.driver.send_line(format!(
            "G38.3 Z-{} F{}",
            self.config.max_probe_depth, self.config.probe_feed
        ))?;
        let (success, z) = await_probe_result(&self.driver, ct).await?;

        let retract_target = (z + self.config.minimum_height).max(self.config.minimum_height);
        self.driver
            .send_line(format!("G1 Z{retract_target} F{}", self.config.probe_feed))?;
        self.wait
            .wait_for_z(ct, retract_target, Duration::from_secs(10), Frame::Work)
            .await?;

        Ok(success.then_some(z))
    }

    /// `TraceOutlineAsync` (§2, §4.6): rapid to each of the grid's four
    /// corners at `TraceHeight`, waiting for motion to start and then
    /// complete between corners, so an operator can watch the work area
    /// outline before committing to a probe sweep.
    pub async fn trace_outline(&self, ct: &CancellationToken, grid: &ProbeGrid) -> Result<(), Error> {
        *self.phase.write() = ProbePhase::TracingOutline;
        let corners = [
            Vector2::new(grid.min.x, grid.min.y),
            Vector2::new(grid.max.x, grid.min.y),
            Vector2::new(grid.max.x, grid.max.y),
            Vector2::new(grid.min.x, grid.max.y),
        ];
        for corner in corners {
            let start_z = self.wait.machine_z();
            self.driver.send_line(format!(
                "G0 X{:.4} Y{:.4} Z{}",
                corner.x, corner.y, self.config.trace_height
            ))?;
            self.wait
                .wait_for_move_start(ct, start_z, Duration::from_secs(10))
                .await?;
            self.wait.wait_for_idle(ct, Duration::from_secs(30)).await?;
        }
        *self.phase.write() = ProbePhase::NotStarted;
        Ok(())
    }

    /// `ProbeZSingleAsync` (§2, §4.6): a single relative Z probe at the
    /// machine's current XY, independent of any grid sweep — used for a
    /// quick one-off surface touch-off. Cancellable; returns `(success,
    /// z_work)`.
    pub async fn probe_z_single(&self, ct: &CancellationToken) -> Result<(bool, f64), Error> {
        self.driver.send_line(format!(
            "G38.3 Z-{} F{}",
            self.config.max_probe_depth, self.config.probe_feed
        ))?;
        await_probe_result(&self.driver, ct).await
    }

    /// A probe taking more than `SlowProbeThreshold` times the average of
    /// the last 10 pauses the controller (§4.6) so an operator can inspect
    /// the machine before it drives further into an unexpected obstruction.
    fn watch_slow_probe(&self, recent: &mut VecDeque<Duration>, elapsed: Duration) {
        if self.config.slow_probe_threshold <= 0.0 {
            return;
        }
        if !recent.is_empty() {
            let avg: Duration = recent.iter().sum::<Duration>() / recent.len() as u32;
            let threshold = avg.mul_f64(self.config.slow_probe_threshold);
            if elapsed > threshold {
                info!(?elapsed, ?avg, "slow probe detected, pausing for operator review");
                self.core.pause().ok();
            }
        }
        if recent.len() == 10 {
            recent.pop_front();
        }
        recent.push_back(elapsed);
    }

    async fn sleep(&self, ct: &CancellationToken, dur: Duration) -> Result<(), Error> {
        tokio::select! {
            _ = tokio::time::sleep(dur) => Ok(()),
            _ = ct.cancelled() => Err(WorkflowError::UserAborted.into()),
        }
    }

    async fn cleanup(&self) {
        self.driver.probe_stop();
        *self.phase.write() = ProbePhase::NotStarted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coppercli_driver::DriverConfig;
    use coppercli_link::{Link, MockStream};
    use coppercli_wait::WaitConfig;

    fn make_controller() -> ProbeController {
        let driver = Arc::new(GrblDriver::new(DriverConfig {
            status_poll_interval: Duration::from_secs(60),
            ..DriverConfig::default()
        }));
        driver.connect_with(Link::from_mock(MockStream::new()));
        let wait = Arc::new(MachineWait::new(
            Arc::clone(&driver),
            WaitConfig {
                poll_interval: Duration::from_millis(5),
                ..WaitConfig::default()
            },
        ));
        ProbeController::new(driver, wait, ProbeConfig::default())
    }

    #[test]
    fn next_point_picks_nearest_to_current_work_position() {
        let controller = make_controller();
        let grid = ProbeGrid::setup(Vector2::new(0.0, 0.0), Vector2::new(4.0, 4.0), 0.0, 2.0);
        *controller.grid.write() = Some(grid);
        // Mock driver defaults to work position (0, 0, 0), so the nearest
        // unprobed cell is the grid origin.
        let first = controller.next_point().unwrap();
        assert_eq!(first, (0, 0));
    }

    #[test]
    fn next_point_none_when_grid_complete() {
        let controller = make_controller();
        let mut grid = ProbeGrid::setup(Vector2::new(0.0, 0.0), Vector2::new(2.0, 2.0), 0.0, 2.0);
        for ix in 0..grid.size_x {
            for iy in 0..grid.size_y {
                grid.add_point(ix, iy, 0.0);
            }
        }
        *controller.grid.write() = Some(grid);
        assert!(controller.next_point().is_none());
    }

    #[test]
    fn watch_slow_probe_pauses_on_outlier() {
        let controller = make_controller();
        controller.core.begin(&CancellationToken::new()).unwrap();
        controller.core.transition(ControllerState::Running).unwrap();
        let mut recent = VecDeque::new();
        for _ in 0..5 {
            controller.watch_slow_probe(&mut recent, Duration::from_millis(100));
        }
        assert_eq!(controller.state(), ControllerState::Running);
        controller.watch_slow_probe(&mut recent, Duration::from_secs(1));
        assert_eq!(controller.state(), ControllerState::Paused);
    }

    #[tokio::test]
    async fn probe_z_single_reports_result_from_driver() {
        let mut mock = MockStream::new();
        mock.push_incoming(b"[PRB:0.000,0.000,-2.500:1]\n");
        let driver = Arc::new(GrblDriver::new(DriverConfig {
            status_poll_interval: Duration::from_secs(60),
            read_timeout: Duration::from_millis(10),
            worker_sleep: Duration::from_millis(1),
            ..DriverConfig::default()
        }));
        driver.connect_with(Link::from_mock(mock));
        let wait = Arc::new(MachineWait::new(
            Arc::clone(&driver),
            WaitConfig {
                poll_interval: Duration::from_millis(5),
                ..WaitConfig::default()
            },
        ));
        let controller = ProbeController::new(driver, wait, ProbeConfig::default());
        let ct = CancellationToken::new();
        let (success, z) = controller.probe_z_single(&ct).await.unwrap();
        assert!(success);
        assert_eq!(z, -2.5);
    }
}
