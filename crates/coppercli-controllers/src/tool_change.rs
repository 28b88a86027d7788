//! `ToolChangeController` (§4.7): retracts to clearance, either measures
//! the new tool against a fixed tool setter (Mode A) or prompts the
//! operator to swap the tool by hand (Mode B), then returns to the
//! interrupted program position.

use std::sync::Arc;
use std::time::Duration;

use coppercli_core::{Error, WorkflowError};
use coppercli_driver::GrblDriver;
use coppercli_wait::{Frame, MachineWait};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chassis::{ControllerCore, ControllerEvent, ControllerState};
use crate::config::ToolChangeConfig;
use crate::util::await_probe_result;
use crate::ToolChangeRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChangePhase {
    NotStarted,
    Retracting,
    MeasuringReferenceTool,
    AwaitingToolSwap,
    MeasuringNewTool,
    /// Mode B only: the jog screen ("Continue Milling") phase, held open
    /// until the operator has re-zeroed work Z on the newly seated tool.
    WaitingForZeroZ,
    Returning,
    Completed,
}

pub struct ToolChangeController {
    driver: Arc<GrblDriver>,
    wait: Arc<MachineWait>,
    core: ControllerCore,
    config: ToolChangeConfig,
    phase: RwLock<ToolChangePhase>,
    /// The tool-setter work-Z recorded the first time a reference tool is
    /// measured in a session; subsequent tool changes reuse it as the
    /// baseline for the TLO delta (§4.7).
    reference_z: RwLock<Option<f64>>,
}

impl ToolChangeController {
    pub fn new(driver: Arc<GrblDriver>, wait: Arc<MachineWait>, config: ToolChangeConfig) -> Self {
        Self {
            driver,
            wait,
            core: ControllerCore::new(),
            config,
            phase: RwLock::new(ToolChangePhase::NotStarted),
            reference_z: RwLock::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.core.subscribe()
    }

    pub fn state(&self) -> ControllerState {
        self.core.state()
    }

    pub fn phase(&self) -> ToolChangePhase {
        *self.phase.read()
    }

    pub fn stop(&self) {
        self.core.stop();
    }

    /// Run one tool change to completion. The caller (`MillingController`,
    /// via the `ToolChangeRequest` it published) is responsible for having
    /// already put the driver in `Manual` mode.
    pub async fn handle_tool_change(
        &self,
        parent_ct: &CancellationToken,
        request: ToolChangeRequest,
    ) -> Result<(), Error> {
        let ct = self.core.begin(parent_ct)?;
        self.core.transition(ControllerState::Running)?;

        let result = self.run_workflow(&ct, &request).await;
        self.cleanup().await;

        match result {
            Ok(()) => {
                *self.phase.write() = ToolChangePhase::Completed;
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
        }
    }

    async fn run_workflow(&self, ct: &CancellationToken, request: &ToolChangeRequest) -> Result<(), Error> {
        *self.phase.write() = ToolChangePhase::Retracting;
        self.driver.send_line("G90")?;
        self.driver
            .send_line(format!("G53 G0 Z{}", self.config.clearance_z))?;
        self.wait.wait_for_idle(ct, Duration::from_secs(30)).await?;

        if self.config.has_tool_setter {
            self.tool_setter_change(ct, request).await?;
        } else {
            self.manual_change(ct, request).await?;
            *self.phase.write() = ToolChangePhase::WaitingForZeroZ;
            self.core
                .request_user_input(
                    ct,
                    "Tool change",
                    "Jog to the work surface and zero work Z, then continue milling",
                    vec!["Continue Milling".into()],
                )
                .await?;
        }

        *self.phase.write() = ToolChangePhase::Returning;
        let target = request.return_pos_work;
        self.driver.send_line("G90")?;
        self.driver
            .send_line(format!("G53 G0 Z{}", self.config.clearance_z))?;
        self.wait.wait_for_idle(ct, Duration::from_secs(30)).await?;
        self.driver
            .send_line(format!("G1 X{:.4} Y{:.4} F{}", target.x, target.y, self.config.fast_feed))?;
        self.wait.wait_for_idle(ct, Duration::from_secs(30)).await?;
        self.driver
            .send_line(format!("G1 Z{:.4} F{}", target.z, self.config.slow_feed))?;
        self.wait
            .wait_for_z(ct, target.z, Duration::from_secs(30), Frame::Work)
            .await?;
        Ok(())
    }

    /// Mode A: the first measurement of a session establishes
    /// `reference_z`; every subsequent change re-measures and adjusts the
    /// work Z offset by the delta, so a worn or differently-seated tool
    /// doesn't silently shift depth (§8: always re-measure, never trust a
    /// cached offset for the incoming tool).
    async fn tool_setter_change(&self, ct: &CancellationToken, request: &ToolChangeRequest) -> Result<(), Error> {
        if self.reference_z.read().is_none() {
            self.manual_change(ct, request).await?;
            let z = self.measure_tool_setter(ct).await?;
            *self.reference_z.write() = Some(z);
            info!(reference_z = z, "recorded reference tool height");
            return Ok(());
        }

        *self.phase.write() = ToolChangePhase::AwaitingToolSwap;
        self.core
            .request_user_input(
                ct,
                "Tool change",
                format!(
                    "Insert tool {}",
                    request
                        .tool_name
                        .clone()
                        .or_else(|| request.tool_number.map(|n| format!("T{n}")))
                        .unwrap_or_else(|| "requested".into())
                ),
                vec!["Done".into()],
            )
            .await?;

        *self.phase.write() = ToolChangePhase::MeasuringNewTool;
        let new_z = self.measure_tool_setter(ct).await?;
        let reference = *self.reference_z.read().as_ref().expect("reference measured above");
        let offset = new_z - reference;
        let snapshot = self.driver.snapshot();
        let current_wco_z = snapshot.machine_position.z - snapshot.work_position.z;
        self.driver
            .send_line(format!("G10 L20 P1 Z{:.4}", current_wco_z + offset))?;
        self.wait.wait_for_idle(ct, Duration::from_secs(5)).await?;
        Ok(())
    }

    /// Fast seek to `ProbeDepth`, retract `Retract`, slow probe to
    /// confirm, rendezvous on the `[PRB:...]` report (§4.7).
    async fn measure_tool_setter(&self, ct: &CancellationToken) -> Result<f64, Error> {
        *self.phase.write() = ToolChangePhase::MeasuringReferenceTool;
        self.driver.send_line("G90")?;
        self.driver.send_line(format!(
            "G1 X{:.4} Y{:.4} F{}",
            self.config.tool_setter_xy.x, self.config.tool_setter_xy.y, self.config.fast_feed
        ))?;
        self.wait.wait_for_idle(ct, Duration::from_secs(30)).await?;

        self.driver.send_line(format!(
            "G38.3 Z-{} F{}",
            self.config.probe_depth, self.config.fast_feed
        ))?;
        let (success, fast_z) = await_probe_result(&self.driver, ct).await?;
        if !success {
            return Err(WorkflowError::Safety {
                reason: "tool setter fast probe did not trigger".into(),
            }
            .into());
        }

        self.driver
            .send_line(format!("G1 Z{:.4} F{}", fast_z + self.config.retract, self.config.slow_feed))?;
        self.wait
            .wait_for_z(ct, fast_z + self.config.retract, Duration::from_secs(10), Frame::Work)
            .await?;

        self.driver.send_line(format!(
            "G38.3 Z-{} F{}",
            self.config.retract + self.config.approach_clearance,
            self.config.slow_feed
        ))?;
        let (success, z) = await_probe_result(&self.driver, ct).await?;
        if !success {
            return Err(WorkflowError::Safety {
                reason: "tool setter slow probe did not trigger".into(),
            }
            .into());
        }
        Ok(z)
    }

    /// Mode B: present `WorkAreaCenter` (or the request's return position)
    /// so the operator has room to reach the tool, then block on
    /// confirmation via the chassis's user-input rendezvous (§4.4, §4.7).
    async fn manual_change(&self, ct: &CancellationToken, request: &ToolChangeRequest) -> Result<(), Error> {
        let present_at = self
            .config
            .work_area_center
            .unwrap_or_else(|| coppercli_core::Vector2::new(request.return_pos_work.x, request.return_pos_work.y));
        self.driver.send_line("G90")?;
        self.driver
            .send_line(format!("G1 X{:.4} Y{:.4} F{}", present_at.x, present_at.y, self.config.fast_feed))?;
        self.wait.wait_for_idle(ct, Duration::from_secs(30)).await?;

        *self.phase.write() = ToolChangePhase::AwaitingToolSwap;
        let message = match (&request.tool_name, request.tool_number) {
            (Some(name), _) => format!("Install tool: {name}"),
            (None, Some(n)) => format!("Install tool T{n}"),
            (None, None) => "Install the requested tool".into(),
        };
        self.core
            .request_user_input(ct, "Tool change", message, vec!["Done".into()])
            .await?;
        Ok(())
    }

    async fn cleanup(&self) {
        *self.phase.write() = ToolChangePhase::NotStarted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coppercli_core::Vector3;
    use coppercli_driver::DriverConfig;
    use coppercli_link::{Link, MockStream};
    use coppercli_wait::WaitConfig;

    fn make_controller(config: ToolChangeConfig) -> (Arc<GrblDriver>, ToolChangeController) {
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
        let controller = ToolChangeController::new(Arc::clone(&driver), wait, config);
        (driver, controller)
    }

    #[tokio::test]
    async fn manual_change_blocks_until_user_responds() {
        let (driver, controller) = make_controller(ToolChangeConfig {
            has_tool_setter: false,
            ..ToolChangeConfig::default()
        });
        driver.send_line("G90").ok();

        let request = ToolChangeRequest {
            tool_number: Some(2),
            tool_name: None,
            return_pos_work: Vector3::new(1.0, 2.0, 3.0),
            line_number: 10,
        };

        let ct = CancellationToken::new();
        let mut events = controller.subscribe();
        let handle = tokio::spawn(async move { controller.handle_tool_change(&ct, request).await });

        loop {
            if let ControllerEvent::UserInputRequired(req) = events.recv().await.unwrap() {
                assert!(req.message.contains("T2"));
                req.respond(0);
                break;
            }
        }

        loop {
            if let ControllerEvent::UserInputRequired(req) = events.recv().await.unwrap() {
                assert!(req.options.contains(&"Continue Milling".to_string()));
                req.respond(0);
                break;
            }
        }

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_during_manual_wait_is_reported_as_cancelled() {
        let (driver, controller) = make_controller(ToolChangeConfig {
            has_tool_setter: false,
            ..ToolChangeConfig::default()
        });
        driver.send_line("G90").ok();

        let request = ToolChangeRequest {
            tool_number: None,
            tool_name: Some("drill".into()),
            return_pos_work: Vector3::default(),
            line_number: 0,
        };

        let ct = CancellationToken::new();
        let ct2 = ct.clone();
        let controller = Arc::new(controller);
        let c2 = Arc::clone(&controller);
        let handle = tokio::spawn(async move { c2.handle_tool_change(&ct2, request).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ct.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Workflow(WorkflowError::UserAborted)));
        assert_eq!(controller.state(), ControllerState::Cancelled);
    }
}
