//! Shared helpers used by more than one controller.

use coppercli_core::{Error, WorkflowError};
use coppercli_driver::{DriverEvent, GrblDriver};
use tokio_util::sync::CancellationToken;

/// Wait for the next `ProbeFinished` event on the driver's event stream.
/// Both `ProbeController` and `ToolChangeController` pipeline a rapid move
/// and a probe command, then rendezvous here rather than waiting for
/// `Idle` between them (§4.6 per-point sequence).
pub async fn await_probe_result(
    driver: &GrblDriver,
    ct: &CancellationToken,
) -> Result<(bool, f64), Error> {
    let mut rx = driver.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(DriverEvent::ProbeFinished { work_pos, success }) => return Ok((success, work_pos.z)),
                Ok(_) => continue,
                Err(_) => return Err(Error::other("driver event stream closed before probe finished")),
            },
            _ = ct.cancelled() => return Err(WorkflowError::UserAborted.into()),
        }
    }
}
