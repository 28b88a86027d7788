//! `ControllerCore` (§4.4): the FSM chassis shared by every workflow
//! controller. Generalizes the source project's per-controller state
//! machines into one reusable component, per the re-architecture note on
//! event-callback fan-out (§9): one coarse event stream per component.

use std::fmt;
use std::sync::Arc;

use coppercli_core::{EventDispatcher, Error, WorkflowError};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Initializing,
    Running,
    Paused,
    WaitingForUserInput,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl ControllerState {
    /// The transition table of §4.4. All transitions not listed are errors.
    pub fn allows(self, next: ControllerState) -> bool {
        use ControllerState::*;
        matches!(
            (self, next),
            (Idle, Initializing)
                | (Initializing, Running)
                | (Initializing, Failed)
                | (Initializing, Cancelled)
                | (Running, Paused)
                | (Running, WaitingForUserInput)
                | (Running, Completing)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
                | (WaitingForUserInput, Running)
                | (WaitingForUserInput, Cancelled)
                | (Completing, Completed)
                | (Completing, Failed)
                | (Completed, Idle)
                | (Failed, Idle)
                | (Cancelled, Idle)
        )
    }
}

/// A pending request for a choice from the user (§4.4). `respond` may be
/// invoked exactly once; later calls are no-ops.
pub struct UserInputRequest {
    pub title: String,
    pub message: String,
    pub options: Vec<String>,
    responder: Arc<Mutex<Option<oneshot::Sender<usize>>>>,
}

impl UserInputRequest {
    pub fn respond(&self, choice: usize) {
        if let Some(tx) = self.responder.lock().take() {
            let _ = tx.send(choice);
        }
    }
}

impl Clone for UserInputRequest {
    fn clone(&self) -> Self {
        Self {
            title: self.title.clone(),
            message: self.message.clone(),
            options: self.options.clone(),
            responder: Arc::clone(&self.responder),
        }
    }
}

impl fmt::Debug for UserInputRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserInputRequest")
            .field("title", &self.title)
            .field("message", &self.message)
            .field("options", &self.options)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    StateChanged(ControllerState),
    Progress(f64),
    UserInputRequired(UserInputRequest),
    ErrorOccurred(String),
}

/// Shared FSM bookkeeping: state, events, and the cancellation token for
/// the in-flight `run`. Concrete controllers (`MillingController`,
/// `ProbeController`, `ToolChangeController`) embed one of these and drive
/// it from their own `start`/`run_workflow`/`cleanup`.
pub struct ControllerCore {
    state: RwLock<ControllerState>,
    events: EventDispatcher<ControllerEvent>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl ControllerCore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ControllerState::Idle),
            events: EventDispatcher::default(),
            cancel: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ControllerState {
        *self.state.read()
    }

    /// Begin a new run: requires `Idle`, transitions to `Initializing`, and
    /// stashes a fresh cancellation token linked to `parent_ct`.
    pub fn begin(&self, parent_ct: &CancellationToken) -> Result<CancellationToken, Error> {
        if self.state() != ControllerState::Idle {
            return Err(WorkflowError::PreconditionViolated {
                reason: format!("cannot start from {:?}", self.state()),
            }
            .into());
        }
        let ct = parent_ct.child_token();
        *self.cancel.lock() = Some(ct.clone());
        self.transition(ControllerState::Initializing)?;
        Ok(ct)
    }

    pub fn transition(&self, next: ControllerState) -> Result<(), Error> {
        let mut state = self.state.write();
        if !state.allows(next) {
            return Err(WorkflowError::InvalidTransition {
                from: format!("{state:?}"),
                to: format!("{next:?}"),
            }
            .into());
        }
        *state = next;
        drop(state);
        self.events.publish(ControllerEvent::StateChanged(next)).ok();
        Ok(())
    }

    pub fn progress(&self, fraction: f64) {
        self.events.publish(ControllerEvent::Progress(fraction)).ok();
    }

    pub fn report_error(&self, message: impl Into<String>) {
        self.events
            .publish(ControllerEvent::ErrorOccurred(message.into()))
            .ok();
    }

    /// Suspend until `respond(choice)` is invoked or `ct` is cancelled. The
    /// only sanctioned blocking call between controller and external
    /// collaborator (§4.4).
    pub async fn request_user_input(
        &self,
        ct: &CancellationToken,
        title: impl Into<String>,
        message: impl Into<String>,
        options: Vec<String>,
    ) -> Result<usize, Error> {
        let (tx, rx) = oneshot::channel();
        let request = UserInputRequest {
            title: title.into(),
            message: message.into(),
            options,
            responder: Arc::new(Mutex::new(Some(tx))),
        };
        self.transition(ControllerState::WaitingForUserInput)?;
        self.events
            .publish(ControllerEvent::UserInputRequired(request))
            .ok();

        let choice = tokio::select! {
            result = rx => result.map_err(|_| Error::from(WorkflowError::UserAborted))?,
            _ = ct.cancelled() => return Err(WorkflowError::UserAborted.into()),
        };
        self.transition(ControllerState::Running)?;
        Ok(choice)
    }

    pub fn pause(&self) -> Result<(), Error> {
        self.transition(ControllerState::Paused)
    }

    pub fn resume(&self) -> Result<(), Error> {
        self.transition(ControllerState::Running)
    }

    /// Cancel the in-flight run's token; the caller's `run_workflow` loop is
    /// expected to observe it and unwind to `cleanup`.
    pub fn stop(&self) {
        if let Some(ct) = self.cancel.lock().as_ref() {
            ct.cancel();
        }
    }

    /// `cleanup` is invoked from both the cancel path and normal
    /// failure/completion; both must be idempotent and safe to overlap.
    /// `reset` returns a terminal controller to `Idle`.
    pub fn reset(&self) -> Result<(), Error> {
        self.transition(ControllerState::Idle)?;
        *self.cancel.lock() = None;
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .lock()
            .as_ref()
            .map(|ct| ct.is_cancelled())
            .unwrap_or(false)
    }
}

impl Default for ControllerCore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_start_from_non_idle() {
        let core = ControllerCore::new();
        let parent = CancellationToken::new();
        core.begin(&parent).unwrap();
        assert!(core.begin(&parent).is_err());
    }

    #[test]
    fn transition_table_matches_spec() {
        assert!(ControllerState::Idle.allows(ControllerState::Initializing));
        assert!(!ControllerState::Idle.allows(ControllerState::Running));
        assert!(ControllerState::Running.allows(ControllerState::Paused));
        assert!(!ControllerState::Paused.allows(ControllerState::Completing));
    }

    #[tokio::test]
    async fn user_input_rendezvous_round_trips() {
        let core = Arc::new(ControllerCore::new());
        let parent = CancellationToken::new();
        let ct = core.begin(&parent).unwrap();
        core.transition(ControllerState::Running).unwrap();

        let mut rx = core.subscribe();
        let core2 = Arc::clone(&core);
        let ct2 = ct.clone();
        let handle = tokio::spawn(async move {
            core2
                .request_user_input(&ct2, "Tool change", "Insert tool", vec!["ok".into()])
                .await
        });

        loop {
            if let ControllerEvent::UserInputRequired(req) = rx.recv().await.unwrap() {
                req.respond(0);
                break;
            }
        }

        let choice = handle.await.unwrap().unwrap();
        assert_eq!(choice, 0);
        assert_eq!(core.state(), ControllerState::Running);
    }

    #[tokio::test]
    async fn cancelling_aborts_user_input_wait() {
        let core = Arc::new(ControllerCore::new());
        let parent = CancellationToken::new();
        let ct = core.begin(&parent).unwrap();
        core.transition(ControllerState::Running).unwrap();
        ct.cancel();
        let err = core
            .request_user_input(&ct, "t", "m", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Workflow(WorkflowError::UserAborted)));
    }
}
