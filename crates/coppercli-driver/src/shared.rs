//! State shared between [`crate::GrblDriver`]'s public handle and its
//! worker thread.

use std::time::Instant;

use coppercli_core::EventDispatcher;
use coppercli_link::Link;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::DriverConfig;
use crate::events::DriverEvent;
use crate::queues::Queues;
use crate::state::StateInner;

/// Connection liveness classification (§3 supplemental feature), derived
/// independently of EOF detection from time-since-last-status-report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Healthy,
    Degraded,
    Lost,
}

pub struct Shared {
    pub link: Mutex<Option<Link>>,
    pub state: RwLock<StateInner>,
    pub events: EventDispatcher<DriverEvent>,
    pub queues: Queues,
    pub config: DriverConfig,
    pub cancel: Mutex<Option<CancellationToken>>,
    pub connected_at: RwLock<Option<Instant>>,
    pub last_status_report_at: RwLock<Option<Instant>>,
    pub macro_awaiting_ack: Mutex<bool>,
}

impl Shared {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            link: Mutex::new(None),
            state: RwLock::new(StateInner::default()),
            events: EventDispatcher::default(),
            queues: Queues::new(),
            config,
            cancel: Mutex::new(None),
            connected_at: RwLock::new(None),
            last_status_report_at: RwLock::new(None),
            macro_awaiting_ack: Mutex::new(false),
        }
    }

    /// Link health per the connection watchdog (§3): `Healthy` if a status
    /// report arrived recently, `Degraded` if overdue by one poll interval,
    /// `Lost` if overdue by five.
    pub fn link_health(&self) -> LinkHealth {
        if !self.state.read().connected {
            return LinkHealth::Lost;
        }
        let Some(last) = *self.last_status_report_at.read() else {
            return LinkHealth::Healthy;
        };
        let elapsed = last.elapsed();
        let poll = self.config.status_poll_interval;
        if elapsed <= poll * 2 {
            LinkHealth::Healthy
        } else if elapsed <= poll * 5 {
            LinkHealth::Degraded
        } else {
            LinkHealth::Lost
        }
    }
}
