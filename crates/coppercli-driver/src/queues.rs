//! The four command queues (§4.2): priority (realtime bytes), normal,
//! macro, and sent. Synchronous lock-guarded FIFOs, matching the worker's
//! blocking read/write loop rather than an async channel.

use std::collections::VecDeque;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

/// A single-byte realtime command, dispatched out of band of buffer
/// accounting (§4.2 step 1).
pub type RealtimeByte = u8;

pub const CMD_QUERY_STATUS: RealtimeByte = b'?';
pub const CMD_FEED_HOLD: RealtimeByte = b'!';
pub const CMD_CYCLE_START: RealtimeByte = b'~';
pub const CMD_SOFT_RESET: RealtimeByte = 0x18;
pub const CMD_JOG_CANCEL: RealtimeByte = 0x85;

pub const CMD_FEED_OV_RESET: RealtimeByte = 0x90;
pub const CMD_FEED_OV_INC_10: RealtimeByte = 0x91;
pub const CMD_FEED_OV_DEC_10: RealtimeByte = 0x92;
pub const CMD_RAPID_OV_FULL: RealtimeByte = 0x95;
pub const CMD_RAPID_OV_HALF: RealtimeByte = 0x96;
pub const CMD_RAPID_OV_QUARTER: RealtimeByte = 0x97;
pub const CMD_SPINDLE_OV_RESET: RealtimeByte = 0x99;
pub const CMD_SPINDLE_OV_INC_10: RealtimeByte = 0x9A;
pub const CMD_SPINDLE_OV_DEC_10: RealtimeByte = 0x9B;

pub struct Queues {
    priority_tx: Sender<RealtimeByte>,
    priority_rx: Receiver<RealtimeByte>,
    pub normal: Mutex<VecDeque<String>>,
    pub macro_lines: Mutex<VecDeque<String>>,
    pub sent: Mutex<VecDeque<String>>,
}

impl Queues {
    pub fn new() -> Self {
        let (priority_tx, priority_rx) = unbounded();
        Self {
            priority_tx,
            priority_rx,
            normal: Mutex::new(VecDeque::new()),
            macro_lines: Mutex::new(VecDeque::new()),
            sent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_priority(&self, byte: RealtimeByte) {
        let _ = self.priority_tx.send(byte);
    }

    pub fn drain_priority(&self) -> Vec<RealtimeByte> {
        self.priority_rx.try_iter().collect()
    }

    pub fn push_normal(&self, line: String) {
        self.normal.lock().push_back(line);
    }

    pub fn push_macro_lines(&self, lines: Vec<String>) {
        self.macro_lines.lock().extend(lines);
    }

    pub fn clear_normal_and_macro(&self) {
        self.normal.lock().clear();
        self.macro_lines.lock().clear();
    }
}

impl Default for Queues {
    fn default() -> Self {
        Self::new()
    }
}
