//! Events published by `SerialProxy` (§4.8).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    AlreadyConnected,
    SerialPortInUse,
}

impl RejectReason {
    /// The in-band `[coppercli] ...` line sent to the rejected client.
    pub fn wire_message(self) -> &'static str {
        match self {
            RejectReason::AlreadyConnected => "[coppercli] connection-rejected",
            RejectReason::SerialPortInUse => "[coppercli] serial-port-in-use",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProxyEvent {
    ClientConnected { peer: String },
    ClientRejected { peer: String, reason: RejectReason },
    ClientDisconnected,
    HealthCheckFailed,
    ListenerRebound,
    Error(String),
}
