//! Tunables for `SerialProxy` (§4.8).

use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub serial_port: String,
    pub baud_rate: u32,
    pub dtr: bool,
    /// Bound on the startup open/close probe and on opening the port for a
    /// newly accepted client.
    pub serial_open_timeout: Duration,
    /// How often the accept loop polls a pending listener (§4.8: ~100 ms).
    pub accept_poll_interval: Duration,
    /// Cadence of the listener-rebind health check (§4.8: 5 s).
    pub health_check_interval: Duration,
    /// Idle duration before the proxy starts sending `?` keepalives (10 s).
    pub heartbeat_interval: Duration,
    /// Missed keepalives tolerated before the client is disconnected (3).
    pub max_missed_heartbeats: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:23".parse().expect("valid default listen address"),
            serial_port: String::new(),
            baud_rate: 115_200,
            dtr: true,
            serial_open_timeout: Duration::from_secs(2),
            accept_poll_interval: Duration::from_millis(100),
            health_check_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            max_missed_heartbeats: 3,
        }
    }
}
