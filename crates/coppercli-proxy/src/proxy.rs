//! `SerialProxy` (§4.8): a single-client TCP bridge to a serial port, with
//! heartbeat keepalives, rejection messaging, and a safety stop on
//! disconnect.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use coppercli_core::{Error, EventDispatcher};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::events::{ProxyEvent, RejectReason};

const FEED_HOLD: u8 = 0x21;
const SOFT_RESET: u8 = 0x18;

/// Reports whether the serial port named in `config.serial_port` is
/// currently in use by the local web UI's own `GrblDriver`. The proxy and
/// the driver are mutually exclusive owners of a port (§5).
pub type PortInUseProbe = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct SerialProxy {
    config: ProxyConfig,
    events: EventDispatcher<ProxyEvent>,
    has_client: AtomicBool,
    bytes_from_client: AtomicU64,
    bytes_to_client: AtomicU64,
    client_connected_at: Mutex<Option<Instant>>,
    port_in_use_probe: Option<PortInUseProbe>,
    /// Cancelled by `force_disconnect_client`; the active session selects on
    /// it alongside the run-wide token.
    active_session: Mutex<Option<CancellationToken>>,
}

impl SerialProxy {
    pub fn new(config: ProxyConfig, port_in_use_probe: Option<PortInUseProbe>) -> Self {
        Self {
            config,
            events: EventDispatcher::default(),
            has_client: AtomicBool::new(false),
            bytes_from_client: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
            client_connected_at: Mutex::new(None),
            port_in_use_probe,
            active_session: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    pub fn has_client(&self) -> bool {
        self.has_client.load(Ordering::SeqCst)
    }

    pub fn bytes_from_client(&self) -> u64 {
        self.bytes_from_client.load(Ordering::Relaxed)
    }

    pub fn bytes_to_client(&self) -> u64 {
        self.bytes_to_client.load(Ordering::Relaxed)
    }

    pub fn client_connected_time(&self) -> Option<Duration> {
        self.client_connected_at.lock().map(|t| t.elapsed())
    }

    /// Send `[coppercli] force-disconnect`, then tear the session down. A
    /// no-op if no client is connected.
    pub fn force_disconnect_client(&self) {
        if let Some(ct) = self.active_session.lock().as_ref() {
            ct.cancel();
        }
    }

    /// Validate the serial port is openable, without holding it, then run
    /// the accept loop until `ct` is cancelled.
    pub async fn run(&self, ct: &CancellationToken) -> Result<(), Error> {
        self.probe_serial_port().await?;

        let mut listener = self.bind().await?;
        info!(addr = %self.config.listen_addr, "serial proxy listening");

        loop {
            tokio::select! {
                _ = ct.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => self.handle_incoming(socket, addr.to_string(), ct).await,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(self.config.accept_poll_interval).await;
                        }
                    }
                }
                _ = tokio::time::sleep(self.config.health_check_interval) => {
                    if listener.local_addr().is_err() {
                        warn!("listener socket unbound, rebinding");
                        self.events.publish(ProxyEvent::HealthCheckFailed).ok();
                        match self.bind().await {
                            Ok(new_listener) => {
                                listener = new_listener;
                                self.events.publish(ProxyEvent::ListenerRebound).ok();
                            }
                            Err(e) => warn!(error = %e, "failed to rebind listener"),
                        }
                    }
                }
            }
        }
    }

    async fn bind(&self) -> Result<TcpListener, Error> {
        TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(Error::from)
    }

    /// Open and immediately close the serial port, so a misconfigured port
    /// fails fast at startup rather than on the first client.
    async fn probe_serial_port(&self) -> Result<(), Error> {
        let port = self.config.serial_port.clone();
        let baud = self.config.baud_rate;
        let dtr = self.config.dtr;
        let timeout = self.config.serial_open_timeout;
        tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || open_serial(&port, baud, dtr, timeout)),
        )
        .await
        .map_err(|_| Error::other("timed out probing serial port"))?
        .map_err(|e| Error::other(e.to_string()))??;
        Ok(())
    }

    async fn handle_incoming(&self, socket: TcpStream, peer: String, run_ct: &CancellationToken) {
        if self.has_client.swap(true, Ordering::SeqCst) {
            self.events
                .publish(ProxyEvent::ClientRejected { peer, reason: RejectReason::AlreadyConnected })
                .ok();
            Self::reject(socket, RejectReason::AlreadyConnected).await;
            return;
        }

        if let Some(probe) = &self.port_in_use_probe {
            if probe() {
                self.has_client.store(false, Ordering::SeqCst);
                self.events
                    .publish(ProxyEvent::ClientRejected { peer, reason: RejectReason::SerialPortInUse })
                    .ok();
                Self::reject(socket, RejectReason::SerialPortInUse).await;
                return;
            }
        }

        *self.client_connected_at.lock() = Some(Instant::now());
        self.bytes_from_client.store(0, Ordering::Relaxed);
        self.bytes_to_client.store(0, Ordering::Relaxed);
        let session_ct = run_ct.child_token();
        *self.active_session.lock() = Some(session_ct.clone());
        self.events.publish(ProxyEvent::ClientConnected { peer: peer.clone() }).ok();
        info!(peer, "client connected");

        if let Err(e) = self.run_session(socket, &session_ct).await {
            warn!(peer, error = %e, "proxy session ended with error");
            self.events.publish(ProxyEvent::Error(e.to_string())).ok();
        }

        *self.active_session.lock() = None;
        *self.client_connected_at.lock() = None;
        self.has_client.store(false, Ordering::SeqCst);
        self.events.publish(ProxyEvent::ClientDisconnected).ok();
        info!(peer, "client disconnected");
    }

    async fn reject(mut socket: TcpStream, reason: RejectReason) {
        let line = format!("{}\r\n", reason.wire_message());
        let _ = socket.write_all(line.as_bytes()).await;
        let _ = socket.shutdown().await;
    }

    /// Open the serial port for this client, start the two forwarding
    /// directions, and run the heartbeat watchdog until either side closes
    /// or `ct` is cancelled (by `force_disconnect_client` or a run-wide
    /// shutdown). Always ends with the feed-hold/soft-reset safety sequence.
    async fn run_session(&self, mut socket: TcpStream, ct: &CancellationToken) -> Result<(), Error> {
        let reader_port = {
            let port = self.config.serial_port.clone();
            let baud = self.config.baud_rate;
            let dtr = self.config.dtr;
            let timeout = self.config.serial_open_timeout;
            tokio::time::timeout(
                timeout,
                tokio::task::spawn_blocking(move || open_serial(&port, baud, dtr, timeout)),
            )
            .await
            .map_err(|_| Error::other("timed out opening serial port for client"))?
            .map_err(|e| Error::other(e.to_string()))??
        };
        let writer_port = reader_port
            .try_clone()
            .map_err(|e| Error::other(format!("failed to clone serial handle: {e}")))?;
        let writer = Arc::new(Mutex::new(writer_port));

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        let reader_ct = ct.clone();
        let reader_handle = tokio::task::spawn_blocking(move || serial_reader_loop(reader_port, tx, reader_ct));

        let mut tcp_buf = [0u8; 1024];
        let mut missed_heartbeats = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = ct.cancelled() => {
                    let _ = socket.write_all(b"[coppercli] force-disconnect\r\n").await;
                    break;
                }
                from_serial = rx.recv() => {
                    match from_serial {
                        Some(data) => {
                            self.bytes_to_client.fetch_add(data.len() as u64, Ordering::Relaxed);
                            if socket.write_all(&data).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                read = tokio::time::timeout(self.config.heartbeat_interval, socket.read(&mut tcp_buf)) => {
                    match read {
                        Ok(Ok(0)) => break,
                        Ok(Ok(n)) => {
                            self.bytes_from_client.fetch_add(n as u64, Ordering::Relaxed);
                            missed_heartbeats = 0;
                            Self::write_serial(&writer, tcp_buf[..n].to_vec()).await.ok();
                        }
                        Ok(Err(_)) => break,
                        Err(_elapsed) => {
                            missed_heartbeats += 1;
                            if missed_heartbeats > self.config.max_missed_heartbeats {
                                warn!("client exceeded missed heartbeat threshold, disconnecting");
                                break;
                            }
                            Self::write_serial(&writer, b"?".to_vec()).await.ok();
                        }
                    }
                }
            }
        }

        // Disconnect safety (§4.8, §8 S6): feed hold, then soft reset 100 ms
        // apart, unconditionally, whether the session ended gracefully,
        // on error, or by heartbeat timeout.
        Self::write_serial(&writer, vec![FEED_HOLD]).await.ok();
        tokio::time::sleep(Duration::from_millis(100)).await;
        Self::write_serial(&writer, vec![SOFT_RESET]).await.ok();

        ct.cancel();
        let _ = reader_handle.await;
        Ok(())
    }

    async fn write_serial(writer: &Arc<Mutex<Box<dyn serialport::SerialPort>>>, data: Vec<u8>) -> io::Result<()> {
        use std::io::Write;
        let writer = Arc::clone(writer);
        tokio::task::spawn_blocking(move || writer.lock().write_all(&data))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
    }
}

/// Blocking loop on its own thread: reads whatever the serial port's short
/// timeout yields and forwards non-empty chunks to the async session.
/// Exits on a read error, a closed channel, or `ct` cancellation.
fn serial_reader_loop(mut port: Box<dyn serialport::SerialPort>, tx: mpsc::Sender<Vec<u8>>, ct: CancellationToken) {
    use std::io::Read;
    let mut buf = [0u8; 1024];
    while !ct.is_cancelled() {
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(_) => break,
        }
    }
}

fn open_serial(port: &str, baud_rate: u32, dtr: bool, timeout: Duration) -> io::Result<Box<dyn serialport::SerialPort>> {
    let mut handle = serialport::new(port, baud_rate)
        .timeout(timeout.min(Duration::from_millis(200)))
        .open()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    handle
        .write_data_terminal_ready(dtr)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reason_wire_messages_carry_the_coppercli_prefix() {
        assert_eq!(RejectReason::AlreadyConnected.wire_message(), "[coppercli] connection-rejected");
        assert_eq!(RejectReason::SerialPortInUse.wire_message(), "[coppercli] serial-port-in-use");
    }

    #[tokio::test]
    async fn force_disconnect_is_a_no_op_without_a_client() {
        let config = ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..ProxyConfig::default()
        };
        let proxy = SerialProxy::new(config, None);
        assert!(!proxy.has_client());
        proxy.force_disconnect_client();
    }

    #[tokio::test]
    async fn counters_start_at_zero() {
        let config = ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..ProxyConfig::default()
        };
        let proxy = SerialProxy::new(config, None);
        assert_eq!(proxy.bytes_from_client(), 0);
        assert_eq!(proxy.bytes_to_client(), 0);
        assert!(proxy.client_connected_time().is_none());
    }
}
