//! Composition root: wires a [`Config`](crate::config::Config) into a live
//! [`GrblDriver`], [`MachineWait`], the three workflow controllers, and an
//! optional [`SerialProxy`], and forwards their events into the log.

use std::sync::Arc;

use coppercli_controllers::{
    ControllerEvent, MillingConfig, MillingController, ProbeConfig, ProbeController,
    ToolChangeConfig, ToolChangeController,
};
use coppercli_core::Error;
use coppercli_driver::{DriverConfig, DriverEvent, GrblDriver};
use coppercli_link::{SerialParams, TcpParams};
use coppercli_proxy::{ProxyConfig, ProxyEvent, SerialProxy};
use coppercli_wait::{MachineWait, WaitConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;

pub struct App {
    pub driver: Arc<GrblDriver>,
    pub wait: Arc<MachineWait>,
    pub milling: Arc<MillingController>,
    pub probe: Arc<ProbeController>,
    pub tool_change: Arc<ToolChangeController>,
    pub proxy: Option<Arc<SerialProxy>>,
}

impl App {
    pub fn build(config: &Config) -> Self {
        let driver_config = DriverConfig {
            controller_buffer_size: config.machine.controller_buffer_size,
            status_poll_interval: config.status_poll_interval(),
            min_grbl_version: config.machine.min_grbl_version.clone(),
            ..DriverConfig::default()
        };
        let driver = Arc::new(GrblDriver::new(driver_config));

        let wait_config = WaitConfig {
            poll_interval: config.status_poll_interval(),
            motion_start_timeout: config.homing_timeout(),
            ..WaitConfig::default()
        };
        let wait = Arc::new(MachineWait::new(Arc::clone(&driver), wait_config));

        let milling_config = MillingConfig {
            mill_start_safety_z: config.milling.mill_start_safety_z,
            mill_complete_z: config.milling.mill_complete_z,
            clearance_z: config.milling.clearance_z,
            homing_timeout: config.homing_timeout(),
            ..MillingConfig::default()
        };
        let milling = Arc::new(MillingController::new(
            Arc::clone(&driver),
            Arc::clone(&wait),
            milling_config,
        ));

        let probe_config = ProbeConfig {
            x_axis_weight: config.probe.x_axis_weight,
            abort_on_fail: config.probe.abort_on_fail,
            slow_probe_threshold: config.probe.slow_probe_threshold,
            ..ProbeConfig::default()
        };
        let probe = Arc::new(ProbeController::new(
            Arc::clone(&driver),
            Arc::clone(&wait),
            probe_config,
        ));

        let tool_change = Arc::new(ToolChangeController::new(
            Arc::clone(&driver),
            Arc::clone(&wait),
            ToolChangeConfig::default(),
        ));

        let proxy = if config.proxy.enabled {
            match config.connection.serial_port.clone() {
                Some(serial_port) => {
                    let listen_addr = match config.proxy.listen_addr.parse() {
                        Ok(addr) => addr,
                        Err(e) => {
                            error!(error = %e, "invalid proxy.listen_addr, proxy disabled");
                            return Self::finish(driver, wait, milling, probe, tool_change, None);
                        }
                    };
                    let proxy_config = ProxyConfig {
                        listen_addr,
                        serial_port,
                        baud_rate: config.connection.baud_rate,
                        dtr: config.connection.dtr,
                        heartbeat_interval: std::time::Duration::from_secs(
                            config.proxy.heartbeat_interval_secs,
                        ),
                        max_missed_heartbeats: config.proxy.max_missed_heartbeats,
                        ..ProxyConfig::default()
                    };
                    Some(Arc::new(SerialProxy::new(proxy_config, None)))
                }
                None => {
                    warn!("proxy.enabled is set but connection.serial_port is empty; not starting proxy");
                    None
                }
            }
        } else {
            None
        };

        Self::finish(driver, wait, milling, probe, tool_change, proxy)
    }

    fn finish(
        driver: Arc<GrblDriver>,
        wait: Arc<MachineWait>,
        milling: Arc<MillingController>,
        probe: Arc<ProbeController>,
        tool_change: Arc<ToolChangeController>,
        proxy: Option<Arc<SerialProxy>>,
    ) -> Self {
        Self {
            driver,
            wait,
            milling,
            probe,
            tool_change,
            proxy,
        }
    }

    /// Connects to the configured serial port or TCP address, if any. A
    /// missing connection is not an error: the driver stays disconnected
    /// until something else calls `connect_serial`/`connect_tcp`.
    pub fn connect(&self, config: &Config) -> Result<(), Error> {
        if let Some(port) = &config.connection.serial_port {
            info!(%port, "connecting over serial");
            self.driver.connect_serial(SerialParams {
                port: port.clone(),
                baud_rate: config.connection.baud_rate,
                dtr: config.connection.dtr,
                timeout: std::time::Duration::from_secs(2),
            })?;
        } else if let Some(addr) = &config.connection.tcp_address {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| Error::other(format!("invalid tcp_address: {addr}")))?;
            let port: u16 = port
                .parse()
                .map_err(|_| Error::other(format!("invalid tcp_address port: {addr}")))?;
            info!(%addr, "connecting over tcp");
            self.driver.connect_tcp(TcpParams {
                host: host.to_string(),
                port,
                timeout: std::time::Duration::from_secs(2),
            })?;
        } else {
            info!("no connection configured; staying disconnected until told otherwise");
        }
        Ok(())
    }

    /// Spawns the background tasks that relay driver/controller/proxy
    /// events into the log, and the proxy's accept loop if configured.
    /// Returns the root cancellation token; dropping it (calling `.cancel()`)
    /// tears everything down.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) {
        let mut driver_rx = self.driver.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = driver_rx.recv().await {
                log_driver_event(&event);
            }
        });

        let mut milling_rx = self.milling.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = milling_rx.recv().await {
                log_controller_event("milling", &event);
            }
        });

        let mut probe_rx = self.probe.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = probe_rx.recv().await {
                log_controller_event("probe", &event);
            }
        });

        let mut tool_change_rx = self.tool_change.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = tool_change_rx.recv().await {
                log_controller_event("tool-change", &event);
            }
        });

        // Milling surfaces M6 tool changes; hand each one to the tool-change
        // controller in turn.
        let mut tc_requests = self.milling.subscribe_tool_change();
        let tool_change = Arc::clone(&self.tool_change);
        let tc_ct = shutdown.child_token();
        tokio::spawn(async move {
            while let Ok(request) = tc_requests.recv().await {
                if let Err(e) = tool_change.handle_tool_change(&tc_ct, request).await {
                    error!(error = %e, "tool change workflow failed");
                }
            }
        });

        if let Some(proxy) = self.proxy.clone() {
            let mut proxy_rx = proxy.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = proxy_rx.recv().await {
                    log_proxy_event(&event);
                }
            });
            let proxy_ct = shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = proxy.run(&proxy_ct).await {
                    error!(error = %e, "serial proxy exited");
                }
            });
        }
    }
}

fn log_driver_event(event: &DriverEvent) {
    match event {
        DriverEvent::ConnectionStateChanged(connected) => {
            info!(connected, "driver connection state changed")
        }
        DriverEvent::StatusChanged(status) => info!(?status, "machine status changed"),
        DriverEvent::ModeChanged(mode) => info!(?mode, "driver mode changed"),
        DriverEvent::ProbeFinished { work_pos, success } => {
            info!(?work_pos, success, "probe finished")
        }
        DriverEvent::Info(line) => info!(%line, "controller info"),
        DriverEvent::Error(msg) => error!(%msg, "controller error"),
        other => tracing::debug!(?other, "driver event"),
    }
}

fn log_controller_event(name: &str, event: &ControllerEvent) {
    match event {
        ControllerEvent::StateChanged(state) => info!(controller = name, ?state, "state changed"),
        ControllerEvent::Progress(p) => info!(controller = name, progress = p, "progress"),
        ControllerEvent::UserInputRequired(req) => {
            info!(controller = name, message = %req.message, "awaiting user input")
        }
        ControllerEvent::ErrorOccurred(msg) => error!(controller = name, %msg, "controller error"),
    }
}

fn log_proxy_event(event: &ProxyEvent) {
    match event {
        ProxyEvent::ClientConnected { peer } => info!(%peer, "proxy client connected"),
        ProxyEvent::ClientRejected { peer, reason } => {
            warn!(%peer, ?reason, "proxy client rejected")
        }
        ProxyEvent::ClientDisconnected => info!("proxy client disconnected"),
        ProxyEvent::HealthCheckFailed => warn!("proxy health check failed"),
        ProxyEvent::ListenerRebound => warn!("proxy listener rebound"),
        ProxyEvent::Error(msg) => error!(%msg, "proxy error"),
    }
}
