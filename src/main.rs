//! `coppercli`: a headless GRBL machine-control plane. Loads configuration,
//! wires up the driver, workflow controllers, and (optionally) the
//! serial-to-TCP proxy, then runs until interrupted.

mod app;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use coppercli::config::SettingsManager;
use coppercli::{init_logging, BUILD_DATE, VERSION};

use app::App;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    info!(version = VERSION, build_date = BUILD_DATE, "coppercli starting");

    let settings_path = SettingsManager::default_path();
    let settings = SettingsManager::new(settings_path.clone());
    let config = settings.load()?;
    info!(path = %settings_path.display(), "configuration loaded");

    let app = Arc::new(App::build(&config));

    if let Err(e) = app.connect(&config) {
        error!(error = %e, "initial connection failed; continuing disconnected");
    }

    let shutdown = CancellationToken::new();
    app.spawn(shutdown.child_token());

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.cancel();
    app.driver.disconnect();

    Ok(())
}
