use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};
use zeroenergy::{config, controller, domain, meter, mqtt, telemetry};

use config::Config;
use controller::DispatchController;
use domain::{CommandSink, LogOnlySink, TelemetryStore};
use meter::PowerSampler;
use mqtt::MqttLink;
use telemetry::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::load().context("loading configuration")?;
    let _log_guard = init_tracing(&cfg.log)?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting zeroenergy");

    let source = meter::power_source(&cfg.meter)?;
    let store = TelemetryStore::new();
    let link = MqttLink::start(&cfg.mqtt, store.clone());

    let sink: Arc<dyn CommandSink> = if cfg.dispatch.simulate {
        warn!("simulate mode: set-points are logged, not published");
        Arc::new(LogOnlySink)
    } else {
        Arc::new(link.command_sink())
    };

    let mut controller =
        DispatchController::new(cfg.dispatch.clone(), PowerSampler::new(source), store, sink);

    let result = tokio::select! {
        res = controller.run() => res,
        _ = shutdown_signal() => Ok(()),
    };

    link.shutdown().await;

    if let Err(e) = &result {
        error!(error = %e, "dispatch loop stopped");
    }
    info!("finished");
    result
}
