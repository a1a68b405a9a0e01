use clap::Parser;
use homewizard_bridge::meter_session::PROCESS_NAME;
use homewizard_bridge::publish_sink::{BusKind, LogSinkFactory, MqttSinkFactory};
use homewizard_bridge::{Args, Bridge, BridgeConfig, HomeWizardClient, SinkFactory};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("{} v{}", PROCESS_NAME, env!("CARGO_PKG_VERSION"));

    let config = BridgeConfig::from(args);
    let reader = Arc::new(HomeWizardClient::new(config.http_timeout)?);
    let sinks: Arc<dyn SinkFactory> = match &config.mqtt {
        Some(mqtt) => Arc::new(MqttSinkFactory::new(PROCESS_NAME, &mqtt.host, mqtt.port)),
        None => Arc::new(LogSinkFactory::new(BusKind::from_env())),
    };

    let bridge = Bridge::new(config, reader, sinks);
    let (shutdown_tx, shutdown) = watch::channel(false);
    let run = bridge.run(shutdown);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Stopping bridge");
            let _ = shutdown_tx.send(true);
            run.await
        }
    };

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(error = %e, "Bridge stopped");
            Ok(ExitCode::FAILURE)
        }
    }
}
