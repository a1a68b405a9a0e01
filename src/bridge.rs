use crate::config::BridgeConfig;
use crate::device_reader::DeviceReader;
use crate::discovery::{DiscoveryCoordinator, DiscoveryProvider, MdnsProvider};
use crate::error::BridgeError;
use crate::meter_session::MeterSession;
use crate::publish_sink::SinkFactory;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Owns the process lifetime: one static meter, or every discovered one.
pub struct Bridge {
    config: BridgeConfig,
    reader: Arc<dyn DeviceReader>,
    sinks: Arc<dyn SinkFactory>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        reader: Arc<dyn DeviceReader>,
        sinks: Arc<dyn SinkFactory>,
    ) -> Self {
        Self {
            config,
            reader,
            sinks,
        }
    }

    /// Runs in the mode selected by the configuration until `shutdown` fires.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), BridgeError> {
        match &self.config.host {
            Some(host) => self.run_static(host.clone(), shutdown).await,
            None => {
                let mut provider = MdnsProvider::default();
                self.run_discovery(&mut provider, shutdown).await
            }
        }
    }

    /// Publishes a single meter. Failing to reach it at startup is fatal.
    pub async fn run_static(
        &self,
        host: String,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), BridgeError> {
        info!(%host, "Starting in static host mode");
        let session = MeterSession::initialize(
            host,
            self.reader.clone(),
            self.sinks.as_ref(),
            self.config.session_settings(),
        )
        .await?;
        info!(
            serial = %session.identity().serial,
            firmware = %session.identity().firmware_version,
            "Meter identified"
        );
        session.run(shutdown).await;
        Ok(())
    }

    /// Publishes every supported meter reported by `provider`.
    pub async fn run_discovery(
        &self,
        provider: &mut dyn DiscoveryProvider,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), BridgeError> {
        info!(policy = ?self.config.removal_policy, "Starting in discovery mode");
        let events = provider.start()?;
        let mut coordinator = DiscoveryCoordinator::new(
            self.reader.clone(),
            self.sinks.clone(),
            self.config.session_settings(),
            self.config.removal_policy,
        );
        let result = coordinator.run(events, shutdown).await;
        provider.stop();
        result
    }
}
