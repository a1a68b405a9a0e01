use crate::device_reader::{DeviceIdentity, DeviceReader, ReadingSnapshot};
use crate::error::BridgeError;
use crate::path_tree::{Formatter, PathTree, Value};
use crate::publish_sink::SinkFactory;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const PROCESS_NAME: &str = env!("CARGO_PKG_NAME");
pub const PROCESS_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PRODUCT_ID: i64 = 0xFFFF;

/// Paths published for every reading, in declaration order.
pub const READING_PATHS: [(&str, Option<Formatter>); 22] = [
    ("/Ac/Energy/Forward", Some(Formatter::KiloWattHours)),
    ("/Ac/Energy/Reverse", Some(Formatter::KiloWattHours)),
    ("/Ac/L1/Current", Some(Formatter::Amps)),
    ("/Ac/L1/Energy/Forward", Some(Formatter::KiloWattHours)),
    ("/Ac/L1/Energy/Reverse", Some(Formatter::KiloWattHours)),
    ("/Ac/L1/Power", Some(Formatter::Watts)),
    ("/Ac/L1/Voltage", Some(Formatter::Volts)),
    ("/Ac/L2/Current", Some(Formatter::Amps)),
    ("/Ac/L2/Energy/Forward", Some(Formatter::KiloWattHours)),
    ("/Ac/L2/Energy/Reverse", Some(Formatter::KiloWattHours)),
    ("/Ac/L2/Power", Some(Formatter::Watts)),
    ("/Ac/L2/Voltage", Some(Formatter::Volts)),
    ("/Ac/L3/Current", Some(Formatter::Amps)),
    ("/Ac/L3/Energy/Forward", Some(Formatter::KiloWattHours)),
    ("/Ac/L3/Energy/Reverse", Some(Formatter::KiloWattHours)),
    ("/Ac/L3/Power", Some(Formatter::Watts)),
    ("/Ac/L3/Voltage", Some(Formatter::Volts)),
    ("/Ac/Power", Some(Formatter::Watts)),
    ("/Meter/Model", None),
    ("/Meter/Version", None),
    ("/Gas/Usage", Some(Formatter::CubicMeters)),
    ("/Gas/Timestamp", Some(Formatter::Timestamp)),
];

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub servicebase: String,
    pub poll_interval: Duration,
    pub max_backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Active,
    Terminated,
}

pub fn service_name(servicebase: &str, serial: &str) -> String {
    format!("{servicebase}.homewizard_{serial}")
}

/// Translates one snapshot into path writes. Phases 2 and 3 report power only,
/// so energy totals go to the aggregate and L1 paths.
pub fn map_reading(snapshot: &ReadingSnapshot) -> [(&'static str, Value); 12] {
    let forward = snapshot.import_t1_kwh + snapshot.import_t2_kwh;
    let reverse = snapshot.export_t1_kwh + snapshot.export_t2_kwh;
    [
        ("/Ac/Energy/Forward", Value::Number(forward)),
        ("/Ac/Energy/Reverse", Value::Number(reverse)),
        ("/Ac/L1/Energy/Forward", Value::Number(forward)),
        ("/Ac/L1/Energy/Reverse", Value::Number(reverse)),
        ("/Ac/Power", Value::Number(snapshot.active_power_w)),
        ("/Ac/L1/Power", Value::Number(snapshot.active_power_l1_w)),
        ("/Ac/L2/Power", Value::Number(snapshot.active_power_l2_w)),
        ("/Ac/L3/Power", Value::Number(snapshot.active_power_l3_w)),
        ("/Gas/Usage", Value::Number(snapshot.total_gas_m3)),
        ("/Gas/Timestamp", Value::Integer(snapshot.gas_timestamp)),
        ("/Meter/Model", Value::Text(snapshot.meter_model.clone())),
        ("/Meter/Version", Value::Integer(snapshot.smr_version)),
    ]
}

/// Exponential tick skipping for a meter that keeps failing. Polling never
/// stops; only the spacing between attempts grows.
#[derive(Debug, Clone)]
pub struct Backoff {
    failures: u32,
    max_skip: u32,
}

impl Backoff {
    pub fn new(poll_interval: Duration, max_backoff: Duration) -> Self {
        let period = poll_interval.as_millis().max(1);
        let ticks = (max_backoff.as_millis() / period).max(1);
        Self {
            failures: 0,
            max_skip: u32::try_from(ticks - 1).unwrap_or(u32::MAX),
        }
    }

    /// Records a failure and returns how many ticks to skip before retrying.
    pub fn on_failure(&mut self) -> u32 {
        self.failures = self.failures.saturating_add(1);
        let exponent = (self.failures - 1).min(31);
        let skip = (1u64 << exponent) - 1;
        u32::try_from(skip).unwrap_or(u32::MAX).min(self.max_skip)
    }

    /// Resets the counter, returning the number of failures it held.
    pub fn on_success(&mut self) -> u32 {
        std::mem::take(&mut self.failures)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// One meter on the bus: its identity, its published paths and its poll loop.
pub struct MeterSession {
    host: String,
    identity: DeviceIdentity,
    service_name: String,
    tree: PathTree,
    reader: Arc<dyn DeviceReader>,
    settings: SessionSettings,
    state: SessionState,
}

impl MeterSession {
    /// Fetches the identity and declares the full path catalogue.
    pub async fn initialize(
        host: String,
        reader: Arc<dyn DeviceReader>,
        sinks: &dyn SinkFactory,
        settings: SessionSettings,
    ) -> Result<Self, BridgeError> {
        let identity = reader.fetch_identity(&host).await?;
        let service_name = service_name(&settings.servicebase, &identity.serial);
        info!(%host, service = %service_name, product = %identity.product_type, "Starting meter session");

        let mut tree = PathTree::new(sinks.connect(&service_name)?);
        let identity_values: [(&str, Value); 9] = [
            ("/Mgmt/ProcessName", Value::from(PROCESS_NAME)),
            ("/Mgmt/ProcessVersion", Value::from(PROCESS_VERSION)),
            ("/Mgmt/Connection", Value::from(host.as_str())),
            ("/DeviceInstance", Value::Integer(0)),
            ("/ProductId", Value::Integer(PRODUCT_ID)),
            (
                "/ProductName",
                Value::from(format!("HomeWizard - {}", identity.product_type)),
            ),
            ("/FirmwareVersion", Value::from(identity.firmware_version.as_str())),
            ("/Serial", Value::from(identity.serial.as_str())),
            ("/Connected", Value::Integer(1)),
        ];
        for (path, value) in identity_values {
            tree.declare(path, None)?;
            tree.set_if_changed(path, Some(value))?;
        }
        for (path, formatter) in READING_PATHS {
            tree.declare(path, formatter)?;
        }

        Ok(Self {
            host,
            identity,
            service_name,
            tree,
            reader,
            settings,
            state: SessionState::Active,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn tree(&self) -> &PathTree {
        &self.tree
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Writes the changed values of `snapshot`, returning how many paths were
    /// written. A failed path keeps its old value and is retried on the next
    /// snapshot; the first such error is returned after all paths were tried.
    pub fn apply(&mut self, snapshot: &ReadingSnapshot) -> Result<usize, BridgeError> {
        let mut written = 0;
        let mut first_error = None;
        for (path, value) in map_reading(snapshot) {
            match self.tree.set_if_changed(path, Some(value)) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(service = %self.service_name, path, error = %e, "Failed to write path");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Performs one poll: fetch a snapshot and publish what changed.
    pub async fn poll_once(&mut self) -> Result<usize, BridgeError> {
        let snapshot = self.reader.fetch_reading(&self.host).await?;
        self.apply(&snapshot)
    }

    /// Polls until `shutdown` fires or its sender is dropped. Ticks never
    /// overlap: the next tick is only awaited after the previous poll finished.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = Backoff::new(self.settings.poll_interval, self.settings.max_backoff);
        let mut skip = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            if skip > 0 {
                skip -= 1;
                continue;
            }

            let outcome = tokio::select! {
                _ = shutdown.changed() => break,
                outcome = self.poll_once() => outcome,
            };

            match outcome {
                Ok(written) => {
                    let failures = backoff.on_success();
                    if failures > 0 {
                        info!(service = %self.service_name, failures, "Meter reachable again");
                    }
                    debug!(service = %self.service_name, written, "Poll complete");
                }
                Err(e) if e.is_transient() => {
                    skip = backoff.on_failure();
                    warn!(
                        service = %self.service_name,
                        failures = backoff.failures(),
                        skip,
                        error = %e,
                        "Poll failed"
                    );
                }
                Err(e) => {
                    error!(service = %self.service_name, error = %e, "Failed to publish reading");
                }
            }
        }

        info!(service = %self.service_name, "Meter session stopped");
        self.state = SessionState::Terminated;
        self
    }
}

/// Sent when a spawned session ends without being asked to.
#[derive(Debug)]
pub struct SessionReport {
    pub id: u64,
    pub name: String,
    pub error: BridgeError,
}

/// A session running on its own task.
pub struct SessionHandle {
    id: u64,
    state: watch::Receiver<SessionState>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Spawns initialization and polling for `host`. An initialization failure
    /// is sent on `reports` tagged with `name` and `id`.
    pub fn spawn(
        id: u64,
        name: String,
        host: String,
        reader: Arc<dyn DeviceReader>,
        sinks: Arc<dyn SinkFactory>,
        settings: SessionSettings,
        reports: mpsc::UnboundedSender<SessionReport>,
    ) -> Self {
        let (state_tx, state) = watch::channel(SessionState::Initializing);
        let (shutdown_tx, mut shutdown) = watch::channel(false);

        let task = tokio::spawn(async move {
            let initialized = tokio::select! {
                _ = shutdown.changed() => {
                    state_tx.send_replace(SessionState::Terminated);
                    return;
                }
                initialized = MeterSession::initialize(host, reader, sinks.as_ref(), settings) => initialized,
            };

            match initialized {
                Ok(session) => {
                    state_tx.send_replace(SessionState::Active);
                    session.run(shutdown).await;
                }
                Err(error) => {
                    error!(%name, error = %error, "Meter session failed to start");
                    let _ = reports.send(SessionReport { id, name, error });
                }
            }
            state_tx.send_replace(SessionState::Terminated);
        });

        Self {
            id,
            state,
            shutdown_tx,
            task,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Stops the poll loop, cancelling any in-flight read, and waits for the task.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Meter session task ended abnormally");
        }
    }
}
