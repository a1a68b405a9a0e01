use crate::config::RemovalPolicy;
use crate::device_reader::DeviceReader;
use crate::error::BridgeError;
use crate::meter_session::{SessionHandle, SessionReport, SessionSettings, SessionState};
use crate::publish_sink::SinkFactory;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const SERVICE_TYPE: &str = "_hwenergy._tcp.local.";
pub const SUPPORTED_PRODUCT_TYPE: &str = "HWE-P1";

/// A resolved advertisement.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredService {
    pub name: String,
    /// Address the device API is reached on, `ip` or `ip:port`.
    pub host: String,
    pub properties: HashMap<String, String>,
}

impl DiscoveredService {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Found(DiscoveredService),
    Updated(DiscoveredService),
    Removed(String),
}

/// Source of advertisement events.
pub trait DiscoveryProvider: Send {
    fn start(&mut self) -> Result<mpsc::Receiver<DiscoveryEvent>, BridgeError>;
    fn stop(&mut self);
}

/// Browses the local network for HomeWizard energy advertisements.
pub struct MdnsProvider {
    service_type: String,
    daemon: Option<ServiceDaemon>,
}

impl Default for MdnsProvider {
    fn default() -> Self {
        Self::new(SERVICE_TYPE)
    }
}

impl MdnsProvider {
    pub fn new(service_type: &str) -> Self {
        Self {
            service_type: service_type.to_string(),
            daemon: None,
        }
    }
}

impl DiscoveryProvider for MdnsProvider {
    fn start(&mut self) -> Result<mpsc::Receiver<DiscoveryEvent>, BridgeError> {
        let daemon = ServiceDaemon::new().map_err(|e| BridgeError::Discovery(e.to_string()))?;
        let browse = daemon
            .browse(&self.service_type)
            .map_err(|e| BridgeError::Discovery(e.to_string()))?;
        self.daemon = Some(daemon);

        let (tx, rx) = mpsc::channel(32);
        let service_type = self.service_type.clone();
        tokio::spawn(async move {
            info!(%service_type, "Browsing for meters");
            let mut resolved = HashSet::new();
            while let Ok(event) = browse.recv_async().await {
                let Some(event) = translate(&mut resolved, event) else {
                    continue;
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            info!(%service_type, "mDNS browse ended");
        });

        Ok(rx)
    }

    fn stop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            if let Err(e) = daemon.shutdown() {
                warn!(error = %e, "Failed to shut down mDNS daemon");
            }
        }
    }
}

/// Maps a browse event onto a discovery event. `resolved` holds the names
/// already reported as found.
fn translate(resolved: &mut HashSet<String>, event: ServiceEvent) -> Option<DiscoveryEvent> {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            let service = to_discovered_service(&info);
            if resolved.insert(service.name.clone()) {
                Some(DiscoveryEvent::Found(service))
            } else {
                Some(DiscoveryEvent::Updated(service))
            }
        }
        ServiceEvent::ServiceRemoved(_, fullname) => {
            resolved.remove(&fullname);
            Some(DiscoveryEvent::Removed(fullname))
        }
        other => {
            debug!(event = ?other, "Ignoring mDNS event");
            None
        }
    }
}

fn to_discovered_service(info: &ServiceInfo) -> DiscoveredService {
    let properties = info
        .get_properties()
        .iter()
        .map(|property| (property.key().to_string(), property.val_str().to_string()))
        .collect();
    let addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    DiscoveredService {
        name: info.get_fullname().to_string(),
        host: api_host(&addresses, info.get_hostname(), info.get_port()),
        properties,
    }
}

/// Picks the address to reach the API on, preferring IPv4 and falling back
/// to the advertised hostname.
fn api_host(addresses: &[IpAddr], hostname: &str, port: u16) -> String {
    let address = addresses
        .iter()
        .find(|address| address.is_ipv4())
        .or_else(|| addresses.first());
    let base = match address {
        Some(IpAddr::V4(v4)) => v4.to_string(),
        Some(IpAddr::V6(v6)) => format!("[{v6}]"),
        None => hostname.trim_end_matches('.').to_string(),
    };
    if port == 80 || port == 0 {
        base
    } else {
        format!("{base}:{port}")
    }
}

/// Rejects advertisements without the local API enabled or of another product.
pub fn check_supported(service: &DiscoveredService) -> Result<(), BridgeError> {
    let unsupported = |reason: String| BridgeError::UnsupportedDevice {
        name: service.name.clone(),
        reason,
    };
    match service.property("api_enabled") {
        Some("1") => {}
        other => return Err(unsupported(format!("API is not enabled (api_enabled={other:?})"))),
    }
    match service.property("product_type") {
        Some(SUPPORTED_PRODUCT_TYPE) => Ok(()),
        other => Err(unsupported(format!("product {other:?} not supported"))),
    }
}

/// Keeps one meter session per advertised device.
pub struct DiscoveryCoordinator {
    reader: Arc<dyn DeviceReader>,
    sinks: Arc<dyn SinkFactory>,
    settings: SessionSettings,
    policy: RemovalPolicy,
    sessions: HashMap<String, SessionHandle>,
    next_id: u64,
    reports_tx: mpsc::UnboundedSender<SessionReport>,
    reports_rx: mpsc::UnboundedReceiver<SessionReport>,
}

impl DiscoveryCoordinator {
    pub fn new(
        reader: Arc<dyn DeviceReader>,
        sinks: Arc<dyn SinkFactory>,
        settings: SessionSettings,
        policy: RemovalPolicy,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            reader,
            sinks,
            settings,
            policy,
            sessions: HashMap::new(),
            next_id: 0,
            reports_tx,
            reports_rx,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_state(&self, name: &str) -> Option<SessionState> {
        self.sessions.get(name).map(SessionHandle::state)
    }

    /// Applies one discovery event. Only a lost device under
    /// [`RemovalPolicy::Exit`] produces an error. An update for a device
    /// without a session registers it, so a meter whose session ended is
    /// retried on its next advertisement.
    pub async fn handle_event(&mut self, event: DiscoveryEvent) -> Result<(), BridgeError> {
        match event {
            DiscoveryEvent::Found(service) => {
                self.register(service);
                Ok(())
            }
            DiscoveryEvent::Updated(service) => {
                if self.sessions.contains_key(&service.name) {
                    debug!(name = %service.name, "Service updated");
                } else {
                    self.register(service);
                }
                Ok(())
            }
            DiscoveryEvent::Removed(name) => {
                info!(%name, "Service removed");
                self.lose(name).await
            }
        }
    }

    fn register(&mut self, service: DiscoveredService) {
        info!(name = %service.name, host = %service.host, "Service found");
        if let Err(e) = check_supported(&service) {
            warn!(error = %e, "Ignoring device");
            return;
        }
        if self.sessions.contains_key(&service.name) {
            debug!(name = %service.name, "Session already registered");
            return;
        }

        self.next_id += 1;
        let handle = SessionHandle::spawn(
            self.next_id,
            service.name.clone(),
            service.host,
            self.reader.clone(),
            self.sinks.clone(),
            self.settings.clone(),
            self.reports_tx.clone(),
        );
        self.sessions.insert(service.name, handle);
    }

    async fn lose(&mut self, name: String) -> Result<(), BridgeError> {
        if !self.sessions.contains_key(&name) {
            debug!(%name, "No session for removed service");
            return Ok(());
        }
        match self.policy {
            RemovalPolicy::Exit => Err(BridgeError::SessionLost { name }),
            RemovalPolicy::Teardown => {
                if let Some(handle) = self.sessions.remove(&name) {
                    handle.stop().await;
                }
                Ok(())
            }
        }
    }

    async fn handle_report(&mut self, report: SessionReport) -> Result<(), BridgeError> {
        let current = self.sessions.get(&report.name).map(SessionHandle::id);
        if current != Some(report.id) {
            debug!(name = %report.name, "Ignoring report from a replaced session");
            return Ok(());
        }
        self.lose(report.name).await
    }

    /// Consumes events until shutdown, the end of the event stream, or a lost
    /// device under [`RemovalPolicy::Exit`]. All sessions are stopped on return.
    pub async fn run(
        &mut self,
        mut events: mpsc::Receiver<DiscoveryEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BridgeError> {
        let result = loop {
            tokio::select! {
                _ = shutdown.changed() => break Ok(()),
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            break Err(e);
                        }
                    }
                    None => {
                        warn!("Discovery event stream closed");
                        break Ok(());
                    }
                },
                Some(report) = self.reports_rx.recv() => {
                    if let Err(e) = self.handle_report(report).await {
                        break Err(e);
                    }
                }
            }
        };

        self.stop_all().await;
        result
    }

    pub async fn stop_all(&mut self) {
        for (name, handle) in self.sessions.drain() {
            debug!(%name, "Stopping session");
            handle.stop().await;
        }
    }
}
