use crate::error::BridgeError;
use crate::path_tree::Value;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::json;
use std::env;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

/// Materialises path declarations and writes onto the monitoring bus.
pub trait PublishSink: Send {
    fn declare(&mut self, path: &str) -> Result<(), BridgeError>;
    fn write(&mut self, path: &str, value: Option<&Value>, text: &str) -> Result<(), BridgeError>;
}

/// Produces one sink per bus service. Chosen once at process start and shared
/// by every session.
pub trait SinkFactory: Send + Sync {
    fn connect(&self, service_name: &str) -> Result<Box<dyn PublishSink>, BridgeError>;
}

/// Which bus connection a service registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
}

impl BusKind {
    pub fn from_env() -> Self {
        Self::detect(env::var("DBUS_SESSION_BUS_ADDRESS").ok().as_deref())
    }

    fn detect(session_address: Option<&str>) -> Self {
        match session_address {
            Some(address) if !address.is_empty() => BusKind::Session,
            _ => BusKind::System,
        }
    }
}

pub struct LogSinkFactory {
    bus: BusKind,
}

impl LogSinkFactory {
    pub fn new(bus: BusKind) -> Self {
        Self { bus }
    }
}

impl SinkFactory for LogSinkFactory {
    fn connect(&self, service_name: &str) -> Result<Box<dyn PublishSink>, BridgeError> {
        info!(bus = ?self.bus, service = %service_name, "Registering service");
        Ok(Box::new(LogSink {
            bus: self.bus,
            service: service_name.to_string(),
        }))
    }
}

/// Writes every publication to the log.
struct LogSink {
    bus: BusKind,
    service: String,
}

impl PublishSink for LogSink {
    fn declare(&mut self, path: &str) -> Result<(), BridgeError> {
        debug!(bus = ?self.bus, service = %self.service, path, "Declared path");
        Ok(())
    }

    fn write(&mut self, path: &str, value: Option<&Value>, text: &str) -> Result<(), BridgeError> {
        debug!(bus = ?self.bus, service = %self.service, path, ?value, text, "Path updated");
        Ok(())
    }
}

/// A single path write as seen by the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub service: String,
    pub path: String,
    pub value: Option<Value>,
    pub text: String,
}

/// Forwards writes over a channel, for embedding the bridge in another process.
pub struct ChannelSink {
    service: String,
    output: UnboundedSender<Publication>,
}

impl ChannelSink {
    pub fn new(service: String, output: UnboundedSender<Publication>) -> Self {
        Self { service, output }
    }
}

impl PublishSink for ChannelSink {
    fn declare(&mut self, _path: &str) -> Result<(), BridgeError> {
        Ok(())
    }

    fn write(&mut self, path: &str, value: Option<&Value>, text: &str) -> Result<(), BridgeError> {
        self.output
            .send(Publication {
                service: self.service.clone(),
                path: path.to_string(),
                value: value.cloned(),
                text: text.to_string(),
            })
            .map_err(|e| BridgeError::Sink(format!("publication receiver dropped: {e}")))
    }
}

pub struct ChannelSinkFactory {
    output: UnboundedSender<Publication>,
}

impl ChannelSinkFactory {
    pub fn new(output: UnboundedSender<Publication>) -> Self {
        Self { output }
    }
}

impl SinkFactory for ChannelSinkFactory {
    fn connect(&self, service_name: &str) -> Result<Box<dyn PublishSink>, BridgeError> {
        Ok(Box::new(ChannelSink::new(
            service_name.to_string(),
            self.output.clone(),
        )))
    }
}

/// Publishes retained JSON documents to an MQTT broker, one topic per path.
///
/// Writes are queued without bound and forwarded by a task that waits on the
/// client, so a slow or absent broker never fails a write.
pub struct MqttSinkFactory {
    queue: UnboundedSender<(String, String)>,
}

impl MqttSinkFactory {
    /// Connects to the broker and drives its event loop on a background task.
    pub fn new(client_id: &str, host: &str, port: u16) -> Self {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(5));
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let broker = format!("{host}:{port}");
        tokio::spawn(async move {
            info!(%broker, "Starting MQTT event loop");
            loop {
                if let Err(e) = eventloop.poll().await {
                    warn!(%broker, error = %e, "MQTT connection error, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });

        let (queue, mut pending) = mpsc::unbounded_channel::<(String, String)>();
        tokio::spawn(async move {
            while let Some((topic, payload)) = pending.recv().await {
                if let Err(e) = client.publish(topic, QoS::AtLeastOnce, true, payload).await {
                    warn!(error = %e, "MQTT event loop gone, dropping publications");
                    break;
                }
            }
        });

        Self { queue }
    }
}

impl SinkFactory for MqttSinkFactory {
    fn connect(&self, service_name: &str) -> Result<Box<dyn PublishSink>, BridgeError> {
        Ok(Box::new(MqttSink {
            queue: self.queue.clone(),
            topic_base: topic_base(service_name),
        }))
    }
}

struct MqttSink {
    queue: UnboundedSender<(String, String)>,
    topic_base: String,
}

impl PublishSink for MqttSink {
    // The first write creates the topic.
    fn declare(&mut self, _path: &str) -> Result<(), BridgeError> {
        Ok(())
    }

    fn write(&mut self, path: &str, value: Option<&Value>, text: &str) -> Result<(), BridgeError> {
        let payload = json!({ "value": value, "text": text }).to_string();
        self.queue
            .send((format!("{}{}", self.topic_base, path), payload))
            .map_err(|_| BridgeError::Sink("MQTT forwarder stopped".to_string()))
    }
}

fn topic_base(service_name: &str) -> String {
    service_name.replace('.', "/")
}
