//! HomeWizard P1 Bridge Library
//!
//! Discovers HomeWizard P1 meters on the local network (or uses a fixed host),
//! polls their local HTTP API and publishes the readings as a grid meter
//! service, writing only the values that changed.

pub mod bridge;
pub mod config;
pub mod device_reader;
pub mod discovery;
pub mod error;
pub mod meter_session;
pub mod path_tree;
pub mod publish_sink;

// Re-export commonly used types for easier access
pub use bridge::Bridge;
pub use config::{Args, BridgeConfig, RemovalPolicy};
pub use device_reader::{DeviceIdentity, DeviceReader, HomeWizardClient, ReadingSnapshot};
pub use discovery::{DiscoveredService, DiscoveryCoordinator, DiscoveryEvent, DiscoveryProvider};
pub use error::{BridgeError, PathTreeError};
pub use meter_session::{MeterSession, SessionState};
pub use path_tree::{Formatter, PathTree, Value};
pub use publish_sink::{PublishSink, SinkFactory};
