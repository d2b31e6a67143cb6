//! Device management client
//!
//! A device-side client for a publish/subscribe management protocol carried
//! over MQTT.
//!
//! # Overview
//!
//! This crate provides:
//! - Topic namespace rules separating reserved management topics from application topics
//! - The JSON management envelope and its message types
//! - An MQTT transport with reconnection and SUBACK confirmation
//! - Correlation of device-initiated requests with their responses, with timeouts
//! - Dispatch of CONTROL and CONFIG requests to handlers or application notifications
//!
//! # Quick Start
//!
//! ```rust
//! use devmgmt_client::protocol::{compose_event_topic, Envelope, MessageType};
//!
//! let topic = compose_event_topic("thermostat", "temperature", Some("kitchen")).unwrap();
//! assert_eq!(topic, "thermostat/temperature/kitchen");
//!
//! let envelope = Envelope::request(MessageType::Status, "thermo-01");
//! let payload = envelope.to_payload().unwrap();
//! assert!(String::from_utf8(payload).unwrap().contains("\"STATUS\""));
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod management;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, DeviceConfig};
pub use device::{Device, DeviceBuilder, DeviceEvent};
pub use error::{DeviceError, DeviceResult};
pub use management::{Done, ManagementState, PendingReply, Reply};
pub use protocol::{Envelope, MessageType, ValidationError};
pub use transport::{MqttTransport, PublishOptions, QoS, Transport, TransportEvent};
