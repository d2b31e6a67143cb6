//! Transport layer for device communication
//!
//! This module provides the publish/subscribe transport abstraction consumed
//! by the device, and its MQTT implementation.

use bytes::Bytes;
use tokio::sync::mpsc;

pub mod mqtt;

pub use rumqttc::v5::mqttbytes::QoS;

/// Lifecycle and delivery events reported by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Broker acknowledged the connection
    Connected,
    /// Connection closed
    Closed,
    /// Transport is about to retry the connection
    Reconnecting,
    /// Transport gave up or lost the network
    Offline,
    /// Non-fatal transport failure
    Error(String),
    /// Message delivered on a subscribed topic
    Message { topic: String, payload: Bytes },
}

/// Delivery options for a single publish
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }
}

impl PublishOptions {
    /// At-least-once, not retained: used for management traffic
    pub fn management() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }

    pub fn with_qos(qos: QoS) -> Self {
        Self { qos, retain: false }
    }
}

/// Transport trait for device communication
///
/// This trait provides an abstraction over the publish/subscribe client
/// (primarily MQTT) to enable dependency injection and testing. Inbound
/// messages and lifecycle changes are delivered through the event sender.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the broker
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Publish a payload to a topic
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), Self::Error>;

    /// Subscribe to a topic filter, resolving once the broker confirms it
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), Self::Error>;

    /// Remove a subscription
    async fn unsubscribe(&self, topic: &str) -> Result<(), Self::Error>;

    /// Close the connection; `force` skips flushing queued publishes
    async fn end(&self, force: bool) -> Result<(), Self::Error>;

    /// Set the sender receiving lifecycle events and inbound messages
    fn set_event_sender(&self, sender: mpsc::UnboundedSender<TransportEvent>);
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;
