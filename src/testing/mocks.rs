//! Mock implementations for testing
//!
//! Provides a mock [`Transport`] that records every publish and subscription
//! and lets tests inject transport events, so device behaviour can be
//! exercised without a broker.

use crate::error::DeviceError;
use crate::protocol::Envelope;
use crate::transport::{PublishOptions, QoS, Transport, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, Mutex};

/// A message captured by [`MockTransport::publish`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishedMessage {
    /// Decode the payload as a management envelope
    pub fn envelope(&self) -> Option<Envelope> {
        Envelope::parse(&self.payload).ok()
    }
}

/// Mock transport for testing
///
/// Clones share their recorders, so a test can keep one handle while the
/// device owns another.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    pub unsubscriptions: Arc<Mutex<Vec<String>>>,
    pub ended: Arc<Mutex<Option<bool>>>,
    pub fail_publish: bool,
    pub fail_subscribe: bool,
    event_sender: Arc<StdMutex<Option<mpsc::UnboundedSender<TransportEvent>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publish_failure() -> Self {
        Self {
            fail_publish: true,
            ..Default::default()
        }
    }

    pub fn with_subscribe_failure() -> Self {
        Self {
            fail_subscribe: true,
            ..Default::default()
        }
    }

    /// Inject a transport event as if it came from the broker connection
    pub fn emit(&self, event: TransportEvent) -> bool {
        let sender = self
            .event_sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Inject an inbound message
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        self.emit(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        })
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    /// Published messages decoded as envelopes, skipping non-envelope payloads
    pub async fn get_published_envelopes(&self) -> Vec<(String, Envelope)> {
        self.published_messages
            .lock()
            .await
            .iter()
            .filter_map(|message| {
                message
                    .envelope()
                    .map(|envelope| (message.topic.clone(), envelope))
            })
            .collect()
    }

    pub async fn get_subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().await.clone()
    }

    pub async fn get_unsubscriptions(&self) -> Vec<String> {
        self.unsubscriptions.lock().await.clone()
    }

    /// `Some(force)` once `end` was called
    pub async fn ended_with(&self) -> Option<bool> {
        *self.ended.lock().await
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = DeviceError;

    async fn connect(&self) -> Result<(), Self::Error> {
        self.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), Self::Error> {
        if self.fail_publish {
            return Err(DeviceError::internal("Mock publish failure"));
        }

        self.published_messages.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos: options.qos,
            retain: options.retain,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), Self::Error> {
        if self.fail_subscribe {
            return Err(DeviceError::internal("Mock subscribe failure"));
        }

        self.subscriptions.lock().await.push((topic.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), Self::Error> {
        self.unsubscriptions.lock().await.push(topic.to_string());
        Ok(())
    }

    async fn end(&self, force: bool) -> Result<(), Self::Error> {
        *self.ended.lock().await = Some(force);
        self.emit(TransportEvent::Closed);
        Ok(())
    }

    fn set_event_sender(&self, sender: mpsc::UnboundedSender<TransportEvent>) {
        *self
            .event_sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }
}
