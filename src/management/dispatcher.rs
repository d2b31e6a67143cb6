//! Inbound router for management envelopes
//!
//! Responses resolve pending transactions. Requests go to the registered
//! handler, or to the application as a notification carrying a [`Done`]
//! continuation. A request with an `id` gets exactly one response envelope
//! regardless of which path answered it.

use super::handlers::{ConfigResponder, ConfigUpdate, ControlResponder, Responder};
use super::reply::{Done, Reply, ReplyResult};
use super::transactions::TransactionTable;
use crate::device::events::{ConfigRequest, ControlRequest, DeviceEvent};
use crate::error::{sanitize_error_message, DeviceError, DeviceResult};
use crate::protocol::{
    ConfigData, ControlData, CorrelationId, Envelope, EnvelopeKind, MessageType, MANAGEMENT_TOPIC,
};
use crate::transport::{PublishOptions, Transport};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn, Instrument};

/// Error text for operations a handler does not implement
pub const UNSUPPORTED_OPERATION: &str = "Unsupported operation";

/// Where and how to answer one request
///
/// Sending consumes the sink, so a request can be answered only once.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSink {
    pub topic: String,
    pub ack: CorrelationId,
}

impl ResponseSink {
    /// Sink for a request, if it asked for a reply
    pub fn for_request(envelope: &Envelope) -> Option<Self> {
        envelope.id.map(|ack| ResponseSink {
            topic: envelope
                .replyto
                .clone()
                .unwrap_or_else(|| MANAGEMENT_TOPIC.to_string()),
            ack,
        })
    }

    pub fn envelope(&self, from: &str, result: ReplyResult) -> Envelope {
        match result {
            Ok(data) => Envelope::response_ok(from, self.ack, data),
            Err(message) => {
                Envelope::response_error(from, self.ack, sanitize_error_message(&message))
            }
        }
    }

    pub async fn send<T: Transport>(
        self,
        transport: &T,
        from: &str,
        result: ReplyResult,
    ) -> DeviceResult<()> {
        let payload = self
            .envelope(from, result)
            .to_payload()
            .map_err(|e| DeviceError::protocol(format!("Failed to encode response: {e}")))?;
        transport
            .publish(&self.topic, payload, PublishOptions::management())
            .await
            .map_err(DeviceError::transport)?;
        debug!(topic = %self.topic, ack = self.ack, "Published response");
        Ok(())
    }
}

/// Routing decision for one parsed envelope
#[derive(Debug, Clone, PartialEq)]
pub enum ManagementRoute {
    Response {
        ack: CorrelationId,
        result: ReplyResult,
    },
    Control {
        data: ControlData,
        reply: Option<ResponseSink>,
    },
    Config {
        data: ConfigData,
        reply: Option<ResponseSink>,
    },
    Rejected {
        reason: String,
        reply: Option<ResponseSink>,
    },
}

/// Decide how an envelope is handled
pub fn classify(envelope: Envelope) -> ManagementRoute {
    if let (EnvelopeKind::Response, Some(ack)) = (envelope.kind(), envelope.ack) {
        return ManagementRoute::Response {
            ack,
            result: envelope.into_outcome(),
        };
    }

    let reply = ResponseSink::for_request(&envelope);
    let data = envelope.data.unwrap_or(Value::Null);
    match envelope.message_type {
        MessageType::Control => match serde_json::from_value::<ControlData>(data) {
            Ok(data) => ManagementRoute::Control { data, reply },
            Err(e) => ManagementRoute::Rejected {
                reason: format!("Bad CONTROL data: {e}"),
                reply,
            },
        },
        MessageType::Config => match serde_json::from_value::<ConfigData>(data) {
            Ok(data) => ManagementRoute::Config { data, reply },
            Err(e) => ManagementRoute::Rejected {
                reason: format!("Bad CONFIG data: {e}"),
                reply,
            },
        },
        other => ManagementRoute::Rejected {
            reason: format!("Unsupported message type: {other}"),
            reply,
        },
    }
}

/// What happened to one inbound payload
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Response matched (or not) against the transaction table
    Resolved { ack: CorrelationId, matched: bool },
    /// Answered by a registered handler
    Handled(MessageType),
    /// Forwarded to the application as a notification
    Notified(MessageType),
    /// Refused; an error response was sent if one was owed
    Rejected { reason: String },
    /// Not a valid envelope; dropped
    Malformed,
}

/// Routes management traffic arriving on the device inbox
pub struct ManagementDispatcher<T: Transport> {
    device_id: String,
    transport: Arc<T>,
    transactions: TransactionTable,
    control: Option<ControlResponder>,
    config: Option<ConfigResponder>,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl<T: Transport + 'static> ManagementDispatcher<T> {
    pub fn new(
        device_id: &str,
        transport: Arc<T>,
        transactions: TransactionTable,
        control: Option<ControlResponder>,
        config: Option<ConfigResponder>,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            transport,
            transactions,
            control,
            config,
            events,
        }
    }

    /// Handle one payload received on the device inbox
    pub async fn dispatch(&self, payload: &[u8]) -> DispatchOutcome {
        let envelope = match Envelope::parse(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(device_id = %self.device_id, error = %e, "Dropping malformed management message");
                return DispatchOutcome::Malformed;
            }
        };

        let span = crate::management_span!(
            device_id = %self.device_id,
            message_type = %envelope.message_type,
            id = ?envelope.id,
            ack = ?envelope.ack
        );
        self.route(envelope).instrument(span).await
    }

    async fn route(&self, envelope: Envelope) -> DispatchOutcome {
        let message_type = envelope.message_type.clone();

        match classify(envelope) {
            ManagementRoute::Response { ack, result } => {
                let matched = self
                    .transactions
                    .resolve(ack, result.map_err(DeviceError::remote));
                if !matched {
                    debug!(ack, "Ignoring response with no pending transaction");
                }
                DispatchOutcome::Resolved { ack, matched }
            }
            ManagementRoute::Control { data, reply } => match &self.control {
                Some(Responder::Handler(handler)) => {
                    let outcome = handler.on_control(&data.name, data.args);
                    self.deliver(reply, outcome).await;
                    DispatchOutcome::Handled(message_type)
                }
                // Without a handler the application answers through `done`
                Some(Responder::Notify) | None => {
                    let (done, outcome) = Done::channel();
                    self.emit(DeviceEvent::Control(ControlRequest {
                        name: data.name,
                        args: data.args,
                        done,
                    }));
                    if reply.is_some() {
                        self.deliver(reply, outcome).await;
                    }
                    DispatchOutcome::Notified(message_type)
                }
            },
            ManagementRoute::Config { data, reply } => {
                let update = ConfigUpdate::Entry {
                    name: data.name,
                    value: data.value,
                };
                match &self.config {
                    Some(Responder::Handler(handler)) => {
                        let outcome = handler.on_config(update);
                        self.deliver(reply, outcome).await;
                        DispatchOutcome::Handled(message_type)
                    }
                    Some(Responder::Notify) | None => {
                        let (done, outcome) = Done::channel();
                        self.emit(DeviceEvent::Config(ConfigRequest { update, done }));
                        if reply.is_some() {
                            self.deliver(reply, outcome).await;
                        }
                        DispatchOutcome::Notified(message_type)
                    }
                }
            }
            ManagementRoute::Rejected { reason, reply } => self.reject(reply, reason).await,
        }
    }

    /// Feed configuration pulled with LOADCONFIG to the config responder
    ///
    /// Returns false if the device has no config responder.
    pub async fn apply_config_snapshot(&self, snapshot: Value) -> bool {
        match &self.config {
            Some(Responder::Handler(handler)) => {
                let outcome = handler.on_config(ConfigUpdate::Snapshot(snapshot));
                self.deliver(None, outcome).await;
                true
            }
            Some(Responder::Notify) => {
                let (done, _outcome) = Done::channel();
                self.emit(DeviceEvent::Config(ConfigRequest {
                    update: ConfigUpdate::Snapshot(snapshot),
                    done,
                }));
                true
            }
            None => false,
        }
    }

    async fn reject(&self, reply: Option<ResponseSink>, reason: String) -> DispatchOutcome {
        match reply {
            Some(sink) => {
                debug!(%reason, ack = sink.ack, "Rejecting management request");
                send_response(
                    self.transport.as_ref(),
                    &self.device_id,
                    &self.events,
                    sink,
                    Err(reason.clone()),
                )
                .await;
            }
            None => debug!(%reason, "Dropping management request without reply address"),
        }
        DispatchOutcome::Rejected { reason }
    }

    /// Publish the outcome of a handler once it is available
    ///
    /// Ready outcomes are published before returning; pending ones are awaited
    /// on a separate task so the next inbound message is not held up.
    async fn deliver(&self, reply: Option<ResponseSink>, outcome: Reply) {
        match outcome {
            Reply::Ready(result) => {
                if let Some(sink) = reply {
                    send_response(
                        self.transport.as_ref(),
                        &self.device_id,
                        &self.events,
                        sink,
                        result,
                    )
                    .await;
                }
            }
            Reply::Pending(future) => {
                let transport = self.transport.clone();
                let device_id = self.device_id.clone();
                let events = self.events.clone();
                tokio::spawn(
                    async move {
                        let result = future.await;
                        match reply {
                            Some(sink) => {
                                send_response(transport.as_ref(), &device_id, &events, sink, result)
                                    .await
                            }
                            None => debug!(ok = result.is_ok(), "Handler finished"),
                        }
                    }
                    .in_current_span(),
                );
            }
        }
    }

    fn emit(&self, event: DeviceEvent) {
        if self.events.send(event).is_err() {
            debug!(device_id = %self.device_id, "Device event receiver dropped");
        }
    }
}

async fn send_response<T: Transport>(
    transport: &T,
    device_id: &str,
    events: &mpsc::UnboundedSender<DeviceEvent>,
    sink: ResponseSink,
    result: ReplyResult,
) {
    if let Err(e) = sink.send(transport, device_id, result).await {
        warn!(device_id, error = %e, "Failed to publish management response");
        let _ = events.send(DeviceEvent::Error(e));
    }
}
