//! Device facade
//!
//! A [`Device`] wraps a [`Transport`] with the namespace rules and the
//! management protocol. Build one with [`DeviceBuilder`], keep the returned
//! event receiver, then call [`Device::connect`].
//!
//! ```rust,no_run
//! use devmgmt_client::device::{DeviceBuilder, DeviceEvent};
//! use devmgmt_client::management::Reply;
//! use devmgmt_client::testing::MockTransport;
//! use serde_json::Value;
//!
//! # tokio_test::block_on(async {
//! let (device, mut events) = DeviceBuilder::new("thermo-01")
//!     .device_type("thermostat")
//!     .register_control_handler(|name: &str, _args: Vec<Value>| match name {
//!         "ping" => Reply::ok("pong"),
//!         _ => Reply::error("unknown control"),
//!     })
//!     .build(MockTransport::new())?;
//!
//! device.connect().await?;
//! while let Some(event) = events.recv().await {
//!     if let DeviceEvent::ManagementActive = event {
//!         device.report_status("battery", 80.into()).await?;
//!     }
//! }
//! # Ok::<(), devmgmt_client::DeviceError>(())
//! # });
//! ```

pub mod events;
mod event_loop;

pub use events::{ConfigRequest, ControlRequest, DeviceEvent};

use crate::error::{DeviceError, DeviceResult};
use crate::management::{
    ConfigHandler, ConfigResponder, ControlHandler, ControlResponder, DeviceRole,
    ManagementDispatcher, ManagementState, PendingReply, Responder, TransactionTable,
};
use crate::protocol::{
    compose_event_topic, device_inbox_topic, validate_application_topic, validate_device_id,
    validate_identity, Envelope, MessageType, Registration, StatusData, ValidationError,
    MANAGEMENT_TOPIC,
};
use crate::transport::{PublishOptions, QoS, Transport};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default deadline for device-initiated requests
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(60);

const CLOSE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Builder for [`Device`]
pub struct DeviceBuilder {
    id: String,
    device_type: Option<String>,
    initial_load: bool,
    transaction_timeout: Duration,
    control: Option<ControlResponder>,
    config: Option<ConfigResponder>,
}

impl DeviceBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            device_type: None,
            initial_load: false,
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            control: None,
            config: None,
        }
    }

    /// Device type used for REGIST metadata and event topics
    pub fn device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    /// Pull configuration with LOADCONFIG as soon as the device is managed
    pub fn initial_load(mut self, initial_load: bool) -> Self {
        self.initial_load = initial_load;
        self
    }

    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn register_control_handler<H>(mut self, handler: H) -> Self
    where
        H: ControlHandler + 'static,
    {
        let handler: Arc<dyn ControlHandler> = Arc::new(handler);
        self.control = Some(Responder::Handler(handler));
        self
    }

    pub fn register_config_handler<H>(mut self, handler: H) -> Self
    where
        H: ConfigHandler + 'static,
    {
        let handler: Arc<dyn ConfigHandler> = Arc::new(handler);
        self.config = Some(Responder::Handler(handler));
        self
    }

    /// Deliver CONTROL requests as [`DeviceEvent::Control`] instead of a handler
    pub fn control_notifications(mut self) -> Self {
        self.control = Some(Responder::Notify);
        self
    }

    /// Deliver CONFIG requests as [`DeviceEvent::Config`] instead of a handler
    pub fn config_notifications(mut self) -> Self {
        self.config = Some(Responder::Notify);
        self
    }

    /// Validate the identity and assemble the device
    pub fn build<T>(
        self,
        transport: T,
    ) -> DeviceResult<(Device<T>, mpsc::UnboundedReceiver<DeviceEvent>)>
    where
        T: Transport + 'static,
    {
        validate_device_id(&self.id)?;
        if let Some(device_type) = &self.device_type {
            validate_identity(device_type)?;
        }
        if self.transaction_timeout.is_zero() {
            return Err(DeviceError::precondition(
                "transaction timeout must be greater than zero",
            ));
        }

        let role = DeviceRole::from_capabilities(self.control.is_some(), self.config.is_some());
        let initial_load = if self.initial_load && self.config.is_none() {
            warn!(device_id = %self.id, "initial_load requested without a config responder; ignoring");
            false
        } else {
            self.initial_load
        };

        let transport = Arc::new(transport);
        let transactions = TransactionTable::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ManagementState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        let dispatcher = ManagementDispatcher::new(
            &self.id,
            transport.clone(),
            transactions.clone(),
            self.control,
            self.config,
            events_tx.clone(),
        );

        let core = DeviceCore {
            inbox: device_inbox_topic(&self.id),
            id: self.id,
            device_type: self.device_type,
            role,
            initial_load,
            transaction_timeout: self.transaction_timeout,
            transport,
            transactions,
            dispatcher,
            events: events_tx,
            state_tx,
        };

        Ok((
            Device {
                core: Arc::new(core),
                state_rx,
                shutdown_tx,
                event_loop: Mutex::new(None),
            },
            events_rx,
        ))
    }
}

/// State shared by the device handle and its event loop
pub(crate) struct DeviceCore<T: Transport + 'static> {
    pub(crate) id: String,
    pub(crate) device_type: Option<String>,
    pub(crate) role: DeviceRole,
    pub(crate) initial_load: bool,
    pub(crate) transaction_timeout: Duration,
    pub(crate) inbox: String,
    pub(crate) transport: Arc<T>,
    pub(crate) transactions: TransactionTable,
    pub(crate) dispatcher: ManagementDispatcher<T>,
    pub(crate) events: mpsc::UnboundedSender<DeviceEvent>,
    pub(crate) state_tx: watch::Sender<ManagementState>,
}

impl<T: Transport + 'static> DeviceCore<T> {
    pub(crate) fn state(&self) -> ManagementState {
        *self.state_tx.borrow()
    }

    pub(crate) fn set_state(&self, state: ManagementState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(device_id = %self.id, from = %previous, to = %state, "Device state changed");
        }
    }

    pub(crate) fn emit(&self, event: DeviceEvent) {
        if self.events.send(event).is_err() {
            debug!(device_id = %self.id, "Device event receiver dropped");
        }
    }

    /// Publish a device-initiated envelope on the management topic
    pub(crate) async fn publish_management(&self, envelope: &Envelope) -> DeviceResult<()> {
        let payload = envelope
            .to_payload()
            .map_err(|e| DeviceError::protocol(format!("Failed to encode envelope: {e}")))?;
        self.transport
            .publish(MANAGEMENT_TOPIC, payload, PublishOptions::management())
            .await
            .map_err(DeviceError::transport)
    }

    pub(crate) fn registration_envelope(&self) -> Envelope {
        let registration = Registration {
            device_type: self.device_type.clone(),
            capabilities: self.role.capabilities(),
        };
        Envelope::request(MessageType::Regist, &self.id).with_data(json!(registration))
    }

    /// Send LOADCONFIG and return the future for its response
    pub(crate) async fn request_configuration(&self) -> DeviceResult<PendingReply> {
        let state = self.state();
        if !state.is_managed() {
            return Err(DeviceError::precondition(format!(
                "load configuration requires a managed device (state: {state})"
            )));
        }

        let (tx, rx) = oneshot::channel();
        let id = self.transactions.begin(
            self.transaction_timeout,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;

        let envelope = Envelope::request(MessageType::LoadConfig, &self.id)
            .with_id(id)
            .with_reply_to(self.inbox.clone());
        if let Err(e) = self.publish_management(&envelope).await {
            warn!(device_id = %self.id, id, error = %e, "Failed to send LOADCONFIG");
            self.transactions.resolve(id, Err(e));
        } else {
            debug!(device_id = %self.id, id, "LOADCONFIG sent");
        }

        Ok(PendingReply::new(id, rx))
    }
}

/// Device connected to the management fabric through a transport
pub struct Device<T: Transport + 'static> {
    core: Arc<DeviceCore<T>>,
    state_rx: watch::Receiver<ManagementState>,
    shutdown_tx: watch::Sender<bool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport + 'static> Device<T> {
    /// Start the event loop and connect the transport
    ///
    /// Registration runs automatically on every (re)connect for devices with a
    /// control or config responder.
    pub async fn connect(&self) -> DeviceResult<()> {
        let state = self.core.state();
        if state.is_closed() {
            return Err(DeviceError::precondition("device is closed"));
        }

        {
            let mut slot = self
                .event_loop
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return Err(DeviceError::precondition("device is already connecting"));
            }

            self.core.set_state(ManagementState::Connecting);
            let (transport_tx, transport_rx) = mpsc::unbounded_channel();
            self.core.transport.set_event_sender(transport_tx);

            let span = crate::device_span!(device_id = %self.core.id);
            *slot = Some(event_loop::spawn(
                self.core.clone(),
                transport_rx,
                self.shutdown_tx.subscribe(),
                span,
            ));
        }

        info!(device_id = %self.core.id, role = ?self.core.role, "Connecting device");
        if let Err(e) = self.core.transport.connect().await {
            if self.core.state() == ManagementState::Connecting {
                self.core.set_state(ManagementState::Disconnected);
            }
            return Err(DeviceError::transport(e));
        }
        Ok(())
    }

    /// Publish raw bytes on an application topic
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> DeviceResult<()> {
        validate_application_topic(topic)?;
        self.core
            .transport
            .publish(topic, payload.into(), options)
            .await
            .map_err(DeviceError::transport)
    }

    /// Publish a JSON-encoded value on an application topic
    pub async fn publish_json<S: Serialize + ?Sized>(
        &self,
        topic: &str,
        value: &S,
        options: PublishOptions,
    ) -> DeviceResult<()> {
        validate_application_topic(topic)?;
        let payload = serde_json::to_vec(value)
            .map_err(|e| DeviceError::protocol(format!("Failed to encode payload: {e}")))?;
        self.publish(topic, payload, options).await
    }

    /// Publish on `<deviceType>/<eventName>[/<node>]` using this device's type
    pub async fn publish_event(
        &self,
        event_name: &str,
        node: Option<&str>,
        payload: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> DeviceResult<()> {
        let device_type = self
            .core
            .device_type
            .as_deref()
            .ok_or(ValidationError::MissingDeviceType)?;
        let topic = compose_event_topic(device_type, event_name, node)?;
        self.publish(&topic, payload, options).await
    }

    pub async fn subscribe(&self, topic: &str, qos: QoS) -> DeviceResult<()> {
        validate_application_topic(topic)?;
        self.core
            .transport
            .subscribe(topic, qos)
            .await
            .map_err(DeviceError::transport)
    }

    /// Subscribe to events of a device type (leading dot for the global form)
    pub async fn subscribe_event(
        &self,
        device_type: &str,
        event_name: &str,
        qos: QoS,
    ) -> DeviceResult<()> {
        let topic = compose_event_topic(device_type, event_name, None)?;
        self.subscribe(&topic, qos).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> DeviceResult<()> {
        validate_application_topic(topic)?;
        self.core
            .transport
            .unsubscribe(topic)
            .await
            .map_err(DeviceError::transport)
    }

    /// Send a STATUS report to the management service
    pub async fn report_status(&self, name: &str, value: Value) -> DeviceResult<()> {
        let status = StatusData {
            name: name.to_string(),
            value,
        };
        let envelope = Envelope::request(MessageType::Status, &self.core.id).with_data(json!(status));
        self.core.publish_management(&envelope).await
    }

    /// Pull configuration from the management service
    ///
    /// Fails immediately unless the device is managed. The returned future
    /// resolves exactly once with the configuration, a remote error, a
    /// timeout or a cancellation.
    pub async fn load_configuration(&self) -> DeviceResult<PendingReply> {
        self.core.request_configuration().await
    }

    /// Close the device
    ///
    /// A graceful close of a managed device sends DEREGIST first and lets the
    /// transport flush; a forced close drops the connection immediately.
    /// Outstanding transactions fail with a cancellation error either way.
    pub async fn close(&self, graceful: bool) -> DeviceResult<()> {
        if self.core.state().is_closed() {
            return Ok(());
        }

        if graceful && self.core.role.is_managed() {
            let deregist = Envelope::request(MessageType::Deregist, &self.core.id)
                .with_data(json!({ "status": "Off" }));
            if let Err(e) = self.core.publish_management(&deregist).await {
                warn!(device_id = %self.core.id, error = %e, "Failed to send DEREGIST");
            }
        }

        let cancelled = self.core.transactions.cancel_all("device closed");
        self.core.set_state(ManagementState::Closed);
        let _ = self.shutdown_tx.send(true);

        let end_result = self.core.transport.end(!graceful).await;

        let handle = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if tokio::time::timeout(CLOSE_JOIN_TIMEOUT, handle).await.is_err() {
                warn!(device_id = %self.core.id, "Device event loop did not stop in time");
            }
        }

        self.core.emit(DeviceEvent::Closed);
        info!(device_id = %self.core.id, graceful, cancelled, "Device closed");
        end_result.map_err(DeviceError::transport)
    }

    pub fn state(&self) -> ManagementState {
        *self.state_rx.borrow()
    }

    /// Watch state changes
    pub fn state_receiver(&self) -> watch::Receiver<ManagementState> {
        self.state_rx.clone()
    }

    pub fn is_managed(&self) -> bool {
        self.state().is_managed()
    }

    pub fn identity(&self) -> &str {
        &self.core.id
    }

    pub fn device_type(&self) -> Option<&str> {
        self.core.device_type.as_deref()
    }

    pub fn role(&self) -> DeviceRole {
        self.core.role
    }

    /// Reserved topic this device receives management requests on
    pub fn inbox_topic(&self) -> &str {
        &self.core.inbox
    }

    pub fn pending_transactions(&self) -> usize {
        self.core.transactions.pending()
    }

    pub fn transport(&self) -> &T {
        &self.core.transport
    }
}

impl<T: Transport + 'static> Drop for Device<T> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
