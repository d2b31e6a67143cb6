//! Impure I/O operations for MQTT client
//!
//! This module owns the rumqttc event loop. A supervisor task polls it,
//! publishes [`TransportEvent`]s, matches SUBACKs to pending subscribes and
//! applies the reconnection policy from [`HealthMonitor`].

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::{DeviceConfig, MqttSection, TlsMaterial};
use crate::transport::{PublishOptions, Transport, TransportEvent};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const SUBACK_TIMEOUT: Duration = Duration::from_secs(30);
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

type SubAckWaiter = oneshot::Sender<Result<(), MqttError>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// State shared between the client handle and its supervisor task
struct Shared {
    device_id: String,
    event_sender: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    /// SUBACKs arrive in the order SUBSCRIBEs were sent
    pending_subacks: Mutex<VecDeque<SubAckWaiter>>,
    state_tx: watch::Sender<ConnectionState>,
    closing: AtomicBool,
    reconnect_config: ReconnectConfig,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        match lock(&self.event_sender).as_ref() {
            Some(sender) => {
                if sender.send(event).is_err() {
                    debug!(device_id = %self.device_id, "Transport event receiver dropped");
                }
            }
            None => debug!(device_id = %self.device_id, ?event, "No transport event sender set"),
        }
    }

    fn transition(&self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(event);
        let previous = self.state_tx.borrow().clone();
        HealthMonitor::log_state_transition(&previous, &next);
        // Listeners act on events immediately, so the state must already be visible
        self.state_tx.send_replace(next.clone());
        for transport_event in HealthMonitor::transition_events(&previous, &next) {
            self.emit(transport_event);
        }
    }

    fn confirm_subscription(&self, return_codes: &[u8]) {
        let waiter = lock(&self.pending_subacks).pop_front();
        let result = MessageHandler::validate_subscription_success(return_codes)
            .map_err(|reason| MqttError::SubscriptionFailed(reason.into()));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => warn!("SUBACK received with no pending subscription"),
        }
    }

    fn fail_pending_subscriptions(&self, reason: &str) {
        let waiters: Vec<_> = lock(&self.pending_subacks).drain(..).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(MqttError::SubscriptionFailed(reason.to_string().into())));
        }
    }
}

/// MQTT transport client for a managed device
pub struct MqttClient {
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    subscribe_lock: tokio::sync::Mutex<()>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    pub fn new(
        device_id: &str,
        config: &MqttSection,
        tls: Option<&TlsMaterial>,
    ) -> Result<Self, MqttError> {
        Self::with_reconnect_config(device_id, config, tls, ReconnectConfig::default())
    }

    /// Build a client from a loaded device configuration
    pub fn from_config(config: &DeviceConfig) -> Result<Self, MqttError> {
        let tls = config.tls_material()?;
        Self::new(&config.device.id, &config.mqtt, tls.as_ref())
    }

    pub fn with_reconnect_config(
        device_id: &str,
        config: &MqttSection,
        tls: Option<&TlsMaterial>,
        reconnect_config: ReconnectConfig,
    ) -> Result<Self, MqttError> {
        let mqtt_options = configure_mqtt_options(device_id, config, tls)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(MqttClient {
            client,
            event_loop: Mutex::new(Some(event_loop)),
            shared: Arc::new(Shared {
                device_id: device_id.to_string(),
                event_sender: Mutex::new(None),
                pending_subacks: Mutex::new(VecDeque::new()),
                state_tx,
                closing: AtomicBool::new(false),
                reconnect_config,
            }),
            state_rx,
            shutdown_tx,
            subscribe_lock: tokio::sync::Mutex::new(()),
            event_loop_handle: Mutex::new(None),
        })
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                let outcome = match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => Some(Ok(())),
                    ConnectionState::PermanentlyDisconnected(reason) => {
                        Some(Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        ))))
                    }
                    // Transient failures keep retrying in the supervisor
                    _ => None,
                };
                if let Some(outcome) = outcome {
                    return outcome;
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Supervisor loop: poll the event loop until shutdown or permanent failure
    async fn supervise(
        mut event_loop: EventLoop,
        shared: Arc<Shared>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(device_id = %shared.device_id, "Starting MQTT event loop supervisor");
        let mut reconnect_attempts = 0u32;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping supervisor");
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            if !Self::process_event_route(route, &shared, &mut reconnect_attempts) {
                                break;
                            }
                        }
                        Err(e) => {
                            if !Self::handle_event_loop_error(
                                e,
                                &shared,
                                &mut reconnect_attempts,
                                shutdown_rx.clone(),
                            )
                            .await
                            {
                                break;
                            }
                        }
                    }
                }
            }
        }

        shared.fail_pending_subscriptions("event loop stopped");
        info!(device_id = %shared.device_id, "MQTT event loop stopped");
    }

    /// Returns true to continue polling, false to stop
    fn process_event_route(
        route: EventRoute,
        shared: &Shared,
        reconnect_attempts: &mut u32,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                *reconnect_attempts = 0;
                shared.transition(ConnectionEvent::ConnAckReceived);
                true
            }
            EventRoute::MessageReceived { topic, payload } => {
                debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", topic);
                shared.emit(TransportEvent::Message { topic, payload });
                true
            }
            EventRoute::Disconnected => {
                shared.transition(ConnectionEvent::DisconnectedByBroker);
                shared.fail_pending_subscriptions("broker disconnected");
                true
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                return_codes,
            } => {
                debug!(target: "mqtt_transport", packet_id, "Subscription confirmed: {:?}", return_codes);
                shared.confirm_subscription(&return_codes);
                true
            }
            EventRoute::OutgoingDisconnect => {
                if shared.closing.load(Ordering::SeqCst) {
                    shared.transition(ConnectionEvent::NetworkError(
                        "Client disconnected".to_string(),
                    ));
                    return false;
                }
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Returns true to continue polling (rumqttc reconnects on the next poll)
    async fn handle_event_loop_error(
        error: rumqttc::v5::ConnectionError,
        shared: &Shared,
        reconnect_attempts: &mut u32,
        shutdown_rx: watch::Receiver<bool>,
    ) -> bool {
        if shared.closing.load(Ordering::SeqCst) {
            debug!("Event loop ended while closing: {}", error);
            shared.transition(ConnectionEvent::NetworkError(
                "Client disconnected".to_string(),
            ));
            return false;
        }

        error!(device_id = %shared.device_id, "MQTT event loop error: {}", error);
        shared.emit(TransportEvent::Error(error.to_string()));
        shared.transition(ConnectionEvent::NetworkError(error.to_string()));
        shared.fail_pending_subscriptions("connection lost");

        let decision = HealthMonitor::should_attempt_reconnection(
            *reconnect_attempts,
            &shared.reconnect_config,
            *shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                *reconnect_attempts = attempt;
                shared.transition(ConnectionEvent::ReconnectionStarted(attempt));

                let max_display = shared
                    .reconnect_config
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                Self::interruptible_sleep(shutdown_rx, delay_ms).await
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!("Max reconnection attempts ({reconnect_attempts}) exceeded");
                shared.transition(ConnectionEvent::PermanentFailure(reason));
                false
            }
        }
    }

    /// Perform interruptible sleep with shutdown monitoring
    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                true
            }
        }
    }

    /// Get current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Check if the connection is permanently disconnected
    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            ConnectionState::PermanentlyDisconnected(_)
        )
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<(), MqttError> {
        let current_state = self.connection_state();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&self) -> Result<(), Self::Error> {
        let event_loop = lock(&self.event_loop).take().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Event loop already started".to_string())
        })?;

        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(Self::supervise(
            event_loop,
            self.shared.clone(),
            shutdown_rx,
        ));
        *lock(&self.event_loop_handle) = Some(handle);

        let connection_timeout =
            HealthMonitor::calculate_connection_timeout(&self.shared.reconnect_config);
        Self::wait_for_connection_confirmation(self.state_rx.clone(), connection_timeout).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), Self::Error> {
        self.check_connection_state()?;

        self.client
            .publish(topic, options.qos, options.retain, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        debug!(target: "mqtt_transport", topic, qos = ?options.qos, "Published message");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), Self::Error> {
        self.check_connection_state()?;

        let (tx, rx) = oneshot::channel();
        {
            // Queue order must match SUBSCRIBE send order
            let _guard = self.subscribe_lock.lock().await;
            lock(&self.shared.pending_subacks).push_back(tx);
            if let Err(e) = self.client.subscribe(topic, qos).await {
                lock(&self.shared.pending_subacks).pop_back();
                return Err(MqttError::SubscriptionFailed(Box::new(e)));
            }
        }

        match tokio::time::timeout(SUBACK_TIMEOUT, rx).await {
            Ok(Ok(result)) => {
                if result.is_ok() {
                    info!(topic, ?qos, "Subscription confirmed");
                }
                result
            }
            Ok(Err(_)) => Err(MqttError::SubscriptionFailed(
                "connection closed before SUBACK".into(),
            )),
            Err(_) => Err(MqttError::SubscriptionFailed(
                format!("no SUBACK for {topic} within {}s", SUBACK_TIMEOUT.as_secs()).into(),
            )),
        }
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), Self::Error> {
        self.check_connection_state()?;

        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| MqttError::UnsubscriptionFailed(Box::new(e)))
    }

    async fn end(&self, force: bool) -> Result<(), Self::Error> {
        self.shared.closing.store(true, Ordering::SeqCst);
        let handle = lock(&self.event_loop_handle).take();

        if force {
            if let Some(handle) = handle {
                handle.abort();
            }
        } else {
            // DISCONNECT is queued behind any in-flight publishes
            if let Err(e) = self.client.disconnect().await {
                warn!("Failed to queue MQTT disconnect: {}", e);
            }

            if let Some(handle) = handle {
                match tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, handle).await {
                    Ok(Ok(())) => info!("Event loop task shut down gracefully"),
                    Ok(Err(e)) if !e.is_cancelled() => {
                        warn!("Event loop task ended with error: {}", e);
                    }
                    Err(_) => warn!("Event loop task didn't shut down gracefully, stopping it"),
                    _ => {}
                }
            }
        }

        let _ = self.shutdown_tx.send(true);
        self.shared.fail_pending_subscriptions("client closed");
        let _ = self
            .shared
            .state_tx
            .send(ConnectionState::Disconnected("Client disconnected".to_string()));

        info!(device_id = %self.shared.device_id, force, "MQTT client closed");
        Ok(())
    }

    fn set_event_sender(&self, sender: mpsc::UnboundedSender<TransportEvent>) {
        *lock(&self.shared.event_sender) = Some(sender);
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = lock(&self.event_loop_handle).take() {
            handle.abort();
        }
    }
}
