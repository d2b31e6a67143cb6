//! Event loop driving a device from its transport events

use super::{DeviceCore, DeviceEvent};
use crate::error::{DeviceError, DeviceResult};
use crate::management::ManagementState;
use crate::protocol::is_reserved;
use crate::transport::{QoS, Transport, TransportEvent};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};

/// Results of work the loop hands off to background tasks
enum Internal {
    Registration(DeviceResult<()>),
    InitialConfig(DeviceResult<Value>),
}

pub(super) fn spawn<T: Transport + 'static>(
    core: Arc<DeviceCore<T>>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown_rx: watch::Receiver<bool>,
    span: Span,
) -> JoinHandle<()> {
    tokio::spawn(run(core, transport_rx, shutdown_rx).instrument(span))
}

async fn run<T: Transport + 'static>(
    core: Arc<DeviceCore<T>>,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
    debug!("Device event loop started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            event = transport_rx.recv() => {
                let Some(event) = event else {
                    debug!("Transport event channel closed");
                    break;
                };
                handle_transport_event(&core, event, &internal_tx).await;
            }
            Some(internal) = internal_rx.recv() => {
                handle_internal(&core, internal, &internal_tx).await;
            }
        }
    }

    debug!("Device event loop stopped");
}

async fn handle_transport_event<T: Transport + 'static>(
    core: &Arc<DeviceCore<T>>,
    event: TransportEvent,
    internal_tx: &mpsc::UnboundedSender<Internal>,
) {
    if core.state().is_closed() {
        debug!(?event, "Ignoring transport event after close");
        return;
    }

    match event {
        TransportEvent::Connected => {
            info!("Transport connected");
            core.set_state(ManagementState::Connected);
            core.emit(DeviceEvent::Connected);
            if core.role.is_managed() {
                register(core, internal_tx).await;
            }
        }
        TransportEvent::Closed => {
            core.set_state(ManagementState::Disconnected);
            core.emit(DeviceEvent::Closed);
        }
        TransportEvent::Reconnecting => {
            core.set_state(ManagementState::Reconnecting);
            core.emit(DeviceEvent::Reconnecting);
        }
        TransportEvent::Offline => {
            core.set_state(ManagementState::Offline);
            core.emit(DeviceEvent::Offline);
        }
        TransportEvent::Error(message) => {
            warn!(error = %message, "Transport error");
            core.emit(DeviceEvent::Error(DeviceError::Transport(message.into())));
        }
        TransportEvent::Message { topic, payload } => {
            if topic == core.inbox {
                if core.role.is_managed() {
                    core.dispatcher.dispatch(&payload).await;
                } else {
                    debug!("Ignoring management message on unmanaged device");
                }
            } else if is_reserved(&topic) {
                debug!(%topic, "Dropping message on reserved topic");
            } else {
                core.emit(DeviceEvent::Message { topic, payload });
            }
        }
    }
}

/// Announce the device and subscribe to its inbox
///
/// Runs on every connect. The subscription is awaited on a separate task so
/// inbound traffic keeps flowing while the broker confirms it.
async fn register<T: Transport + 'static>(
    core: &Arc<DeviceCore<T>>,
    internal_tx: &mpsc::UnboundedSender<Internal>,
) {
    core.set_state(ManagementState::Registering);

    let registration = core.registration_envelope();
    if let Err(e) = core.publish_management(&registration).await {
        warn!(error = %e, "Failed to send REGIST");
        core.emit(DeviceEvent::Error(e));
    }

    let core = core.clone();
    let internal_tx = internal_tx.clone();
    tokio::spawn(
        async move {
            let result = core
                .transport
                .subscribe(&core.inbox, QoS::ExactlyOnce)
                .await
                .map_err(DeviceError::transport);
            let _ = internal_tx.send(Internal::Registration(result));
        }
        .in_current_span(),
    );
}

async fn handle_internal<T: Transport + 'static>(
    core: &Arc<DeviceCore<T>>,
    internal: Internal,
    internal_tx: &mpsc::UnboundedSender<Internal>,
) {
    match internal {
        Internal::Registration(result) => {
            // A reconnect or close may have overtaken the subscription
            if core.state() != ManagementState::Registering {
                debug!(state = %core.state(), "Discarding stale registration result");
                return;
            }
            match result {
                Ok(()) => {
                    info!(inbox = %core.inbox, "Device is managed");
                    core.set_state(ManagementState::Managed);
                    core.emit(DeviceEvent::ManagementActive);
                    if core.initial_load {
                        load_initial_configuration(core, internal_tx).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Inbox subscription failed; device is unmanaged");
                    core.set_state(ManagementState::Unmanaged);
                    core.emit(DeviceEvent::Error(e));
                }
            }
        }
        Internal::InitialConfig(Ok(configuration)) => {
            debug!("Applying loaded configuration");
            core.dispatcher.apply_config_snapshot(configuration).await;
        }
        Internal::InitialConfig(Err(e)) => {
            warn!(error = %e, "Initial configuration load failed");
            core.emit(DeviceEvent::Error(e));
        }
    }
}

async fn load_initial_configuration<T: Transport + 'static>(
    core: &Arc<DeviceCore<T>>,
    internal_tx: &mpsc::UnboundedSender<Internal>,
) {
    match core.request_configuration().await {
        Ok(pending) => {
            let internal_tx = internal_tx.clone();
            tokio::spawn(
                async move {
                    let _ = internal_tx.send(Internal::InitialConfig(pending.await));
                }
                .in_current_span(),
            );
        }
        Err(e) => {
            warn!(error = %e, "Could not request initial configuration");
            core.emit(DeviceEvent::Error(e));
        }
    }
}
