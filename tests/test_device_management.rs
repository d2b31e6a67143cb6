//! Device management behaviour against a mock transport
//!
//! These tests drive a [`Device`] through registration, inbound requests,
//! configuration loading and shutdown, and assert on the envelopes it
//! publishes.

use devmgmt_client::device::{Device, DeviceBuilder, DeviceEvent};
use devmgmt_client::management::{ConfigUpdate, ManagementState, Reply, UNSUPPORTED_OPERATION};
use devmgmt_client::protocol::{Envelope, MessageType, ResponseStatus, MANAGEMENT_TOPIC};
use devmgmt_client::testing::MockTransport;
use devmgmt_client::transport::{QoS, TransportEvent};
use devmgmt_client::DeviceError;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

const INBOX: &str = "$/device/dev1";

async fn next_event(events: &mut UnboundedReceiver<DeviceEvent>) -> DeviceEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for device event")
        .expect("device event channel closed")
}

async fn wait_for_active(events: &mut UnboundedReceiver<DeviceEvent>) {
    loop {
        match next_event(events).await {
            DeviceEvent::ManagementActive => return,
            DeviceEvent::Error(e) => panic!("unexpected device error: {e}"),
            _ => {}
        }
    }
}

/// Wait until an envelope matching `predicate` has been published
async fn wait_for_envelope<F>(transport: &MockTransport, predicate: F) -> (String, Envelope)
where
    F: Fn(&str, &Envelope) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            let found = transport
                .get_published_envelopes()
                .await
                .into_iter()
                .find(|(topic, envelope)| predicate(topic, envelope));
            if let Some(found) = found {
                return found;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for published envelope")
}

async fn envelopes_of(transport: &MockTransport, message_type: MessageType) -> Vec<(String, Envelope)> {
    transport
        .get_published_envelopes()
        .await
        .into_iter()
        .filter(|(_, envelope)| envelope.message_type == message_type)
        .collect()
}

async fn responses_to(transport: &MockTransport, ack: u64) -> Vec<(String, Envelope)> {
    transport
        .get_published_envelopes()
        .await
        .into_iter()
        .filter(|(_, envelope)| envelope.ack == Some(ack))
        .collect()
}

async fn connected_managed(
    builder: DeviceBuilder,
    transport: &MockTransport,
) -> (Device<MockTransport>, UnboundedReceiver<DeviceEvent>) {
    let (device, mut events) = builder.build(transport.clone()).unwrap();
    device.connect().await.unwrap();
    wait_for_active(&mut events).await;
    (device, events)
}

fn deliver_json(transport: &MockTransport, topic: &str, value: Value) {
    assert!(transport.deliver(topic, serde_json::to_vec(&value).unwrap()));
}

#[tokio::test]
async fn test_unmanaged_device_never_touches_reserved_topics() {
    let transport = MockTransport::new();
    let (device, mut events) = DeviceBuilder::new("dev1").build(transport.clone()).unwrap();

    device.connect().await.unwrap();
    assert!(matches!(next_event(&mut events).await, DeviceEvent::Connected));
    assert_eq!(device.state(), ManagementState::Connected);

    sleep(Duration::from_millis(50)).await;
    assert!(transport.get_published_messages().await.is_empty());
    assert!(transport.get_subscriptions().await.is_empty());

    device.close(true).await.unwrap();
    assert!(transport.get_published_messages().await.is_empty());
    assert_eq!(transport.ended_with().await, Some(false));
}

#[tokio::test]
async fn test_managed_device_registers_and_subscribes_inbox() {
    let transport = MockTransport::new();
    let builder = DeviceBuilder::new("dev1")
        .device_type("thermostat")
        .register_control_handler(|_name: &str, _args: Vec<Value>| Reply::ok(Value::Null));

    let (device, _events) = connected_managed(builder, &transport).await;

    assert_eq!(device.state(), ManagementState::Managed);
    assert!(device.is_managed());

    let published = transport.get_published_messages().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, MANAGEMENT_TOPIC);
    assert_eq!(published[0].qos, QoS::AtLeastOnce);
    assert!(!published[0].retain);

    let regist = published[0].envelope().unwrap();
    assert_eq!(regist.message_type, MessageType::Regist);
    assert_eq!(regist.from.as_deref(), Some("dev1"));
    assert_eq!(
        regist.data,
        Some(json!({"deviceType": "thermostat", "capabilities": ["control"]}))
    );

    assert_eq!(
        transport.get_subscriptions().await,
        vec![(INBOX.to_string(), QoS::ExactlyOnce)]
    );
}

#[tokio::test]
async fn test_registration_repeats_on_reconnect() {
    let transport = MockTransport::new();
    let builder = DeviceBuilder::new("dev1").control_notifications();
    let (device, mut events) = connected_managed(builder, &transport).await;

    transport.emit(TransportEvent::Reconnecting);
    assert!(matches!(next_event(&mut events).await, DeviceEvent::Reconnecting));
    assert_eq!(device.state(), ManagementState::Reconnecting);

    transport.emit(TransportEvent::Connected);
    assert!(matches!(next_event(&mut events).await, DeviceEvent::Connected));
    wait_for_active(&mut events).await;

    assert_eq!(envelopes_of(&transport, MessageType::Regist).await.len(), 2);
    assert_eq!(transport.get_subscriptions().await.len(), 2);
    assert_eq!(device.state(), ManagementState::Managed);
}

#[tokio::test]
async fn test_subscribe_failure_leaves_device_unmanaged() {
    let transport = MockTransport::with_subscribe_failure();
    let (device, mut events) = DeviceBuilder::new("dev1")
        .control_notifications()
        .build(transport.clone())
        .unwrap();

    device.connect().await.unwrap();
    assert!(matches!(next_event(&mut events).await, DeviceEvent::Connected));
    assert!(matches!(
        next_event(&mut events).await,
        DeviceEvent::Error(DeviceError::Transport(_))
    ));
    assert_eq!(device.state(), ManagementState::Unmanaged);

    // REGIST went out before the subscription failed
    assert_eq!(envelopes_of(&transport, MessageType::Regist).await.len(), 1);

    let result = device.load_configuration().await;
    assert!(matches!(result, Err(DeviceError::Precondition { .. })));
}

#[tokio::test]
async fn test_load_configuration_requires_managed_state() {
    let transport = MockTransport::new();
    let (device, _events) = DeviceBuilder::new("dev1")
        .config_notifications()
        .build(transport.clone())
        .unwrap();

    let result = device.load_configuration().await;
    assert!(matches!(result, Err(DeviceError::Precondition { .. })));
    assert_eq!(device.pending_transactions(), 0);
    assert!(transport.get_published_messages().await.is_empty());
}

#[tokio::test]
async fn test_initial_load_applies_configuration_once() {
    let transport = MockTransport::new();
    let received: Arc<Mutex<Vec<ConfigUpdate>>> = Arc::default();
    let recorder = received.clone();

    let builder = DeviceBuilder::new("dev1")
        .initial_load(true)
        .register_config_handler(move |update: ConfigUpdate| {
            recorder.lock().unwrap().push(update);
            Reply::ok(Value::Null)
        });
    let (device, _events) = connected_managed(builder, &transport).await;

    let (topic, request) = wait_for_envelope(&transport, |_, envelope| {
        envelope.message_type == MessageType::LoadConfig
    })
    .await;
    assert_eq!(topic, MANAGEMENT_TOPIC);
    assert_eq!(request.replyto.as_deref(), Some(INBOX));
    let id = request.id.expect("LOADCONFIG carries an id");
    assert_eq!(device.pending_transactions(), 1);

    let response = json!({
        "type": "RESPONSE",
        "from": "devmgmt",
        "ack": id,
        "status": "OK",
        "data": {"interval": 10}
    });
    deliver_json(&transport, INBOX, response.clone());

    timeout(Duration::from_secs(2), async {
        while received.lock().unwrap().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("config handler was not called");

    // A duplicate response finds no transaction
    deliver_json(&transport, INBOX, response);
    sleep(Duration::from_millis(50)).await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], ConfigUpdate::Snapshot(json!({"interval": 10})));
    assert_eq!(device.pending_transactions(), 0);
}

#[tokio::test]
async fn test_load_configuration_error_response() {
    let transport = MockTransport::new();
    let builder = DeviceBuilder::new("dev1").config_notifications();
    let (device, _events) = connected_managed(builder, &transport).await;

    let pending = device.load_configuration().await.unwrap();
    let id = pending.correlation_id();

    let (_, request) = wait_for_envelope(&transport, |_, envelope| envelope.id == Some(id)).await;
    assert_eq!(request.message_type, MessageType::LoadConfig);

    deliver_json(
        &transport,
        INBOX,
        json!({"type": "RESPONSE", "ack": id, "status": "Error", "message": "no configuration"}),
    );

    match timeout(Duration::from_secs(2), pending).await.unwrap() {
        Err(DeviceError::Remote { message }) => assert_eq!(message, "no configuration"),
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_load_configuration_times_out() {
    let transport = MockTransport::new();
    let builder = DeviceBuilder::new("dev1")
        .config_notifications()
        .transaction_timeout(Duration::from_secs(5));
    let (device, _events) = connected_managed(builder, &transport).await;

    let pending = device.load_configuration().await.unwrap();
    let id = pending.correlation_id();
    assert_eq!(device.pending_transactions(), 1);

    match pending.await {
        Err(DeviceError::Timeout {
            id: timed_out,
            timeout_ms,
        }) => {
            assert_eq!(timed_out, id);
            assert_eq!(timeout_ms, 5000);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(device.pending_transactions(), 0);

    // Late response is ignored
    deliver_json(
        &transport,
        INBOX,
        json!({"type": "RESPONSE", "ack": id, "status": "OK", "data": {}}),
    );
    sleep(Duration::from_millis(10)).await;
    assert_eq!(device.pending_transactions(), 0);
}

#[tokio::test]
async fn test_publish_failure_fails_load_configuration() {
    let transport = MockTransport::with_publish_failure();
    let (device, mut events) = DeviceBuilder::new("dev1")
        .config_notifications()
        .build(transport.clone())
        .unwrap();

    device.connect().await.unwrap();
    // REGIST could not be sent but the inbox subscription still succeeds
    loop {
        if let DeviceEvent::ManagementActive = next_event(&mut events).await {
            break;
        }
    }

    let pending = device.load_configuration().await.unwrap();
    let result = timeout(Duration::from_secs(2), pending).await.unwrap();
    assert!(matches!(result, Err(DeviceError::Transport(_))));
    assert_eq!(device.pending_transactions(), 0);
}

#[tokio::test]
async fn test_control_notification_is_answered_once() {
    let transport = MockTransport::new();
    let builder = DeviceBuilder::new("dev1").control_notifications();
    let (_device, mut events) = connected_managed(builder, &transport).await;

    deliver_json(
        &transport,
        INBOX,
        json!({
            "type": "CONTROL",
            "from": "devmgmt",
            "id": 7,
            "replyto": "$/devmgmt/dev1",
            "data": {"name": "reboot", "args": [5]}
        }),
    );

    let request = match next_event(&mut events).await {
        DeviceEvent::Control(request) => request,
        other => panic!("expected control request, got {other:?}"),
    };
    assert_eq!(request.name, "reboot");
    assert_eq!(request.args, vec![json!(5)]);

    assert!(request.done.ok("rebooting"));

    let (topic, response) = wait_for_envelope(&transport, |_, envelope| envelope.ack == Some(7)).await;
    assert_eq!(topic, "$/devmgmt/dev1");
    assert_eq!(response.message_type, MessageType::Response);
    assert_eq!(response.status, Some(ResponseStatus::Ok));
    assert_eq!(response.data, Some(json!("rebooting")));
    assert_eq!(response.from.as_deref(), Some("dev1"));

    // Second completion is ignored
    assert!(!request.done.fail("too late"));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(responses_to(&transport, 7).await.len(), 1);
}

#[tokio::test]
async fn test_dropped_notification_still_gets_a_response() {
    let transport = MockTransport::new();
    let builder = DeviceBuilder::new("dev1").control_notifications();
    let (_device, mut events) = connected_managed(builder, &transport).await;

    deliver_json(
        &transport,
        INBOX,
        json!({"type": "CONTROL", "id": 21, "data": {"name": "reboot"}}),
    );
    match next_event(&mut events).await {
        DeviceEvent::Control(request) => drop(request),
        other => panic!("expected control request, got {other:?}"),
    }

    let (topic, response) = wait_for_envelope(&transport, |_, envelope| envelope.ack == Some(21)).await;
    assert_eq!(topic, MANAGEMENT_TOPIC);
    assert_eq!(response.status, Some(ResponseStatus::Error));
}

#[tokio::test]
async fn test_control_handler_reply_defaults_to_management_topic() {
    let transport = MockTransport::new();
    let builder = DeviceBuilder::new("dev1").register_control_handler(
        |name: &str, _args: Vec<Value>| match name {
            "ping" => Reply::ok("pong"),
            _ => Reply::error("unknown control"),
        },
    );
    let (_device, _events) = connected_managed(builder, &transport).await;

    deliver_json(
        &transport,
        INBOX,
        json!({"type": "CONTROL", "id": 8, "data": {"name": "ping", "args": []}}),
    );
    deliver_json(
        &transport,
        INBOX,
        json!({"type": "CONTROL", "id": 9, "data": {"name": "explode"}}),
    );

    let (topic, pong) = wait_for_envelope(&transport, |_, envelope| envelope.ack == Some(8)).await;
    assert_eq!(topic, MANAGEMENT_TOPIC);
    assert_eq!(pong.status, Some(ResponseStatus::Ok));
    assert_eq!(pong.data, Some(json!("pong")));

    let (_, failure) = wait_for_envelope(&transport, |_, envelope| envelope.ack == Some(9)).await;
    assert_eq!(failure.status, Some(ResponseStatus::Error));
    assert_eq!(failure.message.as_deref(), Some("unknown control"));
}

#[tokio::test]
async fn test_pending_handler_reply_is_published_when_ready() {
    let transport = MockTransport::new();
    let builder = DeviceBuilder::new("dev1").register_control_handler(
        |_name: &str, args: Vec<Value>| {
            Reply::pending(async move {
                sleep(Duration::from_millis(20)).await;
                Ok(json!(args.len()))
            })
        },
    );
    let (_device, _events) = connected_managed(builder, &transport).await;

    deliver_json(
        &transport,
        INBOX,
        json!({"type": "CONTROL", "id": 12, "data": {"name": "count", "args": [1, 2, 3]}}),
    );

    let (_, response) = wait_for_envelope(&transport, |_, envelope| envelope.ack == Some(12)).await;
    assert_eq!(response.data, Some(json!(3)));
}

#[tokio::test]
async fn test_config_entry_reaches_handler() {
    let transport = MockTransport::new();
    let received: Arc<Mutex<Vec<ConfigUpdate>>> = Arc::default();
    let recorder = received.clone();
    let builder = DeviceBuilder::new("dev1").register_config_handler(move |update: ConfigUpdate| {
        recorder.lock().unwrap().push(update);
        Reply::ok(json!({"applied": true}))
    });
    let (_device, _events) = connected_managed(builder, &transport).await;

    deliver_json(
        &transport,
        INBOX,
        json!({"type": "CONFIG", "id": 11, "data": {"name": "interval", "value": 30}}),
    );

    let (_, response) = wait_for_envelope(&transport, |_, envelope| envelope.ack == Some(11)).await;
    assert_eq!(response.data, Some(json!({"applied": true})));
    assert_eq!(
        received.lock().unwrap().as_slice(),
        &[ConfigUpdate::Entry {
            name: "interval".to_string(),
            value: json!(30)
        }]
    );
}

#[tokio::test]
async fn test_request_without_handler_becomes_notification() {
    let transport = MockTransport::new();
    let builder = DeviceBuilder::new("dev1")
        .register_control_handler(|_name: &str, _args: Vec<Value>| Reply::ok(Value::Null));
    let (_device, mut events) = connected_managed(builder, &transport).await;

    deliver_json(
        &transport,
        INBOX,
        json!({"type": "CONFIG", "id": 13, "data": {"name": "interval", "value": 30}}),
    );

    let request = match next_event(&mut events).await {
        DeviceEvent::Config(request) => request,
        other => panic!("expected config request, got {other:?}"),
    };
    assert_eq!(
        request.update,
        ConfigUpdate::Entry {
            name: "interval".to_string(),
            value: json!(30)
        }
    );
    assert!(request.done.fail(UNSUPPORTED_OPERATION));

    let (_, response) = wait_for_envelope(&transport, |_, envelope| envelope.ack == Some(13)).await;
    assert_eq!(response.status, Some(ResponseStatus::Error));
    assert_eq!(response.message.as_deref(), Some(UNSUPPORTED_OPERATION));
}

#[tokio::test]
async fn test_unknown_type_with_id_gets_error_response() {
    let transport = MockTransport::new();
    let builder = DeviceBuilder::new("dev1").control_notifications();
    let (_device, _events) = connected_managed(builder, &transport).await;

    deliver_json(&transport, INBOX, json!({"type": "FROBNICATE", "id": 10}));

    let (topic, response) = wait_for_envelope(&transport, |_, envelope| envelope.ack == Some(10)).await;
    assert_eq!(topic, MANAGEMENT_TOPIC);
    assert_eq!(response.status, Some(ResponseStatus::Error));
    assert!(response.message.unwrap().contains("FROBNICATE"));
}

#[tokio::test]
async fn test_malformed_payloads_are_dropped() {
    let transport = MockTransport::new();
    let builder = DeviceBuilder::new("dev1")
        .register_control_handler(|_name: &str, _args: Vec<Value>| Reply::ok("pong"));
    let (device, _events) = connected_managed(builder, &transport).await;
    let before = transport.get_published_messages().await.len();

    assert!(transport.deliver(INBOX, &b"not json"[..]));
    deliver_json(&transport, INBOX, json!({"type": "CONTROL", "id": "seven"}));
    deliver_json(&transport, INBOX, json!({"id": 3}));

    // The device keeps serving requests afterwards
    deliver_json(
        &transport,
        INBOX,
        json!({"type": "CONTROL", "id": 14, "data": {"name": "ping"}}),
    );
    wait_for_envelope(&transport, |_, envelope| envelope.ack == Some(14)).await;

    assert_eq!(transport.get_published_messages().await.len(), before + 1);
    assert_eq!(device.state(), ManagementState::Managed);
}

#[tokio::test]
async fn test_request_without_id_gets_no_response() {
    let transport = MockTransport::new();
    let calls = Arc::new(Mutex::new(0usize));
    let counter = calls.clone();
    let builder = DeviceBuilder::new("dev1").register_control_handler(
        move |_name: &str, _args: Vec<Value>| {
            *counter.lock().unwrap() += 1;
            Reply::ok("done")
        },
    );
    let (_device, _events) = connected_managed(builder, &transport).await;
    let before = transport.get_published_messages().await.len();

    deliver_json(
        &transport,
        INBOX,
        json!({"type": "CONTROL", "data": {"name": "blink"}}),
    );

    timeout(Duration::from_secs(2), async {
        while *calls.lock().unwrap() == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("control handler was not called");
    sleep(Duration::from_millis(20)).await;

    assert_eq!(transport.get_published_messages().await.len(), before);
}

#[tokio::test]
async fn test_graceful_close_cancels_and_deregisters() {
    let transport = MockTransport::new();
    let builder = DeviceBuilder::new("dev1").config_notifications();
    let (device, mut events) = connected_managed(builder, &transport).await;

    let pending = device.load_configuration().await.unwrap();
    device.close(true).await.unwrap();

    let result = timeout(Duration::from_secs(1), pending).await.unwrap();
    assert!(matches!(result, Err(DeviceError::Cancelled { .. })));
    assert_eq!(device.pending_transactions(), 0);

    let deregist = envelopes_of(&transport, MessageType::Deregist).await;
    assert_eq!(deregist.len(), 1);
    assert_eq!(deregist[0].0, MANAGEMENT_TOPIC);
    assert_eq!(deregist[0].1.data, Some(json!({"status": "Off"})));
    assert_eq!(transport.ended_with().await, Some(false));

    assert_eq!(device.state(), ManagementState::Closed);
    let mut saw_closed = false;
    while let Ok(event) = events.try_recv() {
        saw_closed |= matches!(event, DeviceEvent::Closed);
    }
    assert!(saw_closed);

    let result = device.connect().await;
    assert!(matches!(result, Err(DeviceError::Precondition { .. })));
}

#[tokio::test]
async fn test_forced_close_skips_deregister() {
    let transport = MockTransport::new();
    let builder = DeviceBuilder::new("dev1").control_notifications();
    let (device, _events) = connected_managed(builder, &transport).await;

    device.close(false).await.unwrap();

    assert!(envelopes_of(&transport, MessageType::Deregist).await.is_empty());
    assert_eq!(transport.ended_with().await, Some(true));
    assert_eq!(device.state(), ManagementState::Closed);
}

#[tokio::test]
async fn test_transport_lifecycle_events_are_forwarded() {
    let transport = MockTransport::new();
    let (device, mut events) = DeviceBuilder::new("dev1").build(transport.clone()).unwrap();

    device.connect().await.unwrap();
    assert!(matches!(next_event(&mut events).await, DeviceEvent::Connected));

    transport.emit(TransportEvent::Offline);
    assert!(matches!(next_event(&mut events).await, DeviceEvent::Offline));
    assert_eq!(device.state(), ManagementState::Offline);

    transport.emit(TransportEvent::Error("connection reset".to_string()));
    match next_event(&mut events).await {
        DeviceEvent::Error(e) => assert!(e.to_string().contains("connection reset")),
        other => panic!("expected error event, got {other:?}"),
    }

    transport.emit(TransportEvent::Closed);
    assert!(matches!(next_event(&mut events).await, DeviceEvent::Closed));
    assert_eq!(device.state(), ManagementState::Disconnected);
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let transport = MockTransport::new();
    let (device, _events) = DeviceBuilder::new("dev1").build(transport.clone()).unwrap();

    device.connect().await.unwrap();
    let result = device.connect().await;
    assert!(matches!(result, Err(DeviceError::Precondition { .. })));
}
