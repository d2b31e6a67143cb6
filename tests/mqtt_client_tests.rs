//! Integration tests for the MQTT transport
//!
//! Tests the MQTT client's behaviour without a broker:
//! - Client construction from configuration (plain, TLS, credentials)
//! - Operations refused before the connection is confirmed
//! - Reconnection backoff and permanent failure against an unreachable broker

use devmgmt_client::config::{DeviceConfig, MqttSection};
use devmgmt_client::transport::mqtt::{ConnectionState, MqttClient, MqttError, ReconnectConfig};
use devmgmt_client::transport::{PublishOptions, QoS, Transport, TransportEvent};
use std::time::Duration;
use tokio::sync::mpsc;

fn test_mqtt_config(broker_url: &str) -> MqttSection {
    MqttSection {
        broker_url: broker_url.to_string(),
        username_env: None,
        password_env: None,
        keep_alive_secs: 30,
    }
}

#[tokio::test]
async fn test_mqtt_client_creation() {
    let client = MqttClient::new("dev1", &test_mqtt_config("mqtt://localhost:1883"), None)
        .expect("client creation should succeed");

    assert!(!client.is_permanently_disconnected());
    assert!(!matches!(client.connection_state(), ConnectionState::Connected));
}

#[tokio::test]
async fn test_mqtt_client_creation_with_tls_default_roots() {
    let result = MqttClient::new("dev1", &test_mqtt_config("mqtts://localhost"), None);
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_mqtt_client_creation_with_auth() {
    std::env::set_var("DEVMGMT_MQTT_TEST_USER", "device");
    std::env::set_var("DEVMGMT_MQTT_TEST_PASS", "secret");

    let mut config = test_mqtt_config("mqtt://localhost:1883");
    config.username_env = Some("DEVMGMT_MQTT_TEST_USER".to_string());
    config.password_env = Some("DEVMGMT_MQTT_TEST_PASS".to_string());

    assert!(MqttClient::new("dev1", &config, None).is_ok());
}

#[tokio::test]
async fn test_mqtt_client_from_device_config() {
    let config = DeviceConfig::from_toml_str(
        r#"
[device]
id = "thermo-01"

[mqtt]
broker_url = "tcp://localhost:1883"
"#,
    )
    .unwrap();

    assert!(MqttClient::from_config(&config).is_ok());
}

#[tokio::test]
async fn test_mqtt_client_invalid_broker_url() {
    for url in ["invalid-url", "http://localhost:1883", "ws://localhost:1883"] {
        let result = MqttClient::new("dev1", &test_mqtt_config(url), None);
        assert!(result.is_err(), "{url} should be rejected");
    }
}

#[tokio::test]
async fn test_operations_require_connection() {
    let client = MqttClient::new("dev1", &test_mqtt_config("mqtt://localhost:1883"), None).unwrap();

    let result = client
        .publish("a/b", b"x".to_vec(), PublishOptions::default())
        .await;
    assert!(matches!(result, Err(MqttError::NotConnected { .. })));

    let result = client.subscribe("a/b", QoS::AtLeastOnce).await;
    assert!(matches!(result, Err(MqttError::NotConnected { .. })));

    let result = client.unsubscribe("a/b").await;
    assert!(matches!(result, Err(MqttError::NotConnected { .. })));
}

#[test]
fn test_reconnect_backoff_follows_pattern_then_sustains() {
    let config = ReconnectConfig::default();

    assert_eq!(config.calculate_backoff_delay(1), 25);
    assert_eq!(config.calculate_backoff_delay(2), 50);
    assert_eq!(config.calculate_backoff_delay(3), 100);
    assert_eq!(config.calculate_backoff_delay(4), 250);
    assert_eq!(config.calculate_backoff_delay(5), 250);
    assert_eq!(config.calculate_backoff_delay(100), 250);
    assert_eq!(config.calculate_max_total_time(), None);

    let limited = ReconnectConfig {
        max_attempts: Some(3),
        ..Default::default()
    };
    assert_eq!(limited.calculate_max_total_time(), Some(175));
}

#[tokio::test]
async fn test_connect_fails_after_max_attempts() {
    // Nothing listens on port 1; every attempt is refused
    let client = MqttClient::with_reconnect_config(
        "dev1",
        &test_mqtt_config("mqtt://127.0.0.1:1"),
        None,
        ReconnectConfig {
            max_attempts: Some(2),
            backoff_pattern: vec![10, 10],
            sustained_delay: 10,
        },
    )
    .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.set_event_sender(tx);

    let result = tokio::time::timeout(Duration::from_secs(20), client.connect())
        .await
        .expect("connect should give up well before the timeout");
    assert!(result.is_err());
    assert!(client.is_permanently_disconnected());

    let mut saw_error = false;
    let mut saw_reconnecting = false;
    let mut saw_offline = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            TransportEvent::Error(_) => saw_error = true,
            TransportEvent::Reconnecting => saw_reconnecting = true,
            TransportEvent::Offline => saw_offline = true,
            _ => {}
        }
    }
    assert!(saw_error);
    assert!(saw_reconnecting);
    assert!(saw_offline);

    // The event loop is consumed by the first connect
    assert!(client.connect().await.is_err());
}

#[tokio::test]
async fn test_end_before_connect_is_harmless() {
    let client = MqttClient::new("dev1", &test_mqtt_config("mqtt://localhost:1883"), None).unwrap();
    assert!(client.end(true).await.is_ok());
}
