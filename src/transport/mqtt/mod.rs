//! MQTT transport for managed devices
//!
//! This module separates pure functions from I/O operations:
//!
//! - [`connection`] - Connection state, reconnection policy and rumqttc options
//! - [`message_handler`] - Pure routing of rumqttc events
//! - [`health_monitor`] - Pure reconnection decisions and state transitions
//! - [`client`] - The supervisor task and [`Transport`](crate::transport::Transport) impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use devmgmt_client::config::MqttSection;
//! use devmgmt_client::transport::mqtt::MqttClient;
//! use devmgmt_client::transport::Transport;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     keep_alive_secs: 60,
//! };
//!
//! let client = MqttClient::new("thermo-01", &config, None)?;
//! client.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
