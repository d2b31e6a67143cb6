//! Notifications delivered to the embedding application

use crate::error::DeviceError;
use crate::management::{ConfigUpdate, Done};
use bytes::Bytes;
use serde_json::Value;

/// Event emitted by a [`Device`](super::Device)
#[derive(Debug)]
pub enum DeviceEvent {
    Connected,
    Closed,
    Reconnecting,
    Offline,
    /// Non-fatal failure; the device keeps running
    Error(DeviceError),
    /// Application message on a non-reserved topic
    Message { topic: String, payload: Bytes },
    /// Inbox subscribed and registration complete
    ManagementActive,
    /// CONTROL request awaiting the application's answer
    Control(ControlRequest),
    /// CONFIG request (or loaded configuration) awaiting the application's answer
    Config(ConfigRequest),
}

/// CONTROL request in notification mode
#[derive(Debug)]
pub struct ControlRequest {
    pub name: String,
    pub args: Vec<Value>,
    /// Answer exactly once; later calls are ignored
    pub done: Done,
}

/// CONFIG request in notification mode
#[derive(Debug)]
pub struct ConfigRequest {
    pub update: ConfigUpdate,
    pub done: Done,
}
