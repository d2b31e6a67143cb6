//! Topic namespace rules for device traffic
//!
//! Application events live under `<deviceType>/<eventName>[/<node>]`. Topics
//! starting with the `$` sentinel are reserved for device management and are
//! never reachable through the application publish/subscribe surface.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Sentinel character marking the reserved management namespace
pub const RESERVED_SENTINEL: char = '$';

/// Topic every device-initiated management envelope is published to
pub const MANAGEMENT_TOPIC: &str = "$/devmgmt";

static IDENTITY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\.?[A-Za-z0-9_]+$").expect("identity pattern is valid"));

static NODE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("node pattern is valid"));

/// Validate a device-type or event name: `^\.?[A-Za-z0-9_]+$`
///
/// A leading dot marks a name that is not scoped to a concrete device type.
pub fn validate_identity(name: &str) -> Result<&str, ValidationError> {
    if IDENTITY_PATTERN.is_match(name) {
        Ok(name)
    } else {
        Err(ValidationError::InvalidIdentity(name.to_string()))
    }
}

/// Validate a device identifier before it is embedded in a topic
pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }

    for ch in device_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidDeviceIdChar(ch));
        }
    }

    Ok(())
}

/// True iff the topic belongs to the reserved management namespace
pub fn is_reserved(topic: &str) -> bool {
    topic.starts_with(RESERVED_SENTINEL)
}

/// Reject topics the application is not allowed to touch
pub fn validate_application_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if is_reserved(topic) {
        return Err(ValidationError::ReservedTopic(topic.to_string()));
    }
    Ok(())
}

/// Reserved inbox a managed device subscribes to: `$/device/{device_id}`
pub fn device_inbox_topic(device_id: &str) -> String {
    format!("{RESERVED_SENTINEL}/device/{device_id}")
}

/// Build `<deviceType>/<eventName>[/<node>]`
///
/// A leading dot on either name produces the global form
/// `.<deviceType>/<eventName>`; the dot is only ever written once, in front of
/// the device type segment.
///
/// The global form is normalized: `(".a", "b")`, `("a", ".b")` and
/// `(".a", ".b")` all compose to `.a/b`, which [`parse_event_topic`] returns
/// as `("a", ".b")` with the marker on the event name.
pub fn compose_event_topic(
    device_type: &str,
    event_name: &str,
    node: Option<&str>,
) -> Result<String, ValidationError> {
    validate_identity(device_type)?;
    validate_identity(event_name)?;

    let global = device_type.starts_with('.') || event_name.starts_with('.');
    let device_type = device_type.trim_start_matches('.');
    let event_name = event_name.trim_start_matches('.');

    let mut topic = String::with_capacity(device_type.len() + event_name.len() + 2);
    if global {
        topic.push('.');
    }
    topic.push_str(device_type);
    topic.push('/');
    topic.push_str(event_name);

    if let Some(node) = node {
        if !NODE_PATTERN.is_match(node) {
            return Err(ValidationError::InvalidIdentity(node.to_string()));
        }
        topic.push('/');
        topic.push_str(node);
    }

    Ok(topic)
}

/// Components of an application event topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTopic {
    pub device_type: String,
    /// Carries the leading dot when the topic is in the global form
    pub event_name: String,
    pub node: Option<String>,
}

impl EventTopic {
    pub fn is_global(&self) -> bool {
        self.event_name.starts_with('.')
    }

    pub fn to_topic(&self) -> Result<String, ValidationError> {
        compose_event_topic(&self.device_type, &self.event_name, self.node.as_deref())
    }
}

/// Inverse of [`compose_event_topic`]
///
/// The global marker comes back on the event name, so a triple composed with a
/// dotted device type parses to its normalized form.
pub fn parse_event_topic(topic: &str) -> Result<EventTopic, ValidationError> {
    if is_reserved(topic) {
        return Err(ValidationError::ReservedTopic(topic.to_string()));
    }

    let (global, rest) = match topic.strip_prefix('.') {
        Some(rest) => (true, rest),
        None => (false, topic),
    };

    let segments: Vec<&str> = rest.split('/').collect();
    let (device_type, event_name, node) = match segments.as_slice() {
        [device_type, event_name] => (*device_type, *event_name, None),
        [device_type, event_name, node] => (*device_type, *event_name, Some(*node)),
        _ => return Err(ValidationError::MalformedEventTopic(topic.to_string())),
    };

    for segment in [Some(device_type), Some(event_name), node].into_iter().flatten() {
        if !NODE_PATTERN.is_match(segment) {
            return Err(ValidationError::MalformedEventTopic(topic.to_string()));
        }
    }

    Ok(EventTopic {
        device_type: device_type.to_string(),
        event_name: if global {
            format!(".{event_name}")
        } else {
            event_name.to_string()
        },
        node: node.map(str::to_string),
    })
}

/// Namespace validation errors, raised before anything reaches the transport
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Name '{0}' must match ^\\.?[A-Za-z0-9_]+$")]
    InvalidIdentity(String),
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,
    #[error("Device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("publish/subscribe to reserved topic '{0}'")]
    ReservedTopic(String),
    #[error("Malformed event topic: '{0}'")]
    MalformedEventTopic(String),
    #[error("No device type configured for event publishing")]
    MissingDeviceType,
}
