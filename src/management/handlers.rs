//! Application-side handlers for inbound management requests

use super::reply::Reply;
use serde_json::Value;
use std::sync::Arc;

/// Answers CONTROL requests
pub trait ControlHandler: Send + Sync {
    fn on_control(&self, name: &str, args: Vec<Value>) -> Reply;
}

impl<F> ControlHandler for F
where
    F: Fn(&str, Vec<Value>) -> Reply + Send + Sync,
{
    fn on_control(&self, name: &str, args: Vec<Value>) -> Reply {
        self(name, args)
    }
}

/// Configuration delivered to a config handler
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigUpdate {
    /// A single entry pushed by a CONFIG request
    Entry { name: String, value: Value },
    /// Whole configuration pulled with LOADCONFIG
    Snapshot(Value),
}

/// Answers CONFIG requests and receives loaded configuration
pub trait ConfigHandler: Send + Sync {
    fn on_config(&self, update: ConfigUpdate) -> Reply;
}

impl<F> ConfigHandler for F
where
    F: Fn(ConfigUpdate) -> Reply + Send + Sync,
{
    fn on_config(&self, update: ConfigUpdate) -> Reply {
        self(update)
    }
}

/// How a request type is answered: by a registered handler, or by
/// notifying the application with a `Done` continuation
pub enum Responder<H: ?Sized> {
    Handler(Arc<H>),
    Notify,
}

impl<H: ?Sized> Clone for Responder<H> {
    fn clone(&self) -> Self {
        match self {
            Responder::Handler(handler) => Responder::Handler(handler.clone()),
            Responder::Notify => Responder::Notify,
        }
    }
}

impl<H: ?Sized> std::fmt::Debug for Responder<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Responder::Handler(_) => f.write_str("Handler"),
            Responder::Notify => f.write_str("Notify"),
        }
    }
}

pub type ControlResponder = Responder<dyn ControlHandler>;
pub type ConfigResponder = Responder<dyn ConfigHandler>;
