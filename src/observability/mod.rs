//! Observability for the device client
//!
//! Structured logging via `tracing`, plus span macros shared by the device
//! lifecycle and the management dispatcher.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use crate::{device_span, management_span};
