//! Wire protocol for device management
//!
//! This module defines the management envelope and the topic namespace rules
//! shared by the device and the broker-side management service.

pub mod envelope;
pub mod topics;

pub use envelope::*;
pub use topics::*;
