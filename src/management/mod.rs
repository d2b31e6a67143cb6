//! Device-management protocol engine
//!
//! - [`transactions`] - correlation-id registry for device-initiated requests
//! - [`reply`] - handler results and `done` continuations
//! - [`handlers`] - control/config handler traits
//! - [`dispatcher`] - routing of inbound management envelopes
//! - [`state`] - lifecycle state and the device's management role

pub mod dispatcher;
pub mod handlers;
pub mod reply;
pub mod state;
pub mod transactions;

pub use dispatcher::{
    classify, DispatchOutcome, ManagementDispatcher, ManagementRoute, ResponseSink,
    UNSUPPORTED_OPERATION,
};
pub use handlers::{
    ConfigHandler, ConfigResponder, ConfigUpdate, ControlHandler, ControlResponder, Responder,
};
pub use reply::{Done, PendingReply, Reply, ReplyResult};
pub use state::{DeviceRole, ManagementState};
pub use transactions::{Completion, TransactionTable};
