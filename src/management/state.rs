//! Connection and management state of a device

use std::fmt;

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagementState {
    Disconnected,
    Connecting,
    /// Connected but not taking part in management
    Connected,
    /// REGIST sent, waiting for the inbox subscription
    Registering,
    /// Inbox subscribed; control/config requests are accepted
    Managed,
    /// Registration failed
    Unmanaged,
    Reconnecting,
    Offline,
    /// Closed by the application; terminal
    Closed,
}

impl ManagementState {
    pub fn is_managed(self) -> bool {
        matches!(self, ManagementState::Managed)
    }

    pub fn is_closed(self) -> bool {
        matches!(self, ManagementState::Closed)
    }
}

impl fmt::Display for ManagementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManagementState::Disconnected => "disconnected",
            ManagementState::Connecting => "connecting",
            ManagementState::Connected => "connected",
            ManagementState::Registering => "registering",
            ManagementState::Managed => "managed",
            ManagementState::Unmanaged => "unmanaged",
            ManagementState::Reconnecting => "reconnecting",
            ManagementState::Offline => "offline",
            ManagementState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Whether a device takes part in management, fixed when it is built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    /// Registers on every connect and accepts the declared request types
    Managed { control: bool, config: bool },
    /// Plain application client; never touches reserved topics
    Unmanaged,
}

impl DeviceRole {
    pub fn from_capabilities(control: bool, config: bool) -> Self {
        if control || config {
            DeviceRole::Managed { control, config }
        } else {
            DeviceRole::Unmanaged
        }
    }

    pub fn is_managed(self) -> bool {
        matches!(self, DeviceRole::Managed { .. })
    }

    /// Capability names advertised in REGIST
    pub fn capabilities(self) -> Vec<String> {
        match self {
            DeviceRole::Managed { control, config } => {
                let mut capabilities = Vec::new();
                if control {
                    capabilities.push("control".to_string());
                }
                if config {
                    capabilities.push("config".to_string());
                }
                capabilities
            }
            DeviceRole::Unmanaged => Vec::new(),
        }
    }
}
