//! Per-target link state machine.
//!
//! Transport callbacks and manager decisions are translated into
//! [`LinkEvent`]s; [`LinkState::on`] is the only place a state changes.

use serde::Serialize;
use strum_macros::{AsRefStr, Display};

/// Lifecycle of one broker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LinkState {
    Disabled,
    Connecting,
    Disconnected,
    Connected,
    Reconnecting,
    Failed,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Enable,
    Disable,
    ConnectStarted,
    Connected,
    ConnectFailed { fatal: bool },
    SessionLost,
    ReconnectRequested,
}

impl LinkState {
    /// Next state after `event`. A disabled link only leaves `Disabled` on `Enable`.
    pub fn on(self, event: LinkEvent) -> LinkState {
        use LinkEvent as E;
        use LinkState as S;

        match (self, event) {
            (_, E::Disable) => S::Disabled,
            (S::Disabled, E::Enable) => S::Disconnected,
            (S::Disabled, _) => S::Disabled,
            (state, E::Enable) => state,

            (S::Connected | S::Reconnecting, E::ConnectStarted) => S::Reconnecting,
            (_, E::ConnectStarted) => S::Connecting,

            (_, E::Connected) => S::Connected,

            (_, E::ConnectFailed { fatal: true }) => S::Failed,
            (_, E::ConnectFailed { fatal: false }) => S::Disconnected,

            (S::Failed, E::SessionLost) => S::Failed,
            (_, E::SessionLost) => S::Disconnected,

            (_, E::ReconnectRequested) => S::Reconnecting,
        }
    }

    pub fn is_connected(self) -> bool {
        self == LinkState::Connected
    }
}

/// Observable snapshot of one link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub target: String,
    pub enabled: bool,
    pub state: LinkState,
    pub active_endpoint: Option<String>,
    pub verified: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl LinkStatus {
    pub fn new(target: impl Into<String>, enabled: bool) -> Self {
        Self {
            target: target.into(),
            enabled,
            state: if enabled {
                LinkState::Disconnected
            } else {
                LinkState::Disabled
            },
            active_endpoint: None,
            verified: false,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}
