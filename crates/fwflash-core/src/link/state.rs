//! Link states of a target device.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No contact yet, or the target was put into reset.
    #[default]
    Disconnected,
    /// Probing; waiting for a first answer.
    Connecting,
    /// Target answers probes.
    Connected,
    /// A flash job owns the link.
    Flashing,
    /// Repeated probes went unanswered.
    Unresponsive,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "DISCONNECTED"),
            LinkState::Connecting => write!(f, "CONNECTING"),
            LinkState::Connected => write!(f, "CONNECTED"),
            LinkState::Flashing => write!(f, "FLASHING"),
            LinkState::Unresponsive => write!(f, "UNRESPONSIVE"),
        }
    }
}

impl LinkState {
    /// States from which a probe result may move the link.
    pub fn accepts_probe(&self) -> bool {
        !matches!(self, LinkState::Flashing)
    }

    /// Whether a new flash job may start from this state.
    pub fn can_start_flash(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}
