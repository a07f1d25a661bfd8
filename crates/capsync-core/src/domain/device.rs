//! Device identity and connection state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Device identifier announced in the handshake.  Never empty.
pub type DeviceId = String;

/// Lifecycle of one device connection.
///
/// ```text
/// Connecting ──► Connected ──► Reconnecting
///      │             ├───────► Error
///      └─────────────┴───────► Disconnected
/// ```
///
/// `Reconnecting`, `Error`, and `Disconnected` are terminal for a connection;
/// a device that comes back gets a brand-new connection starting at
/// `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceConnectionState {
    /// Socket accepted, handshake not yet completed.
    Connecting,
    /// Handshake accepted; the device is live in the registry.
    Connected,
    /// Replaced by a newer connection presenting the same device ID.
    Reconnecting,
    /// Closed after exceeding the error threshold.
    Error,
    /// Closed cleanly, by heartbeat timeout, or by shutdown.
    Disconnected,
}

impl DeviceConnectionState {
    /// Returns `true` if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        use DeviceConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Error)
                | (Connected, Disconnected)
        )
    }

    /// `true` once the connection can no longer carry traffic.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Reconnecting | Self::Error | Self::Disconnected)
    }
}

impl fmt::Display for DeviceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Health fields reported by a device in `status` messages.
///
/// Every field is optional on the wire; a report only overwrites the fields
/// it carries (see [`DeviceStatus::merge`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Battery charge in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    /// Free storage, in the unit the device reports (usually MB).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<f64>,
    /// Device temperature in °C.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Whether the device believes it is recording.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording: Option<bool>,
    /// Whether the device's sensors are attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
}

impl DeviceStatus {
    /// Overwrites the fields present in `report`, keeping the rest.
    pub fn merge(&mut self, report: &DeviceStatus) {
        if report.battery.is_some() {
            self.battery = report.battery;
        }
        if report.storage.is_some() {
            self.storage = report.storage;
        }
        if report.temperature.is_some() {
            self.temperature = report.temperature;
        }
        if report.recording.is_some() {
            self.recording = report.recording;
        }
        if report.connected.is_some() {
            self.connected = report.connected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeviceConnectionState::*;

    #[test]
    fn test_connecting_can_only_promote_or_drop() {
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(!Connecting.can_transition_to(Error));
        assert!(!Connecting.can_transition_to(Reconnecting));
    }

    #[test]
    fn test_connected_can_reach_every_terminal_state() {
        for next in [Reconnecting, Error, Disconnected] {
            assert!(Connected.can_transition_to(next), "{next} must be reachable");
        }
    }

    #[test]
    fn test_terminal_states_have_no_exit() {
        for state in [Reconnecting, Error, Disconnected] {
            assert!(state.is_terminal());
            for next in [Connecting, Connected, Reconnecting, Error, Disconnected] {
                assert!(!state.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_status_merge_keeps_fields_absent_from_report() {
        // Arrange
        let mut status = DeviceStatus {
            battery: Some(90.0),
            storage: Some(1024.0),
            ..DeviceStatus::default()
        };
        let report = DeviceStatus {
            battery: Some(85.0),
            recording: Some(true),
            ..DeviceStatus::default()
        };

        // Act
        status.merge(&report);

        // Assert
        assert_eq!(status.battery, Some(85.0));
        assert_eq!(status.storage, Some(1024.0));
        assert_eq!(status.recording, Some(true));
        assert_eq!(status.temperature, None);
    }
}
