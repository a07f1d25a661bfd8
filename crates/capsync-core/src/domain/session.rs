//! Recording sessions and sensor samples.
//!
//! A [`Session`] is one host-coordinated recording run.  At most one is
//! active host-wide; that rule is enforced by the orchestrator that owns the
//! active slot, not here.  Once closed, a session moves into a bounded,
//! read-only [`SessionHistory`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::domain::device::DeviceId;

/// Which modalities devices should record, sent as flags in `start_record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingOptions {
    #[serde(default = "default_true")]
    pub record_video: bool,
    #[serde(default = "default_true")]
    pub record_thermal: bool,
    #[serde(default)]
    pub record_shimmer: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RecordingOptions {
    fn default() -> Self {
        Self {
            record_video: true,
            record_thermal: true,
            record_shimmer: false,
        }
    }
}

/// One recording run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub options: RecordingOptions,
    /// Host wall clock, float seconds since the Unix epoch.
    pub started_at: f64,
    pub ended_at: Option<f64>,
    /// Devices that accepted `start_record`.
    pub devices: BTreeSet<DeviceId>,
    /// Sensor samples received while the session was active.
    pub sample_count: u64,
    /// File names collected per device.
    pub files: BTreeMap<DeviceId, Vec<String>>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        options: RecordingOptions,
        devices: BTreeSet<DeviceId>,
        started_at: f64,
    ) -> Self {
        Self {
            id: id.into(),
            options,
            started_at,
            ended_at: None,
            devices,
            sample_count: 0,
            files: BTreeMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn record_sample(&mut self) {
        self.sample_count = self.sample_count.saturating_add(1);
    }

    pub fn record_file(&mut self, device_id: &str, name: impl Into<String>) {
        self.files
            .entry(device_id.to_string())
            .or_default()
            .push(name.into());
    }

    /// Stamps the end time.  A second call keeps the first stamp.
    pub fn close(&mut self, ended_at: f64) {
        if self.ended_at.is_none() {
            self.ended_at = Some(ended_at);
        }
    }

    /// Elapsed seconds, measured to `now` while the session is still open.
    pub fn duration_secs(&self, now: f64) -> f64 {
        (self.ended_at.unwrap_or(now) - self.started_at).max(0.0)
    }

    pub fn file_count(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }
}

/// Closed sessions, oldest first, capped at a fixed capacity.
#[derive(Debug, Clone)]
pub struct SessionHistory {
    entries: VecDeque<Session>,
    capacity: usize,
}

impl SessionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Appends a closed session, evicting the oldest entry when full.
    pub fn push(&mut self, session: Session) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(session);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&Session> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.entries.iter()
    }

    /// Owned copy, oldest first.
    pub fn to_vec(&self) -> Vec<Session> {
        self.entries.iter().cloned().collect()
    }
}

/// One timestamped sensor observation, produced from a `sensor_data` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub device_id: DeviceId,
    /// Active session at receive time, if any.
    pub session_id: Option<String>,
    /// Sender timestamp from the wire message.
    pub timestamp: f64,
    pub values: BTreeMap<String, f64>,
}
