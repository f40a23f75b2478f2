use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::Landmark;

/// A frame that failed validation and was discarded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("hand {track_id}: non-finite coordinate for {landmark:?}")]
    NonFinite { track_id: u32, landmark: Landmark },
    #[error("hand {track_id}: confidence {confidence} outside [0, 1]")]
    ConfidenceOutOfRange { track_id: u32, confidence: f32 },
    #[error("hand {track_id}: missing required landmark {landmark:?}")]
    MissingLandmark { track_id: u32, landmark: Landmark },
    #[error("timestamp went backwards ({prev_ms} ms -> {now_ms} ms)")]
    TimestampRegressed { prev_ms: u64, now_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProfileError {
    #[error("open_threshold ({open}) must be strictly greater than close_threshold ({close})")]
    ThresholdOrder { close: f32, open: f32 },
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("unknown preset '{0}' (expected Default, Precision or Chill)")]
    UnknownPreset(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SinkError {
    #[error("output device error: {0}")]
    Device(String),
    #[error("output sink did not respond within {0:?}")]
    Timeout(Duration),
    #[error("output sink worker is gone")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session io: {0}")]
    Io(#[from] std::io::Error),
    #[error("session line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("session file has no header line")]
    MissingHeader,
    #[error("unsupported session version {0}")]
    Version(u32),
    #[error("session profile is invalid: {0}")]
    Profile(#[from] ProfileError),
    #[error("replay diverged at entry {index}: expected {expected}, got {actual}")]
    Mismatch {
        index: usize,
        expected: String,
        actual: String,
    },
}

/// Why the system dropped into `SafeOff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailSafeReason {
    TrackingLost,
    Panic,
    SinkFailure,
    Shutdown,
    Manual,
}

impl FailSafeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrackingLost => "tracking-lost",
            Self::Panic => "panic",
            Self::SinkFailure => "sink-failure",
            Self::Shutdown => "shutdown",
            Self::Manual => "manual",
        }
    }
}
