use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Per-stream identity. `switch_id` is `None` for device-level readings and
/// heartbeats that are not tied to a single relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwitchKey {
    pub device_id: String,
    pub switch_id: Option<String>,
}

impl SwitchKey {
    pub fn new(device_id: impl Into<String>, switch_id: Option<String>) -> Self {
        Self {
            device_id: device_id.into(),
            switch_id,
        }
    }

    pub fn switch(device_id: impl Into<String>, switch_id: impl Into<String>) -> Self {
        Self::new(device_id, Some(switch_id.into()))
    }
}

impl fmt::Display for SwitchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.switch_id {
            Some(s) => write!(f, "{}/{}", self.device_id, s),
            None => write!(f, "{}/*", self.device_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SwitchOn,
    SwitchOff,
    PowerReading,
    Heartbeat,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SwitchOn => "switch_on",
            Self::SwitchOff => "switch_off",
            Self::PowerReading => "power_reading",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "switch_on" => Ok(Self::SwitchOn),
            "switch_off" => Ok(Self::SwitchOff),
            "power_reading" => Ok(Self::PowerReading),
            "heartbeat" => Ok(Self::Heartbeat),
            other => Err(format!("unknown event kind '{other}'")),
        }
    }
}

/// Decoded event body. The variant is the event kind; each carries only the
/// fields that kind may have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_kind", rename_all = "snake_case")]
pub enum Payload {
    SwitchOn {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meter_wh: Option<f64>,
    },
    SwitchOff {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meter_wh: Option<f64>,
    },
    PowerReading {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        power_w: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        energy_wh: Option<f64>,
    },
    Heartbeat,
}

impl Payload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SwitchOn { .. } => EventKind::SwitchOn,
            Self::SwitchOff { .. } => EventKind::SwitchOff,
            Self::PowerReading { .. } => EventKind::PowerReading,
            Self::Heartbeat => EventKind::Heartbeat,
        }
    }

    /// Cumulative meter value carried by this event, if any.
    pub fn meter_wh(&self) -> Option<f64> {
        match self {
            Self::SwitchOn { meter_wh } | Self::SwitchOff { meter_wh } => *meter_wh,
            Self::PowerReading { energy_wh, .. } => *energy_wh,
            Self::Heartbeat => None,
        }
    }

    pub fn power_w(&self) -> Option<f64> {
        match self {
            Self::PowerReading { power_w, .. } => *power_w,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    TimeDrift,
    OutOfOrder,
    GapDetected,
}

impl QualityFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeDrift => "time_drift",
            Self::OutOfOrder => "out_of_order",
            Self::GapDetected => "gap_detected",
        }
    }
}

impl FromStr for QualityFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time_drift" => Ok(Self::TimeDrift),
            "out_of_order" => Ok(Self::OutOfOrder),
            "gap_detected" => Ok(Self::GapDetected),
            other => Err(format!("unknown quality flag '{other}'")),
        }
    }
}

/// Processing order within a stream: producer timestamp, then arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventPosition {
    pub timestamp: OffsetDateTime,
    pub seq: i64,
}

impl EventPosition {
    pub fn new(timestamp: OffsetDateTime, seq: i64) -> Self {
        Self { timestamp, seq }
    }

    /// Position after every event stamped at `timestamp`.
    pub fn end_of(timestamp: OffsetDateTime) -> Self {
        Self {
            timestamp,
            seq: i64::MAX,
        }
    }
}

/// An event that passed validation and is about to be appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTelemetryEvent {
    pub event_id: String,
    pub device_id: String,
    pub switch_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub payload: Payload,
    pub quality_flags: BTreeSet<QualityFlag>,
}

impl NewTelemetryEvent {
    pub fn key(&self) -> SwitchKey {
        SwitchKey::new(self.device_id.clone(), self.switch_id.clone())
    }
}

/// A stored, immutable telemetry event. Only `processed` changes after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub seq: i64,
    pub event_id: String,
    pub device_id: String,
    pub switch_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub payload: Payload,
    pub quality_flags: BTreeSet<QualityFlag>,
    pub processed: bool,
}

impl TelemetryEvent {
    pub fn from_new(event: NewTelemetryEvent, seq: i64) -> Self {
        Self {
            seq,
            event_id: event.event_id,
            device_id: event.device_id,
            switch_id: event.switch_id,
            timestamp: event.timestamp,
            received_at: event.received_at,
            payload: event.payload,
            quality_flags: event.quality_flags,
            processed: false,
        }
    }

    pub fn key(&self) -> SwitchKey {
        SwitchKey::new(self.device_id.clone(), self.switch_id.clone())
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.timestamp, self.seq)
    }
}
