//! Wire shape of a telemetry submission and its validation into a
//! [`Payload`].

use ledger_client::domain::{EventKind, Payload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// A submission as sent by the ESP32 firmware. Every field is optional at this
/// level so that a malformed item can be reported without failing the batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySubmission {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub switch_id: Option<String>,
    /// RFC3339 string or integer unix milliseconds.
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub event_kind: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RejectReason {
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("timestamp {0} outside the accepted range")]
    TimestampOutOfRange(OffsetDateTime),
    #[error("unknown event kind '{0}'")]
    UnknownEventKind(String),
    #[error("invalid {kind} payload: {detail}")]
    InvalidPayload { kind: &'static str, detail: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTelemetry {
    pub device_id: String,
    pub switch_id: Option<String>,
    pub timestamp: OffsetDateTime,
    pub payload: Payload,
}

#[derive(Deserialize)]
struct SwitchBody {
    state: bool,
    #[serde(default)]
    meter_wh: Option<f64>,
}

#[derive(Deserialize)]
struct ReadingBody {
    #[serde(default)]
    power_w: Option<f64>,
    #[serde(default)]
    energy_wh: Option<f64>,
}

const MIN_YEAR: i32 = 2000;
const MAX_YEAR: i32 = 2100;

pub fn decode(sub: &TelemetrySubmission) -> Result<DecodedTelemetry, RejectReason> {
    let device_id = non_empty(sub.device_id.as_deref()).ok_or(RejectReason::MissingField("device_id"))?;
    let switch_id = non_empty(sub.switch_id.as_deref());
    let timestamp = parse_timestamp(
        sub.timestamp
            .as_ref()
            .ok_or(RejectReason::MissingField("timestamp"))?,
    )?;
    let kind: EventKind = sub
        .event_kind
        .as_deref()
        .ok_or(RejectReason::MissingField("event_kind"))?
        .parse()
        .map_err(|_| RejectReason::UnknownEventKind(sub.event_kind.clone().unwrap_or_default()))?;

    if matches!(kind, EventKind::SwitchOn | EventKind::SwitchOff) && switch_id.is_none() {
        return Err(RejectReason::MissingField("switch_id"));
    }

    let payload = decode_payload(kind, &sub.payload)?;

    Ok(DecodedTelemetry {
        device_id: device_id.to_string(),
        switch_id: switch_id.map(str::to_string),
        timestamp,
        payload,
    })
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn parse_timestamp(value: &Value) -> Result<OffsetDateTime, RejectReason> {
    let ts = match value {
        Value::String(s) => OffsetDateTime::parse(s, &Rfc3339)
            .map_err(|e| RejectReason::InvalidTimestamp(format!("'{s}': {e}")))?,
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .ok_or_else(|| RejectReason::InvalidTimestamp(format!("{n} is not integer milliseconds")))?;
            OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
                .map_err(|e| RejectReason::InvalidTimestamp(format!("{millis}: {e}")))?
        }
        other => {
            return Err(RejectReason::InvalidTimestamp(format!(
                "expected string or integer, got {other}"
            )))
        }
    };

    if !(MIN_YEAR..MAX_YEAR).contains(&ts.year()) {
        return Err(RejectReason::TimestampOutOfRange(ts));
    }
    Ok(ts)
}

fn decode_payload(kind: EventKind, body: &Value) -> Result<Payload, RejectReason> {
    let invalid = |detail: String| RejectReason::InvalidPayload {
        kind: kind.as_str(),
        detail,
    };

    match kind {
        EventKind::SwitchOn | EventKind::SwitchOff => {
            let parsed: SwitchBody =
                serde_json::from_value(body.clone()).map_err(|e| invalid(e.to_string()))?;
            let expected = kind == EventKind::SwitchOn;
            if parsed.state != expected {
                return Err(invalid(format!("state {} contradicts event kind", parsed.state)));
            }
            check_quantity("meter_wh", parsed.meter_wh).map_err(invalid)?;
            Ok(if expected {
                Payload::SwitchOn { meter_wh: parsed.meter_wh }
            } else {
                Payload::SwitchOff { meter_wh: parsed.meter_wh }
            })
        }
        EventKind::PowerReading => {
            let parsed: ReadingBody =
                serde_json::from_value(body.clone()).map_err(|e| invalid(e.to_string()))?;
            if parsed.power_w.is_none() && parsed.energy_wh.is_none() {
                return Err(invalid("needs power_w or energy_wh".to_string()));
            }
            check_quantity("power_w", parsed.power_w).map_err(invalid)?;
            check_quantity("energy_wh", parsed.energy_wh).map_err(invalid)?;
            Ok(Payload::PowerReading {
                power_w: parsed.power_w,
                energy_wh: parsed.energy_wh,
            })
        }
        EventKind::Heartbeat => match body {
            Value::Null | Value::Object(_) => Ok(Payload::Heartbeat),
            other => Err(invalid(format!("expected object, got {other}"))),
        },
    }
}

fn check_quantity(name: &str, value: Option<f64>) -> Result<(), String> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(format!("{name} must be a non-negative number, got {v}")),
        _ => Ok(()),
    }
}
