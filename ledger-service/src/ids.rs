//! Content-derived identifiers. Every id is a blake3 hex digest over
//! length-prefixed fields, so the same input always yields the same id.

use ledger_client::domain::{AnomalyKind, EntryKind, Payload};
use time::OffsetDateTime;

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

fn hash_opt_str(hasher: &mut blake3::Hasher, s: Option<&str>) {
    match s {
        Some(v) => {
            hasher.update(&[1]);
            hash_str(hasher, v);
        }
        None => {
            hasher.update(&[0]);
        }
    }
}

fn hash_opt_f64(hasher: &mut blake3::Hasher, v: Option<f64>) {
    match v {
        Some(x) => {
            hasher.update(&[1]);
            hasher.update(&x.to_bits().to_le_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
}

/// Dedup key of a telemetry event: device, switch, timestamp, kind and the
/// decoded payload fields.
pub fn event_id(
    device_id: &str,
    switch_id: Option<&str>,
    timestamp: OffsetDateTime,
    payload: &Payload,
) -> String {
    let mut h = blake3::Hasher::new();
    hash_str(&mut h, "telemetry");
    hash_str(&mut h, device_id);
    hash_opt_str(&mut h, switch_id);
    h.update(&timestamp.unix_timestamp_nanos().to_le_bytes());
    hash_str(&mut h, payload.kind().as_str());
    match payload {
        Payload::SwitchOn { meter_wh } | Payload::SwitchOff { meter_wh } => {
            hash_opt_f64(&mut h, *meter_wh);
        }
        Payload::PowerReading { power_w, energy_wh } => {
            hash_opt_f64(&mut h, *power_w);
            hash_opt_f64(&mut h, *energy_wh);
        }
        Payload::Heartbeat => {}
    }
    h.finalize().to_hex().to_string()
}

pub fn entry_id(start_event_id: &str, kind: EntryKind, supersedes: Option<&str>) -> String {
    let mut h = blake3::Hasher::new();
    hash_str(&mut h, "ledger-entry");
    hash_str(&mut h, start_event_id);
    hash_str(&mut h, kind.as_str());
    hash_opt_str(&mut h, supersedes);
    h.finalize().to_hex().to_string()
}

pub fn anomaly_id(kind: AnomalyKind, entry_ids: &[String]) -> String {
    let mut h = blake3::Hasher::new();
    hash_str(&mut h, "anomaly");
    hash_str(&mut h, kind.as_str());
    h.update(&(entry_ids.len() as u32).to_le_bytes());
    for id in entry_ids {
        hash_str(&mut h, id);
    }
    h.finalize().to_hex().to_string()
}
