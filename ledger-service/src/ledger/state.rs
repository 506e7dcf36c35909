//! Per-switch interval state machine.
//!
//! A stream is either idle or has one open interval. Events are applied in
//! `(timestamp, seq)` order and closing an interval yields a
//! [`ClosedInterval`], which the generator prices and appends to the ledger.
//! Nothing in here touches storage.

use ledger_client::domain::{
    CalculationMethod, Confidence, EntryKind, LedgerEntry, Payload, TelemetryEvent,
};
use time::OffsetDateTime;

use crate::catalog::SwitchProfile;

#[derive(Debug, Clone, PartialEq)]
pub struct EventRef {
    pub event_id: String,
    pub timestamp: OffsetDateTime,
}

impl EventRef {
    pub fn of(event: &TelemetryEvent) -> Self {
        Self {
            event_id: event.event_id.clone(),
            timestamp: event.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterMark {
    pub at: EventRef,
    pub value_wh: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    /// Energy is integrated from the power in effect between readings,
    /// starting from the rated power.
    Integration {
        current_w: f64,
        last_ts: OffsetDateTime,
        energy_wh: f64,
    },
    /// Energy is the difference of cumulative counter readings.
    Meter {
        baseline_wh: Option<f64>,
        last: Option<MeterMark>,
        /// The baseline came from a reading after the interval opened.
        baseline_late: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenInterval {
    pub start: EventRef,
    pub rating_w: Option<f64>,
    pub acc: Accumulator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosedInterval {
    pub start: EventRef,
    /// `None` when closed by an offline signal rather than an event.
    pub end_event_id: Option<String>,
    pub end_ts: OffsetDateTime,
    pub delta_energy_wh: f64,
    pub power_w: f64,
    pub method: CalculationMethod,
    pub confidence: Confidence,
    pub kind: EntryKind,
}

impl ClosedInterval {
    pub fn duration_seconds(&self) -> f64 {
        (self.end_ts - self.start.timestamp).as_seconds_f64()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SwitchState {
    #[default]
    Idle,
    Active(OpenInterval),
}

fn energy_between(power_w: f64, from: OffsetDateTime, to: OffsetDateTime) -> f64 {
    if to > from {
        power_w * (to - from).as_seconds_f64() / 3600.0
    } else {
        0.0
    }
}

impl OpenInterval {
    fn open(at: EventRef, meter_wh: Option<f64>, profile: &SwitchProfile) -> Self {
        let acc = match profile.method {
            CalculationMethod::PowerIntegration => Accumulator::Integration {
                current_w: profile.power_w.unwrap_or(0.0),
                last_ts: at.timestamp,
                energy_wh: 0.0,
            },
            CalculationMethod::CumulativeMeter => Accumulator::Meter {
                baseline_wh: meter_wh,
                last: meter_wh.map(|value_wh| MeterMark {
                    at: at.clone(),
                    value_wh,
                }),
                baseline_late: false,
            },
        };
        Self {
            start: at,
            rating_w: profile.power_w,
            acc,
        }
    }

    /// Metered interval that begins at a reading, used after a reset and when
    /// resuming from the ledger.
    fn at_reading(at: EventRef, value_wh: f64, rating_w: Option<f64>) -> Self {
        Self {
            start: at.clone(),
            rating_w,
            acc: Accumulator::Meter {
                baseline_wh: Some(value_wh),
                last: Some(MeterMark { at, value_wh }),
                baseline_late: false,
            },
        }
    }

    fn power_w(&self) -> f64 {
        self.rating_w.unwrap_or(0.0)
    }

    fn integration_confidence(&self) -> Confidence {
        if self.rating_w.is_some() {
            Confidence::High
        } else {
            Confidence::Low
        }
    }

    fn closed(
        &self,
        end_event_id: Option<String>,
        end_ts: OffsetDateTime,
        delta_energy_wh: f64,
        method: CalculationMethod,
        confidence: Confidence,
    ) -> ClosedInterval {
        ClosedInterval {
            start: self.start.clone(),
            end_event_id,
            end_ts,
            delta_energy_wh,
            power_w: self.power_w(),
            method,
            confidence,
            kind: EntryKind::Consumption,
        }
    }

    /// Rated-power estimate for a metered switch that never produced a usable
    /// reading.
    fn rated_estimate(&self, end_event_id: Option<String>, end_ts: OffsetDateTime) -> ClosedInterval {
        let energy = energy_between(self.power_w(), self.start.timestamp, end_ts);
        let confidence = self.integration_confidence().min(Confidence::Medium);
        self.closed(
            end_event_id,
            end_ts,
            energy,
            CalculationMethod::PowerIntegration,
            confidence,
        )
    }

    fn observe(&mut self, at: EventRef, power_w: Option<f64>, energy_wh: Option<f64>) -> Vec<ClosedInterval> {
        if matches!(self.acc, Accumulator::Meter { .. }) {
            return match energy_wh {
                Some(value) => self.observe_meter(at, value),
                None => Vec::new(),
            };
        }

        if let (
            Accumulator::Integration {
                current_w,
                last_ts,
                energy_wh: acc,
            },
            Some(p),
        ) = (&mut self.acc, power_w)
        {
            *acc += energy_between(*current_w, *last_ts, at.timestamp);
            *last_ts = (*last_ts).max(at.timestamp);
            *current_w = p;
        }
        Vec::new()
    }

    fn observe_meter(&mut self, at: EventRef, value_wh: f64) -> Vec<ClosedInterval> {
        let current = match &self.acc {
            Accumulator::Meter {
                baseline_wh: Some(b),
                last: Some(l),
                ..
            } => Some((*b, l.clone())),
            _ => None,
        };
        let Some((baseline, last)) = current else {
            // First reading of the interval becomes the baseline.
            self.acc = Accumulator::Meter {
                baseline_wh: Some(value_wh),
                last: Some(MeterMark { at, value_wh }),
                baseline_late: true,
            };
            return Vec::new();
        };

        if value_wh < last.value_wh {
            let closed = self.split_at_reset(baseline, &last, &at);
            *self = OpenInterval::at_reading(at, value_wh, self.rating_w);
            return closed;
        }

        if let Accumulator::Meter { last, .. } = &mut self.acc {
            *last = Some(MeterMark { at, value_wh });
        }
        Vec::new()
    }

    fn meter_confidence(&self) -> Confidence {
        match self.acc {
            Accumulator::Meter {
                baseline_late: true, ..
            } => Confidence::Medium,
            _ => Confidence::High,
        }
    }

    /// The counter went backwards between `last` and `reset_at`: consumption
    /// up to the last good reading, then a marker over the ambiguous span.
    fn split_at_reset(&self, baseline: f64, last: &MeterMark, reset_at: &EventRef) -> Vec<ClosedInterval> {
        let mut out = Vec::with_capacity(2);
        if last.at.timestamp > self.start.timestamp {
            out.push(self.closed(
                Some(last.at.event_id.clone()),
                last.at.timestamp,
                last.value_wh - baseline,
                CalculationMethod::CumulativeMeter,
                self.meter_confidence(),
            ));
        }
        if reset_at.timestamp > last.at.timestamp {
            out.push(ClosedInterval {
                start: last.at.clone(),
                end_event_id: Some(reset_at.event_id.clone()),
                end_ts: reset_at.timestamp,
                delta_energy_wh: 0.0,
                power_w: self.power_w(),
                method: CalculationMethod::CumulativeMeter,
                confidence: Confidence::Medium,
                kind: EntryKind::ResetMarker,
            });
        }
        out
    }

    fn close_on_off(self, at: EventRef, meter_wh: Option<f64>) -> Vec<ClosedInterval> {
        if at.timestamp <= self.start.timestamp {
            return Vec::new();
        }

        match &self.acc {
            Accumulator::Integration {
                current_w,
                last_ts,
                energy_wh,
            } => {
                let total = energy_wh + energy_between(*current_w, *last_ts, at.timestamp);
                vec![self.closed(
                    Some(at.event_id),
                    at.timestamp,
                    total,
                    CalculationMethod::PowerIntegration,
                    self.integration_confidence(),
                )]
            }
            Accumulator::Meter {
                baseline_wh: Some(baseline),
                last: Some(last),
                ..
            } => match meter_wh {
                Some(end) if end < last.value_wh => self.split_at_reset(*baseline, last, &at),
                Some(end) => vec![self.closed(
                    Some(at.event_id),
                    at.timestamp,
                    end - baseline,
                    CalculationMethod::CumulativeMeter,
                    self.meter_confidence(),
                )],
                // Nothing known after the last reading.
                None => vec![self.closed(
                    Some(at.event_id),
                    at.timestamp,
                    last.value_wh - baseline,
                    CalculationMethod::CumulativeMeter,
                    Confidence::Medium,
                )],
            },
            Accumulator::Meter { .. } => vec![self.rated_estimate(Some(at.event_id), at.timestamp)],
        }
    }

    fn close_offline(&self, offline_at: OffsetDateTime) -> ClosedInterval {
        match &self.acc {
            Accumulator::Integration {
                current_w,
                last_ts,
                energy_wh,
            } => {
                let total = energy_wh + energy_between(*current_w, *last_ts, offline_at);
                self.closed(
                    None,
                    offline_at,
                    total,
                    CalculationMethod::PowerIntegration,
                    self.integration_confidence().min(Confidence::Medium),
                )
            }
            Accumulator::Meter {
                baseline_wh: Some(baseline),
                last: Some(last),
                ..
            } => self.closed(
                None,
                offline_at,
                last.value_wh - baseline,
                CalculationMethod::CumulativeMeter,
                Confidence::Medium,
            ),
            Accumulator::Meter { .. } => self.rated_estimate(None, offline_at),
        }
    }
}

impl SwitchState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    pub fn open_interval(&self) -> Option<&OpenInterval> {
        match self {
            Self::Active(open) => Some(open),
            Self::Idle => None,
        }
    }

    /// State right after `entry`, the latest ledger entry of the switch. A
    /// metered interval that ended at a reading continues from that reading;
    /// anything else ended with the switch off.
    pub fn after_entry(
        entry: &LedgerEntry,
        end_event: Option<&TelemetryEvent>,
        profile: &SwitchProfile,
    ) -> Self {
        let Some(event) = end_event else {
            return Self::Idle;
        };
        if entry.end_event_id.as_deref() != Some(event.event_id.as_str())
            || profile.method != CalculationMethod::CumulativeMeter
        {
            return Self::Idle;
        }
        match &event.payload {
            Payload::PowerReading {
                energy_wh: Some(value),
                ..
            } => Self::Active(OpenInterval::at_reading(EventRef::of(event), *value, profile.power_w)),
            _ => Self::Idle,
        }
    }

    /// Applies one event. Returns the intervals it closed, in order.
    pub fn apply(&mut self, event: &TelemetryEvent, profile: &SwitchProfile) -> Vec<ClosedInterval> {
        let at = EventRef::of(event);
        let (next, closed) = match (std::mem::take(self), &event.payload) {
            (Self::Idle, Payload::SwitchOn { meter_wh }) => {
                (Self::Active(OpenInterval::open(at, *meter_wh, profile)), Vec::new())
            }
            // Readings, heartbeats and repeated offs while off carry no energy.
            (Self::Idle, _) => (Self::Idle, Vec::new()),
            // Repeated on: the interval already started.
            (Self::Active(open), Payload::SwitchOn { .. }) => (Self::Active(open), Vec::new()),
            (Self::Active(open), Payload::SwitchOff { meter_wh }) => {
                (Self::Idle, open.close_on_off(at, *meter_wh))
            }
            (Self::Active(mut open), Payload::PowerReading { power_w, energy_wh }) => {
                let closed = open.observe(at, *power_w, *energy_wh);
                (Self::Active(open), closed)
            }
            (Self::Active(open), Payload::Heartbeat) => (Self::Active(open), Vec::new()),
        };
        *self = next;
        closed
    }

    /// Closes an open interval at `offline_at`. An interval that opened at or
    /// after `offline_at` is left untouched.
    pub fn force_close(&mut self, offline_at: OffsetDateTime) -> Option<ClosedInterval> {
        let open = match self {
            Self::Active(open) if offline_at > open.start.timestamp => open,
            _ => return None,
        };
        let closed = open.close_offline(offline_at);
        *self = Self::Idle;
        Some(closed)
    }
}
