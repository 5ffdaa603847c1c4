// =============================================================================
// Trigger state machine — Watching / Armed / Cooldown with hysteresis
// =============================================================================
//
//   Watching --(crosses into trigger zone)--------------------> Armed
//   Armed    --(penetration >= hysteresis band)--> Fire ------> Cooldown
//   Armed    --(crosses back out of the zone)-----------------> Watching
//   Cooldown --(cooldownMinutes elapsed)----------------------> Watching
//
// Near-miss: while Watching, covering >= nearMissFraction of the distance to
// the threshold without crossing increments a counter and emits a context
// note, once per approach episode. It never fires.
//
// One machine per (strategy, trigger); all transitions happen on the owning
// supervisor task, so this type needs no interior locking.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::triggers::spec::TriggerSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerState {
    Watching,
    Armed,
    Cooldown,
}

/// Outcome of feeding one sample set to the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    None,
    Armed,
    Disarmed,
    NearMiss { value: f64 },
    Fired { value: f64 },
    WatchRestored,
}

#[derive(Debug)]
pub struct TriggerMachine {
    pub spec: TriggerSpec,
    state: TriggerState,
    last_crossed_at: Option<DateTime<Utc>>,
    last_fired_at: Option<DateTime<Utc>>,
    near_miss_count: u32,
    /// True while the current approach episode has already been counted.
    in_near_zone: bool,
}

impl TriggerMachine {
    pub fn new(spec: TriggerSpec) -> Self {
        Self {
            spec,
            state: TriggerState::Watching,
            last_crossed_at: None,
            last_fired_at: None,
            near_miss_count: 0,
            in_near_zone: false,
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn near_miss_count(&self) -> u32 {
        self.near_miss_count
    }

    pub fn last_fired_at(&self) -> Option<DateTime<Utc>> {
        self.last_fired_at
    }

    /// Feed one sample per condition (same order as `spec.conditions`).
    /// The composite zone is the conjunction of all condition zones;
    /// hysteresis and near-miss apply to the primary condition's value.
    pub fn on_sample(&mut self, values: &[f64], now: DateTime<Utc>) -> MachineEvent {
        debug_assert_eq!(values.len(), self.spec.conditions.len());
        if values.len() != self.spec.conditions.len() {
            return MachineEvent::None;
        }

        let primary_value = values[0];
        let in_zone = self
            .spec
            .conditions
            .iter()
            .zip(values)
            .all(|(cond, &v)| cond.in_zone(v));

        match self.state {
            TriggerState::Watching => {
                if in_zone {
                    self.state = TriggerState::Armed;
                    self.last_crossed_at = Some(now);
                    self.in_near_zone = false;
                    return MachineEvent::Armed;
                }
                self.check_near_miss(primary_value)
            }

            TriggerState::Armed => {
                if !in_zone {
                    self.state = TriggerState::Watching;
                    return MachineEvent::Disarmed;
                }
                let penetration = self.spec.primary().penetration(primary_value);
                if penetration >= self.spec.hysteresis {
                    self.state = TriggerState::Cooldown;
                    self.last_fired_at = Some(now);
                    return MachineEvent::Fired {
                        value: primary_value,
                    };
                }
                MachineEvent::None
            }

            TriggerState::Cooldown => {
                let expired = self
                    .last_fired_at
                    .map(|t| now - t >= Duration::minutes(self.spec.cooldown_minutes as i64))
                    .unwrap_or(true);
                if expired {
                    self.state = TriggerState::Watching;
                    self.in_near_zone = false;
                    return MachineEvent::WatchRestored;
                }
                MachineEvent::None
            }
        }
    }

    fn check_near_miss(&mut self, value: f64) -> MachineEvent {
        let spec = &self.spec;
        let primary = spec.primary();
        let distance = primary.approach_distance(value);

        // Covered >= nearMissFraction of the way: remaining distance is
        // within (1 - fraction) of the threshold magnitude.
        let band = (1.0 - spec.near_miss_fraction) * primary.threshold.abs();
        let near = distance > 0.0 && distance <= band;

        if near && !self.in_near_zone {
            self.in_near_zone = true;
            self.near_miss_count += 1;
            return MachineEvent::NearMiss { value };
        }
        if !near {
            self.in_near_zone = false;
        }
        MachineEvent::None
    }
}
