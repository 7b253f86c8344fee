//! # Dispatch step
//!
//! One control cycle turns the averaged household power and the latest
//! battery telemetry into the next battery set-point. The stages run in a
//! fixed order because later stages can undo or re-trigger earlier ones:
//!
//! 1. day rollover of the energy totals
//! 2. telemetry cross-check (the battery's reported power wins)
//! 3. tentative set-point `trunc(current + sample)`
//! 4. range clamp into `[max_charge, max_discharge]`
//! 5. hysteresis on a falling trend
//! 6. high-consumption override
//! 7. state-of-charge guards
//! 8. anti-repeat nudge
//! 9. emit or skip
//!
//! Sign convention: positive = discharge into the household, negative = charge.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, info, warn};

use super::energy::EnergyAccumulator;
use crate::config::DispatchConfig;
use crate::domain::BatteryTelemetry;

/// Offset applied when a new set-point would equal the last one. Some
/// consumers drop unchanged values.
pub const ANTI_REPEAT_DELTA_W: f64 = 0.1;

/// Why a cycle produced no command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum SkipReason {
    /// The shaped set-point ended up at zero.
    ZeroDemand,
    /// Household draw above the configured threshold.
    HighConsumption,
    /// Would charge a full battery.
    BatteryFull,
    /// Would discharge an empty battery.
    BatteryEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleOutcome {
    Emit { set_point_w: f64 },
    Skip { reason: SkipReason },
}

impl CycleOutcome {
    pub fn set_point_w(&self) -> Option<f64> {
        match self {
            CycleOutcome::Emit { set_point_w } => Some(*set_point_w),
            CycleOutcome::Skip { .. } => None,
        }
    }
}

/// Controller memory carried from one cycle to the next.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchState {
    current_set_point_w: f64,
    previous_set_point_w: f64,
    energy: EnergyAccumulator,
}

impl DispatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_set_points(current_set_point_w: f64, previous_set_point_w: f64) -> Self {
        Self {
            current_set_point_w,
            previous_set_point_w,
            energy: EnergyAccumulator::new(),
        }
    }

    pub fn current_set_point_w(&self) -> f64 {
        self.current_set_point_w
    }

    pub fn previous_set_point_w(&self) -> f64 {
        self.previous_set_point_w
    }

    pub fn energy(&self) -> &EnergyAccumulator {
        &self.energy
    }

    /// Takes over the battery's reported power as the starting point so the
    /// first cycle does not jump from an assumed zero. Returns whether it did.
    pub fn adopt(&mut self, telemetry: &BatteryTelemetry) -> bool {
        match telemetry.grid_power_w {
            Some(power) => {
                self.current_set_point_w = power;
                self.previous_set_point_w = power;
                true
            }
            None => false,
        }
    }

    /// Runs one dispatch cycle. `sample_w` is the averaged household power
    /// (import positive), `today` the local calendar day.
    pub fn step(
        &mut self,
        cfg: &DispatchConfig,
        sample_w: f64,
        telemetry: &BatteryTelemetry,
        today: NaiveDate,
    ) -> CycleOutcome {
        if self.energy.roll_over(today) {
            info!(%today, "new day, energy totals reset");
        }

        if let Some(reported) = telemetry.grid_power_w {
            if reported != self.current_set_point_w {
                debug!(
                    reported_w = reported,
                    remembered_w = self.current_set_point_w,
                    "battery reports a different power, adopting it"
                );
                self.current_set_point_w = reported;
                self.previous_set_point_w = reported;
            }
        }

        let mut candidate = clamp_candidate(self.current_set_point_w, sample_w, cfg);

        if candidate < self.previous_set_point_w {
            candidate -= cfg.hysteresis_buffer_w;
        }

        let mut forced = None;
        if sample_w > cfg.high_consumption_threshold_w {
            warn!(
                sample_w,
                threshold_w = cfg.high_consumption_threshold_w,
                "high consumption, leaving battery alone"
            );
            candidate = 0.0;
            forced = Some(SkipReason::HighConsumption);
        }

        if let Some(soc) = telemetry.soc_percent {
            if soc >= cfg.soc_full_percent && candidate < 0.0 {
                warn!(soc_percent = soc, "battery is full");
                candidate = 0.0;
                forced = Some(SkipReason::BatteryFull);
            }
            if soc <= cfg.soc_empty_percent && candidate > 0.0 {
                warn!(soc_percent = soc, "battery is empty");
                candidate = 0.0;
                forced = Some(SkipReason::BatteryEmpty);
            }
        }

        if candidate == self.current_set_point_w && candidate != 0.0 {
            candidate -= ANTI_REPEAT_DELTA_W;
        }

        if candidate == 0.0 {
            self.previous_set_point_w = 0.0;
            self.current_set_point_w = 0.0;
            return CycleOutcome::Skip {
                reason: forced.unwrap_or(SkipReason::ZeroDemand),
            };
        }

        self.previous_set_point_w = self.current_set_point_w;
        self.current_set_point_w = candidate;
        self.energy
            .accumulate(candidate, cfg.update_cycle_seconds as f64);
        CycleOutcome::Emit {
            set_point_w: candidate,
        }
    }
}

/// Stages 3 and 4: tentative set-point, truncated to whole watts and clamped.
pub fn clamp_candidate(current_set_point_w: f64, sample_w: f64, cfg: &DispatchConfig) -> f64 {
    (current_set_point_w + sample_w)
        .trunc()
        .max(cfg.max_charge_w)
        .min(cfg.max_discharge_w)
}
