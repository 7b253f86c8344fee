use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Same-day running totals of energy moved through the battery (Wh).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyAccumulator {
    /// Energy charged into the battery today.
    pub energy_in_wh: f64,
    /// Energy discharged from the battery today.
    pub energy_out_wh: f64,
    current_day: Option<NaiveDate>,
}

impl EnergyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_day(&self) -> Option<NaiveDate> {
        self.current_day
    }

    /// Resets the totals when `today` differs from the last observed day.
    ///
    /// The first call only records the day. Returns `true` if a reset happened.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        match self.current_day {
            None => {
                self.current_day = Some(today);
                false
            }
            Some(day) if day != today => {
                self.energy_in_wh = 0.0;
                self.energy_out_wh = 0.0;
                self.current_day = Some(today);
                true
            }
            Some(_) => false,
        }
    }

    /// Books one cycle at `set_point_w`. Discharge counts out, charge counts in.
    pub fn accumulate(&mut self, set_point_w: f64, cycle_seconds: f64) {
        let wh = cycle_seconds * set_point_w.abs() / 3600.0;
        if set_point_w > 0.0 {
            self.energy_out_wh += wh;
        } else if set_point_w < 0.0 {
            self.energy_in_wh += wh;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, d).unwrap()
    }

    #[test]
    fn test_accumulate_direction() {
        let mut acc = EnergyAccumulator::new();
        acc.accumulate(200.0, 30.0);
        acc.accumulate(-120.0, 30.0);
        acc.accumulate(0.0, 30.0);

        assert!((acc.energy_out_wh - 30.0 * 200.0 / 3600.0).abs() < 1e-9);
        assert!((acc.energy_in_wh - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_first_day_never_resets() {
        let mut acc = EnergyAccumulator::new();
        acc.energy_in_wh = 5.0;
        assert!(!acc.roll_over(day(1)));
        assert_eq!(acc.energy_in_wh, 5.0);
        assert_eq!(acc.current_day(), Some(day(1)));
    }

    #[test]
    fn test_resets_once_per_day_change() {
        let mut acc = EnergyAccumulator::new();
        acc.roll_over(day(1));
        acc.accumulate(100.0, 3600.0);
        assert!(!acc.roll_over(day(1)));
        assert_eq!(acc.energy_out_wh, 100.0);

        assert!(acc.roll_over(day(2)));
        assert_eq!(acc.energy_out_wh, 0.0);
        acc.accumulate(-50.0, 3600.0);
        assert!(!acc.roll_over(day(2)));
        assert_eq!(acc.energy_in_wh, 50.0);
    }
}
