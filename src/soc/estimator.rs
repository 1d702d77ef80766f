use std::time::Duration;

use tracing::debug;

use crate::domain::DeviceResult;

/// Estimates vehicle SoC between real reads by extrapolating from charged
/// energy. Driver reads are sparse (TTL-cached, rate-limited APIs); while
/// the reported value stands still the estimator advances it by the energy
/// delivered since the last anchor, and re-learns the per-percent energy
/// step whenever it observes a real SoC move.
#[derive(Debug)]
pub struct Estimator {
    capacity_wh: f64,
    virtual_capacity_wh: f64,
    energy_per_soc_step: f64,
    estimate: bool,

    soc: f64,
    anchor_soc: f64,
    anchor_energy_wh: f64,
}

impl Estimator {
    pub fn new(capacity_wh: f64, estimate: bool) -> Self {
        let mut e = Self {
            capacity_wh,
            virtual_capacity_wh: capacity_wh,
            energy_per_soc_step: capacity_wh / 100.0,
            estimate,
            soc: 0.0,
            anchor_soc: 0.0,
            anchor_energy_wh: 0.0,
        };
        e.reset();
        e
    }

    /// Drop anchors, e.g. on vehicle change.
    pub fn reset(&mut self) {
        self.virtual_capacity_wh = self.capacity_wh;
        self.energy_per_soc_step = self.capacity_wh / 100.0;
        self.soc = 0.0;
        self.anchor_soc = 0.0;
        self.anchor_energy_wh = 0.0;
    }

    /// Learned full capacity in Wh.
    pub fn virtual_capacity_wh(&self) -> f64 {
        self.virtual_capacity_wh
    }

    /// Fold a fresh driver reading (or its error) into the estimate.
    ///
    /// `reading` is the result of the vehicle or charger SoC read;
    /// `charged_energy_wh` the session energy at the time of the call.
    /// Errors pass through untouched so the caller can distinguish
    /// must-retry from hard failures.
    pub fn update(&mut self, reading: DeviceResult<f64>, charged_energy_wh: f64) -> DeviceResult<f64> {
        let vehicle_soc = reading?;
        let charged = charged_energy_wh.max(0.0);

        if !self.estimate {
            self.soc = vehicle_soc;
            self.anchor_soc = vehicle_soc;
            self.anchor_energy_wh = charged;
            return Ok(self.soc);
        }

        let soc_delta = vehicle_soc - self.anchor_soc;
        let energy_delta = charged - self.anchor_energy_wh;

        // a real SoC move or an energy reset re-anchors the extrapolation
        if soc_delta.abs() > f64::EPSILON || energy_delta < 0.0 {
            if soc_delta >= 1.0 && energy_delta > 0.0 && self.anchor_soc > 0.0 {
                self.energy_per_soc_step = energy_delta / soc_delta;
                self.virtual_capacity_wh = self.energy_per_soc_step * 100.0;
                debug!(
                    virtual_capacity_wh = self.virtual_capacity_wh,
                    "recalibrated virtual capacity"
                );
            }
            self.anchor_soc = vehicle_soc;
            self.anchor_energy_wh = charged;
        }

        self.soc =
            (self.anchor_soc + (charged - self.anchor_energy_wh) / self.energy_per_soc_step).min(100.0);
        Ok(self.soc)
    }

    /// Energy still needed to reach `target_soc`, in Wh.
    pub fn remaining_charge_energy(&self, target_soc: u32) -> f64 {
        ((target_soc as f64 - self.soc) / 100.0 * self.virtual_capacity_wh).max(0.0)
    }

    /// Time to reach `target_soc` at `charge_power_w`. `None` when the
    /// power is not positive (duration unbounded).
    pub fn remaining_charge_duration(&self, charge_power_w: f64, target_soc: u32) -> Option<Duration> {
        if charge_power_w <= 0.0 {
            return None;
        }

        let energy_wh = self.remaining_charge_energy(target_soc);
        Some(Duration::from_secs_f64(energy_wh / charge_power_w * 3600.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeviceError;
    use proptest::prelude::*;

    #[test]
    fn plain_mode_mirrors_vehicle_reading() {
        let mut est = Estimator::new(60_000.0, false);
        assert_eq!(est.update(Ok(42.0), 1000.0).unwrap(), 42.0);
        assert_eq!(est.update(Ok(42.0), 3000.0).unwrap(), 42.0);
    }

    #[test]
    fn estimates_between_stale_readings() {
        let mut est = Estimator::new(10_000.0, true);

        // anchor at 20% with no energy delivered yet
        assert_eq!(est.update(Ok(20.0), 0.0).unwrap(), 20.0);

        // vehicle API still reports 20% after 1 kWh: 1 kWh / 100 Wh-per-% = +10%
        let soc = est.update(Ok(20.0), 1000.0).unwrap();
        assert!((soc - 30.0).abs() < 1e-9);

        // estimate never exceeds 100
        let soc = est.update(Ok(20.0), 50_000.0).unwrap();
        assert_eq!(soc, 100.0);
    }

    #[test]
    fn recalibrates_on_observed_soc_move() {
        let mut est = Estimator::new(10_000.0, true);

        est.update(Ok(50.0), 0.0).unwrap();
        // 10 percentage points took 1.2 kWh -> 120 Wh per step, 12 kWh capacity
        est.update(Ok(60.0), 1200.0).unwrap();
        assert!((est.virtual_capacity_wh() - 12_000.0).abs() < 1e-6);

        // subsequent estimation uses the learned step
        let soc = est.update(Ok(60.0), 1200.0 + 600.0).unwrap();
        assert!((soc - 65.0).abs() < 1e-9);
    }

    #[test]
    fn energy_reset_reanchors_without_recalibration() {
        let mut est = Estimator::new(10_000.0, true);

        est.update(Ok(40.0), 5000.0).unwrap();
        // charged energy drops to zero on reconnect
        let soc = est.update(Ok(40.0), 0.0).unwrap();
        assert_eq!(soc, 40.0);
        assert_eq!(est.virtual_capacity_wh(), 10_000.0);
    }

    #[test]
    fn reset_drops_learned_state() {
        let mut est = Estimator::new(10_000.0, true);
        est.update(Ok(50.0), 0.0).unwrap();
        est.update(Ok(60.0), 1200.0).unwrap();

        est.reset();
        assert_eq!(est.virtual_capacity_wh(), 10_000.0);
        assert_eq!(est.remaining_charge_energy(100), 10_000.0);
    }

    #[test]
    fn errors_pass_through() {
        let mut est = Estimator::new(10_000.0, true);
        let res = est.update(Err(DeviceError::MustRetry), 0.0);
        assert!(matches!(res, Err(DeviceError::MustRetry)));
    }

    #[test]
    fn remaining_duration() {
        let mut est = Estimator::new(10_000.0, true);
        est.update(Ok(50.0), 0.0).unwrap();

        // 5 kWh remaining at 5 kW -> one hour
        let d = est.remaining_charge_duration(5000.0, 100).unwrap();
        assert_eq!(d, Duration::from_secs(3600));

        assert!(est.remaining_charge_duration(0.0, 100).is_none());
        assert!(est.remaining_charge_duration(-100.0, 100).is_none());
    }

    proptest! {
        // remaining energy scaled back by virtual capacity equals the soc gap
        #[test]
        fn remaining_energy_roundtrip(soc in 0.0f64..100.0, target in 0u32..=100) {
            let mut est = Estimator::new(20_000.0, true);
            est.update(Ok(soc), 0.0).unwrap();

            let remaining = est.remaining_charge_energy(target);
            let expected = ((target as f64 - soc) * est.virtual_capacity_wh() / 100.0).max(0.0);
            prop_assert!((remaining - expected).abs() < 1e-6);
        }

        #[test]
        fn estimate_is_monotonic_in_energy(e1 in 0.0f64..5000.0, e2 in 0.0f64..5000.0) {
            let mut est = Estimator::new(10_000.0, true);
            est.update(Ok(30.0), 0.0).unwrap();

            let (lo, hi) = if e1 <= e2 { (e1, e2) } else { (e2, e1) };
            let s_lo = est.update(Ok(30.0), lo).unwrap();
            let s_hi = est.update(Ok(30.0), hi).unwrap();
            prop_assert!(s_hi >= s_lo - 1e-9);
        }
    }
}
