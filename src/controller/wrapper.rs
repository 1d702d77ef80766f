use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::domain::{ChargeRater, ChargeTimer, DeviceResult, Meter};

/// Synthetic charge meter for chargers without one. Fed from the
/// loadpoint's commanded-current events; power is zero whenever the
/// charger is not actually charging.
#[derive(Default)]
pub struct SyntheticChargeMeter {
    power_w: Mutex<f64>,
}

impl SyntheticChargeMeter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_power(&self, power_w: f64) {
        *self.power_w.lock() = power_w;
    }
}

#[async_trait]
impl Meter for SyntheticChargeMeter {
    async fn current_power(&self) -> DeviceResult<f64> {
        Ok(*self.power_w.lock())
    }
}

#[derive(Debug, Default)]
struct RaterState {
    charged_kwh: f64,
    last_power_w: f64,
    last_update: Option<DateTime<Utc>>,
    charging: bool,
}

/// Synthetic session-energy counter: integrates charge power over time.
pub struct SyntheticChargeRater {
    clock: Arc<dyn Clock>,
    state: Mutex<RaterState>,
}

impl SyntheticChargeRater {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            state: Mutex::new(RaterState::default()),
        })
    }

    /// Begin a session. `continued` keeps the accumulated energy, used when
    /// charging resumes within the same plug-in.
    pub fn start_charge(&self, continued: bool) {
        let mut state = self.state.lock();
        if !continued {
            state.charged_kwh = 0.0;
        }
        state.charging = true;
        state.last_update = Some(self.clock.now());
    }

    pub fn stop_charge(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        Self::integrate(&mut state, now);
        state.charging = false;
    }

    pub fn set_charge_power(&self, power_w: f64) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        Self::integrate(&mut state, now);
        state.last_power_w = power_w;
    }

    fn integrate(state: &mut RaterState, now: DateTime<Utc>) {
        if let Some(last) = state.last_update {
            if state.charging {
                let hours = (now - last).num_milliseconds() as f64 / 3_600_000.0;
                if hours > 0.0 {
                    state.charged_kwh += state.last_power_w / 1000.0 * hours;
                }
            }
        }
        state.last_update = Some(now);
    }
}

#[async_trait]
impl ChargeRater for SyntheticChargeRater {
    async fn charged_energy(&self) -> DeviceResult<f64> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        Self::integrate(&mut state, now);
        Ok(state.charged_kwh)
    }
}

#[derive(Debug, Default)]
struct TimerState {
    accumulated: Duration,
    started: Option<DateTime<Utc>>,
}

/// Synthetic session-duration counter.
pub struct SyntheticChargeTimer {
    clock: Arc<dyn Clock>,
    state: Mutex<TimerState>,
}

impl SyntheticChargeTimer {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            state: Mutex::new(TimerState::default()),
        })
    }

    pub fn start_charge(&self, continued: bool) {
        let mut state = self.state.lock();
        if !continued {
            state.accumulated = Duration::ZERO;
        }
        state.started = Some(self.clock.now());
    }

    pub fn stop_charge(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if let Some(started) = state.started.take() {
            state.accumulated += (now - started).to_std().unwrap_or_default();
        }
    }
}

#[async_trait]
impl ChargeTimer for SyntheticChargeTimer {
    async fn charging_time(&self) -> DeviceResult<Duration> {
        let now = self.clock.now();
        let state = self.state.lock();
        let mut total = state.accumulated;
        if let Some(started) = state.started {
            total += (now - started).to_std().unwrap_or_default();
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    #[tokio::test]
    async fn meter_reports_last_power() {
        let meter = SyntheticChargeMeter::new();
        meter.set_power(4140.0);
        assert_eq!(meter.current_power().await.unwrap(), 4140.0);
    }

    #[tokio::test]
    async fn rater_integrates_power_over_time() {
        let clock = Arc::new(MockClock::new());
        let rater = SyntheticChargeRater::new(clock.clone());

        rater.start_charge(false);
        rater.set_charge_power(4000.0);
        clock.advance(chrono::Duration::minutes(30));

        // 4 kW for half an hour
        let energy = rater.charged_energy().await.unwrap();
        assert!((energy - 2.0).abs() < 1e-9);

        // stop freezes the counter
        rater.stop_charge();
        clock.advance(chrono::Duration::hours(1));
        let energy = rater.charged_energy().await.unwrap();
        assert!((energy - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rater_continued_start_keeps_energy() {
        let clock = Arc::new(MockClock::new());
        let rater = SyntheticChargeRater::new(clock.clone());

        rater.start_charge(false);
        rater.set_charge_power(1000.0);
        clock.advance(chrono::Duration::hours(1));
        rater.stop_charge();

        rater.start_charge(true);
        clock.advance(chrono::Duration::hours(1));
        let energy = rater.charged_energy().await.unwrap();
        assert!((energy - 2.0).abs() < 1e-9);

        // a fresh session resets
        rater.start_charge(false);
        let energy = rater.charged_energy().await.unwrap();
        assert!(energy.abs() < 1e-9);
    }

    #[tokio::test]
    async fn timer_accumulates_only_while_charging() {
        let clock = Arc::new(MockClock::new());
        let timer = SyntheticChargeTimer::new(clock.clone());

        timer.start_charge(false);
        clock.advance(chrono::Duration::minutes(10));
        timer.stop_charge();
        clock.advance(chrono::Duration::minutes(10));

        assert_eq!(
            timer.charging_time().await.unwrap(),
            Duration::from_secs(600)
        );

        timer.start_charge(true);
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(
            timer.charging_time().await.unwrap(),
            Duration::from_secs(900)
        );
    }
}
