use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::domain::ChargeStatus;
use crate::soc::Estimator;

/// Permitted deviation between projected finish and the deadline before
/// the current is trimmed, in minutes.
const DEVIATION_MINUTES: i64 = 30;

/// Accessors the timer needs from its loadpoint, captured per call to keep
/// the timer free of back-references.
pub struct TimerContext<'a> {
    pub clock: &'a dyn Clock,
    pub status: ChargeStatus,
    pub min_current: f64,
    pub max_current: f64,
    /// Maximum charge power at the present phase configuration, in W.
    pub max_power: f64,
}

/// Target-time charging controller: decides whether charging must start
/// now to reach the target SoC by the deadline, and trims the current to
/// land on the deadline without overshoot.
#[derive(Debug)]
pub struct Timer {
    target_soc: u32,
    target_time: Option<DateTime<Utc>>,

    current: f64,
    finish_at: Option<DateTime<Utc>>,
    active: bool,
    warned_unsupported: bool,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            target_soc: 0,
            target_time: None,
            current: 0.0,
            finish_at: None,
            active: false,
            warned_unsupported: false,
        }
    }

    /// Arm a target charge request.
    pub fn set(&mut self, finish_at: DateTime<Utc>, target_soc: u32) {
        self.target_time = Some(finish_at);
        self.target_soc = target_soc;
    }

    /// Drop the target charging request, e.g. once the target is reached.
    pub fn reset(&mut self, max_current: f64) {
        self.current = max_current;
        self.target_time = None;
        self.target_soc = 0;
        self.active = false;
    }

    pub fn target_soc(&self) -> u32 {
        self.target_soc
    }

    pub fn target_time(&self) -> Option<DateTime<Utc>> {
        self.target_time
    }

    /// Projected end of charge from the last evaluation.
    pub fn finish_at(&self) -> Option<DateTime<Utc>> {
        self.finish_at
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// True while a deadline is armed and still ahead of `now`.
    pub fn is_set(&self, now: DateTime<Utc>) -> bool {
        self.target_time.is_some_and(|t| t > now)
    }

    /// Re-evaluate the projected finish time and decide whether target
    /// charging must steer the loadpoint this cycle.
    pub fn demand_active(&mut self, ctx: &TimerContext<'_>, estimator: Option<&Estimator>) -> bool {
        let Some(target_time) = self.target_time else {
            self.active = false;
            return false;
        };
        if self.target_soc == 0 {
            self.active = false;
            return false;
        }

        let Some(estimator) = estimator else {
            if !self.warned_unsupported {
                warn!("target charging not possible: vehicle soc unknown");
                self.warned_unsupported = true;
            }
            return false;
        };

        // projected power: full power until steering, then scaled by the
        // currently commanded share
        let mut power = ctx.max_power;
        if self.active && ctx.max_current > 0.0 {
            power *= self.current / ctx.max_current;
        }

        let now = ctx.clock.now();
        self.finish_at = estimator
            .remaining_charge_duration(power, self.target_soc)
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);

        if self.active {
            // stay active until the deadline has passed and charging stopped
            if now > target_time && ctx.status != ChargeStatus::Charging {
                debug!("target charging: deactivating");
                self.active = false;
            }
            return self.active;
        }

        // unknown finish time counts as "too late": start steering
        let projected_late = self.finish_at.map_or(true, |f| f > target_time);
        if projected_late {
            self.active = true;
            self.current = ctx.max_current;
            debug!(
                target = %target_time,
                projected = ?self.finish_at,
                "target charging active"
            );
        }

        self.active
    }

    /// Adjust the commanded current to land the projected finish inside
    /// the deadline window. Call only while `demand_active` returned true.
    pub fn handle(&mut self, ctx: &TimerContext<'_>) -> f64 {
        let Some(target_time) = self.target_time else {
            return self.current;
        };

        let deviation = chrono::Duration::minutes(DEVIATION_MINUTES);
        let mut action = "steady";
        match self.finish_at {
            Some(finish) if finish < target_time - deviation => {
                self.current -= 1.0;
                action = "slowdown";
            }
            Some(finish) if finish > target_time => {
                self.current += 1.0;
                action = "speedup";
            }
            None => {
                self.current += 1.0;
                action = "speedup";
            }
            _ => {}
        }

        self.current = self.current.clamp(ctx.min_current, ctx.max_current);
        debug!(action, current = self.current, "target charging");

        self.current
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
