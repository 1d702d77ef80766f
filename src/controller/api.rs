#![allow(dead_code)]
//! Lock-guarded public accessors of the loadpoint. External callers (UI,
//! HEMS adapters) mutate user intent here; changes publish once and
//! request an out-of-band site update.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::controller::loadpoint::{Loadpoint, MeterSource};
use crate::domain::{ChargeMode, DeviceError, DeviceResult, RemoteDemand};
use crate::settings::RuntimeSettings;

impl Loadpoint {
    /// Charge mode.
    pub fn mode(&self) -> ChargeMode {
        self.guarded.lock().mode
    }

    /// Set the charge mode; applies immediately.
    pub fn set_mode(&self, mode: ChargeMode) {
        let changed = {
            let mut guarded = self.guarded.lock();
            if guarded.mode == mode {
                false
            } else {
                guarded.mode = mode;
                // let the pv hysteresis act right away
                guarded.elapse_timers = true;
                true
            }
        };

        if changed {
            info!(loadpoint = %self.title, mode = %mode, "set charge mode");
            self.publish("mode", mode);
            self.request_update();
        }
    }

    /// Target state of charge in percent.
    pub fn target_soc(&self) -> u32 {
        self.guarded.lock().target_soc
    }

    /// Set the target soc; requires a vehicle.
    pub fn set_target_soc(&self, soc: u32) -> DeviceResult<()> {
        let changed = {
            let mut guarded = self.guarded.lock();
            if guarded.vehicle.is_none() {
                return Err(DeviceError::NotAvailable);
            }
            if guarded.target_soc == soc {
                false
            } else {
                guarded.target_soc = soc;
                true
            }
        };

        if changed {
            info!(loadpoint = %self.title, soc, "set target soc");
            self.publish("targetSoC", soc);
            self.request_update();
        }

        Ok(())
    }

    /// Minimum state of charge in percent.
    pub fn min_soc(&self) -> u32 {
        self.guarded.lock().min_soc
    }

    /// Set the minimum soc; requires a vehicle.
    pub fn set_min_soc(&self, soc: u32) -> DeviceResult<()> {
        let changed = {
            let mut guarded = self.guarded.lock();
            if guarded.vehicle.is_none() {
                return Err(DeviceError::NotAvailable);
            }
            if guarded.min_soc == soc {
                false
            } else {
                guarded.min_soc = soc;
                true
            }
        };

        if changed {
            info!(loadpoint = %self.title, soc, "set min soc");
            self.publish("minSoC", soc);
            self.request_update();
        }

        Ok(())
    }

    /// Configured phase count.
    pub fn phases(&self) -> u8 {
        self.guarded.lock().phases
    }

    /// Switch the configured phase count on a phase-capable charger.
    pub async fn set_phases(&self, phases: u8) -> DeviceResult<()> {
        let mut st = self.state.lock().await;
        self.scale_phases(&mut st, phases).await
    }

    pub fn min_current(&self) -> f64 {
        self.guarded.lock().min_current
    }

    pub fn set_min_current(&self, current: f64) {
        let changed = {
            let mut guarded = self.guarded.lock();
            if guarded.min_current == current {
                false
            } else {
                guarded.min_current = current;
                true
            }
        };

        if changed {
            self.publish("minCurrent", current);
        }
    }

    pub fn max_current(&self) -> f64 {
        self.guarded.lock().max_current
    }

    pub fn set_max_current(&self, current: f64) {
        let changed = {
            let mut guarded = self.guarded.lock();
            if guarded.max_current == current {
                false
            } else {
                guarded.max_current = current;
                true
            }
        };

        if changed {
            self.publish("maxCurrent", current);
        }
    }

    /// Minimum charge power for a single phase, in W.
    pub fn min_power(&self) -> f64 {
        self.voltage * self.min_current()
    }

    /// Maximum charge power at the configured phase count, in W.
    pub fn max_power(&self) -> f64 {
        let guarded = self.guarded.lock();
        self.voltage * guarded.max_current * guarded.phases as f64
    }

    /// Current charge power in W.
    pub fn charge_power(&self) -> f64 {
        self.guarded.lock().charge_power
    }

    /// Estimated remaining charge duration; `None` while unknown.
    pub fn remaining_duration(&self) -> Option<StdDuration> {
        self.guarded.lock().remaining_duration
    }

    /// Remaining charge energy in Wh.
    pub fn remaining_energy(&self) -> f64 {
        self.guarded.lock().remaining_energy_wh
    }

    /// Arm a target charge: reach `target_soc` by `finish_at`.
    pub fn set_target_charge(&self, finish_at: DateTime<Utc>, target_soc: u32) {
        info!(
            loadpoint = %self.title,
            soc = target_soc,
            finish = %finish_at,
            "set target charge"
        );

        {
            let mut guarded = self.guarded.lock();
            guarded.target_time = Some(finish_at);
            guarded.timer_soc = target_soc;
        }

        self.publish("targetTime", finish_at.to_rfc3339());
        self.publish("targetSoC", target_soc);

        if let Some(store) = &self.settings_store {
            let _ = store.set(
                self.id,
                RuntimeSettings {
                    target_soc: Some(target_soc),
                    finish_at: Some(finish_at),
                },
            );
        }

        self.request_update();
    }

    /// Apply an external demand override.
    pub fn remote_control(&self, source: &str, demand: RemoteDemand) {
        let changed = {
            let mut guarded = self.guarded.lock();
            if guarded.remote_demand == demand {
                false
            } else {
                guarded.remote_demand = demand;
                true
            }
        };

        if changed {
            info!(loadpoint = %self.title, source, demand = %demand, "remote demand");
            self.publish("remoteDisabled", demand);
            self.publish("remoteDisabledSource", source);
            self.request_update();
        }
    }

    /// True when a physical charge meter is attached, synthetic ones do
    /// not count.
    pub fn has_charge_meter(&self) -> bool {
        !matches!(self.meter, MeterSource::Synthetic(_))
    }
}
