use async_trait::async_trait;

use super::error::DeviceResult;

/// Meter contract. Power is signed: positive = import/consumption,
/// negative = export/production.
#[async_trait]
pub trait Meter: Send + Sync {
    /// Momentary power in W.
    async fn current_power(&self) -> DeviceResult<f64>;

    /// Lifetime energy counter.
    fn as_energy(&self) -> Option<&dyn MeterEnergy> {
        None
    }

    /// Per-phase currents.
    fn as_phase_currents(&self) -> Option<&dyn PhaseCurrents> {
        None
    }

    /// State of charge, for battery meters.
    fn as_battery(&self) -> Option<&dyn BatterySoc> {
        None
    }
}

#[async_trait]
pub trait MeterEnergy: Send + Sync {
    /// Total energy in kWh.
    async fn total_energy(&self) -> DeviceResult<f64>;
}

#[async_trait]
pub trait PhaseCurrents: Send + Sync {
    /// Currents of phases L1, L2, L3 in A.
    async fn currents(&self) -> DeviceResult<(f64, f64, f64)>;
}

#[async_trait]
pub trait BatterySoc: Send + Sync {
    /// State of charge in percent (0..100).
    async fn soc(&self) -> DeviceResult<f64>;
}
