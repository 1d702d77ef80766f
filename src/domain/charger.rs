use async_trait::async_trait;

use super::error::DeviceResult;
use super::meter::{BatterySoc, Meter};
use super::types::ChargeStatus;

/// Base charger contract. Every driver reports pilot status and its
/// enabled state, and accepts enable/disable plus an integer current limit.
///
/// Optional capabilities are discovered through the `as_*` accessors which
/// default to `None`; a driver opts in by returning itself. Callers compose
/// whatever the concrete device offers instead of downcasting.
#[async_trait]
pub trait Charger: Send + Sync {
    async fn status(&self) -> DeviceResult<ChargeStatus>;
    async fn enabled(&self) -> DeviceResult<bool>;
    async fn enable(&self, enable: bool) -> DeviceResult<()>;
    async fn max_current(&self, amps: i64) -> DeviceResult<()>;

    /// Millisecond-precision current limit.
    fn as_current_millis(&self) -> Option<&dyn CurrentMillis> {
        None
    }

    /// 1p/3p phase switching.
    fn as_phase_switcher(&self) -> Option<&dyn PhaseSwitcher> {
        None
    }

    /// Integrated charge meter.
    fn as_meter(&self) -> Option<&dyn Meter> {
        None
    }

    /// Session energy counter.
    fn as_rater(&self) -> Option<&dyn ChargeRater> {
        None
    }

    /// Session duration counter.
    fn as_timer(&self) -> Option<&dyn ChargeTimer> {
        None
    }

    /// Vehicle identification (RFID tag, VIN).
    fn as_identifier(&self) -> Option<&dyn Identifier> {
        None
    }

    /// Vehicle battery SoC passed through by the charger.
    fn as_battery(&self) -> Option<&dyn BatterySoc> {
        None
    }

    /// Diagnostic state dump.
    fn as_diagnosis(&self) -> Option<&dyn Diagnosis> {
        None
    }
}

/// Fractional current limits for chargers that support them.
#[async_trait]
pub trait CurrentMillis: Send + Sync {
    async fn max_current_millis(&self, amps: f64) -> DeviceResult<()>;
}

/// Switch between single- and three-phase charging.
#[async_trait]
pub trait PhaseSwitcher: Send + Sync {
    /// `phases` must be 1 or 3.
    async fn phases_1p3p(&self, phases: u8) -> DeviceResult<()>;
}

/// Energy charged in the current session.
#[async_trait]
pub trait ChargeRater: Send + Sync {
    /// Charged energy in kWh since session start.
    async fn charged_energy(&self) -> DeviceResult<f64>;
}

/// Time spent charging in the current session.
#[async_trait]
pub trait ChargeTimer: Send + Sync {
    async fn charging_time(&self) -> DeviceResult<std::time::Duration>;
}

/// Identification of the connected vehicle.
#[async_trait]
pub trait Identifier: Send + Sync {
    /// Returns the identifier of the connected vehicle, empty when none.
    async fn identify(&self) -> DeviceResult<String>;
}

/// Diagnostic dump of driver-internal state, for per-device probing.
#[async_trait]
pub trait Diagnosis: Send + Sync {
    /// Human-readable key/value dump.
    async fn diagnose(&self) -> DeviceResult<Vec<(String, String)>>;
}
