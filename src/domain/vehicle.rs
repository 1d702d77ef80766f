use async_trait::async_trait;

use super::error::DeviceResult;
use super::types::ChargeStatus;

/// Vehicle contract. Reading the state of charge is the one required
/// capability; everything else is optional and discovered via `as_*`.
#[async_trait]
pub trait Vehicle: Send + Sync {
    /// Human-readable vehicle name.
    fn title(&self) -> &str;

    /// Battery capacity in Wh.
    fn capacity_wh(&self) -> f64;

    /// State of charge in percent (0..100).
    async fn soc(&self) -> DeviceResult<f64>;

    fn as_range(&self) -> Option<&dyn VehicleRange> {
        None
    }

    fn as_odometer(&self) -> Option<&dyn VehicleOdometer> {
        None
    }

    fn as_climater(&self) -> Option<&dyn VehicleClimater> {
        None
    }

    /// Identifier for charger-side matching (VIN, tag). May contain `*`
    /// placeholders.
    fn as_identify(&self) -> Option<&dyn VehicleIdentify> {
        None
    }

    /// Charge state as seen from the vehicle side, used for detection.
    fn as_charge_state(&self) -> Option<&dyn VehicleChargeState> {
        None
    }

    fn as_start_charge(&self) -> Option<&dyn VehicleStartCharge> {
        None
    }

    fn as_stop_charge(&self) -> Option<&dyn VehicleStopCharge> {
        None
    }
}

#[async_trait]
pub trait VehicleRange: Send + Sync {
    /// Remaining range in km.
    async fn range(&self) -> DeviceResult<i64>;
}

#[async_trait]
pub trait VehicleOdometer: Send + Sync {
    /// Odometer reading in km.
    async fn odometer(&self) -> DeviceResult<f64>;
}

/// Cabin climatisation state.
#[derive(Debug, Clone, Copy)]
pub struct ClimaterState {
    pub active: bool,
    pub outside_temp_c: f64,
    pub target_temp_c: f64,
}

#[async_trait]
pub trait VehicleClimater: Send + Sync {
    async fn climater(&self) -> DeviceResult<ClimaterState>;
}

#[async_trait]
pub trait VehicleIdentify: Send + Sync {
    async fn identify(&self) -> DeviceResult<String>;
}

#[async_trait]
pub trait VehicleChargeState: Send + Sync {
    async fn status(&self) -> DeviceResult<ChargeStatus>;
}

#[async_trait]
pub trait VehicleStartCharge: Send + Sync {
    /// Wake the vehicle / request charge start.
    async fn start_charge(&self) -> DeviceResult<()>;
}

#[async_trait]
pub trait VehicleStopCharge: Send + Sync {
    /// Put the vehicle to sleep / request charge stop.
    async fn stop_charge(&self) -> DeviceResult<()>;
}
