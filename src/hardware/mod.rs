pub mod factory;
pub mod simulated;

pub use factory::{DeviceFactory, SetupError};
pub use simulated::{ScheduledTariff, SimulatedCharger, SimulatedMeter, SimulatedVehicle};
