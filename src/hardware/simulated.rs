#![allow(dead_code)]
//! Simulated devices for development and testing. They model just enough
//! behaviour for the control loop to be exercised end-to-end without
//! hardware: the charger transitions B<->C on enable, the meter reports
//! whatever the simulation feeds it, the vehicle serves a TTL-cached SoC.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Timelike;
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::config::{ChargerConfig, MeterConfig, VehicleConfig};
use crate::domain::{
    BatterySoc, ChargeStatus, Charger, ClimaterState, CurrentMillis, DeviceError, DeviceResult,
    Identifier, Meter, MeterEnergy, PhaseCurrents, PhaseSwitcher, Tariff, Vehicle,
    VehicleChargeState, VehicleClimater, VehicleIdentify,
};
use crate::provider::{CacheFlush, Cached};

#[derive(Debug)]
struct MeterState {
    power_w: f64,
    currents: Option<(f64, f64, f64)>,
    soc: Option<f64>,
    energy_kwh: Option<f64>,
}

/// Simulated meter with optional phase-current, SoC and energy readings.
#[derive(Debug)]
pub struct SimulatedMeter {
    state: Mutex<MeterState>,
}

impl SimulatedMeter {
    pub fn from_config(config: &MeterConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MeterState {
                power_w: config.power_w,
                currents: config.currents.map(|[l1, l2, l3]| (l1, l2, l3)),
                soc: config.soc,
                energy_kwh: config.energy_kwh,
            }),
        })
    }

    pub fn set_power(&self, power_w: f64) {
        self.state.lock().power_w = power_w;
    }

    pub fn set_currents(&self, l1: f64, l2: f64, l3: f64) {
        self.state.lock().currents = Some((l1, l2, l3));
    }

    pub fn set_soc(&self, soc: f64) {
        self.state.lock().soc = Some(soc);
    }
}

#[async_trait]
impl Meter for SimulatedMeter {
    async fn current_power(&self) -> DeviceResult<f64> {
        Ok(self.state.lock().power_w)
    }

    fn as_phase_currents(&self) -> Option<&dyn PhaseCurrents> {
        self.state
            .lock()
            .currents
            .is_some()
            .then_some(self as &dyn PhaseCurrents)
    }

    fn as_battery(&self) -> Option<&dyn BatterySoc> {
        self.state
            .lock()
            .soc
            .is_some()
            .then_some(self as &dyn BatterySoc)
    }

    fn as_energy(&self) -> Option<&dyn MeterEnergy> {
        self.state
            .lock()
            .energy_kwh
            .is_some()
            .then_some(self as &dyn MeterEnergy)
    }
}

#[async_trait]
impl PhaseCurrents for SimulatedMeter {
    async fn currents(&self) -> DeviceResult<(f64, f64, f64)> {
        self.state.lock().currents.ok_or(DeviceError::NotAvailable)
    }
}

#[async_trait]
impl BatterySoc for SimulatedMeter {
    async fn soc(&self) -> DeviceResult<f64> {
        self.state.lock().soc.ok_or(DeviceError::NotAvailable)
    }
}

#[async_trait]
impl MeterEnergy for SimulatedMeter {
    async fn total_energy(&self) -> DeviceResult<f64> {
        self.state
            .lock()
            .energy_kwh
            .ok_or(DeviceError::NotAvailable)
    }
}

#[derive(Debug)]
struct ChargerState {
    status: ChargeStatus,
    enabled: bool,
    current_a: f64,
    phases: u8,
}

/// Simulated charger. Tracks pilot status, the enabled state and the
/// commanded current; an integrated meter mirrors the resulting power.
pub struct SimulatedCharger {
    state: Mutex<ChargerState>,
    meter: Option<Arc<SimulatedMeter>>,
    identifier: Mutex<Option<String>>,
    voltage: f64,
    has_phase_switch: bool,
    has_millis: bool,
    has_identifier: bool,
}

impl SimulatedCharger {
    pub fn from_config(config: &ChargerConfig, voltage: f64) -> Arc<Self> {
        let meter = config.has_meter.then(|| {
            SimulatedMeter::from_config(&MeterConfig {
                name: format!("{}-meter", config.name),
                power_w: 0.0,
                currents: None,
                soc: None,
                energy_kwh: None,
            })
        });

        Arc::new(Self {
            state: Mutex::new(ChargerState {
                status: ChargeStatus::Disconnected,
                enabled: false,
                current_a: 0.0,
                phases: config.phases,
            }),
            meter,
            identifier: Mutex::new(config.identifier.clone()),
            voltage,
            has_phase_switch: config.phase_switch,
            has_millis: config.millis,
            has_identifier: config.identifier.is_some(),
        })
    }

    /// Simulate a vehicle plugging in.
    pub fn simulate_connect(&self) {
        let mut state = self.state.lock();
        state.status = if state.enabled {
            ChargeStatus::Charging
        } else {
            ChargeStatus::Connected
        };
        self.sync_meter(&state);
    }

    /// Simulate the vehicle unplugging.
    pub fn simulate_disconnect(&self) {
        let mut state = self.state.lock();
        state.status = ChargeStatus::Disconnected;
        state.current_a = 0.0;
        self.sync_meter(&state);
    }

    pub fn simulate_identifier(&self, id: Option<String>) {
        *self.identifier.lock() = id;
    }

    fn sync_meter(&self, state: &ChargerState) {
        if let Some(meter) = &self.meter {
            let power = if state.enabled && state.status.is_charging() {
                state.current_a * state.phases as f64 * self.voltage
            } else {
                0.0
            };
            meter.set_power(power);
        }
    }
}

#[async_trait]
impl Charger for SimulatedCharger {
    async fn status(&self) -> DeviceResult<ChargeStatus> {
        Ok(self.state.lock().status)
    }

    async fn enabled(&self) -> DeviceResult<bool> {
        Ok(self.state.lock().enabled)
    }

    async fn enable(&self, enable: bool) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.enabled = enable;

        // a connected car follows the contactor
        if enable && state.status == ChargeStatus::Connected {
            state.status = ChargeStatus::Charging;
        } else if !enable && state.status == ChargeStatus::Charging {
            state.status = ChargeStatus::Connected;
        }

        self.sync_meter(&state);
        Ok(())
    }

    async fn max_current(&self, amps: i64) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.current_a = amps as f64;
        self.sync_meter(&state);
        Ok(())
    }

    fn as_current_millis(&self) -> Option<&dyn CurrentMillis> {
        self.has_millis.then_some(self as &dyn CurrentMillis)
    }

    fn as_phase_switcher(&self) -> Option<&dyn PhaseSwitcher> {
        self.has_phase_switch
            .then_some(self as &dyn PhaseSwitcher)
    }

    fn as_meter(&self) -> Option<&dyn Meter> {
        self.meter.as_deref().map(|m| m as &dyn Meter)
    }

    fn as_identifier(&self) -> Option<&dyn Identifier> {
        self.has_identifier.then_some(self as &dyn Identifier)
    }
}

#[async_trait]
impl CurrentMillis for SimulatedCharger {
    async fn max_current_millis(&self, amps: f64) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.current_a = amps;
        self.sync_meter(&state);
        Ok(())
    }
}

#[async_trait]
impl PhaseSwitcher for SimulatedCharger {
    async fn phases_1p3p(&self, phases: u8) -> DeviceResult<()> {
        if phases != 1 && phases != 3 {
            return Err(DeviceError::Communication(format!(
                "invalid phase count: {phases}"
            )));
        }
        let mut state = self.state.lock();
        state.phases = phases;
        self.sync_meter(&state);
        Ok(())
    }
}

#[async_trait]
impl Identifier for SimulatedCharger {
    async fn identify(&self) -> DeviceResult<String> {
        Ok(self.identifier.lock().clone().unwrap_or_default())
    }
}

/// Simulated vehicle. SoC reads go through the TTL cache the way a cloud
/// driver's would.
pub struct SimulatedVehicle {
    title: String,
    capacity_wh: f64,
    identify: Option<String>,
    soc: Mutex<f64>,
    cached_soc: Cached<f64>,
    charge_status: Mutex<Option<ChargeStatus>>,
    climate: Mutex<Option<ClimaterState>>,
}

impl SimulatedVehicle {
    pub fn from_config(config: &VehicleConfig, flush: Arc<CacheFlush>) -> Arc<Self> {
        Arc::new(Self {
            title: config.title.clone().unwrap_or_else(|| config.name.clone()),
            capacity_wh: config.capacity_kwh * 1e3,
            identify: config.identify.clone(),
            soc: Mutex::new(config.soc),
            cached_soc: Cached::new(Duration::from_secs(config.cache_ttl_secs), flush),
            charge_status: Mutex::new(config.charge_state.then_some(ChargeStatus::Disconnected)),
            climate: Mutex::new(config.climate.then_some(ClimaterState {
                active: false,
                outside_temp_c: 15.0,
                target_temp_c: 20.0,
            })),
        })
    }

    pub fn set_soc(&self, soc: f64) {
        *self.soc.lock() = soc;
    }

    pub fn set_charge_status(&self, status: ChargeStatus) {
        *self.charge_status.lock() = Some(status);
    }

    pub fn set_climate_active(&self, active: bool) {
        let mut climate = self.climate.lock();
        if let Some(state) = climate.as_mut() {
            state.active = active;
        }
    }
}

#[async_trait]
impl Vehicle for SimulatedVehicle {
    fn title(&self) -> &str {
        &self.title
    }

    fn capacity_wh(&self) -> f64 {
        self.capacity_wh
    }

    async fn soc(&self) -> DeviceResult<f64> {
        self.cached_soc.get(|| async { Ok(*self.soc.lock()) }).await
    }

    fn as_identify(&self) -> Option<&dyn VehicleIdentify> {
        self.identify
            .is_some()
            .then_some(self as &dyn VehicleIdentify)
    }

    fn as_charge_state(&self) -> Option<&dyn VehicleChargeState> {
        self.charge_status
            .lock()
            .is_some()
            .then_some(self as &dyn VehicleChargeState)
    }

    fn as_climater(&self) -> Option<&dyn VehicleClimater> {
        self.climate
            .lock()
            .is_some()
            .then_some(self as &dyn VehicleClimater)
    }
}

#[async_trait]
impl VehicleIdentify for SimulatedVehicle {
    async fn identify(&self) -> DeviceResult<String> {
        Ok(self.identify.clone().unwrap_or_default())
    }
}

#[async_trait]
impl VehicleChargeState for SimulatedVehicle {
    async fn status(&self) -> DeviceResult<ChargeStatus> {
        self.charge_status
            .lock()
            .ok_or(DeviceError::NotAvailable)
    }
}

#[async_trait]
impl VehicleClimater for SimulatedVehicle {
    async fn climater(&self) -> DeviceResult<ClimaterState> {
        self.climate.lock().ok_or(DeviceError::NotAvailable)
    }
}

/// Tariff with fixed cheap hours of the day.
pub struct ScheduledTariff {
    clock: Arc<dyn Clock>,
    cheap_hours: Vec<u32>,
}

impl ScheduledTariff {
    pub fn new(clock: Arc<dyn Clock>, cheap_hours: Vec<u32>) -> Self {
        Self { clock, cheap_hours }
    }
}

#[async_trait]
impl Tariff for ScheduledTariff {
    async fn is_cheap(&self) -> DeviceResult<bool> {
        let hour = self.clock.now().hour();
        Ok(self.cheap_hours.contains(&hour))
    }
}
