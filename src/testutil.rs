//! Scripted device doubles for control-loop tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cache::Param;
use crate::domain::{
    ChargeRater, ChargeStatus, ChargeTimer, Charger, ClimaterState, CurrentMillis, DeviceError,
    DeviceResult, Identifier, Meter, PhaseCurrents, PhaseSwitcher, Vehicle, VehicleChargeState,
    VehicleClimater, VehicleIdentify, VehicleStartCharge, VehicleStopCharge,
};

/// Recorded charger interactions, inspected by tests in place of mock
/// expectations.
#[derive(Debug, Clone, PartialEq)]
pub enum ChargerCall {
    Enable(bool),
    MaxCurrent(i64),
    MaxCurrentMillis(f64),
    Phases(u8),
}

#[derive(Default)]
struct FakeChargerState {
    status: ChargeStatus,
    enabled: bool,
    status_queue: VecDeque<ChargeStatus>,
    calls: Vec<ChargerCall>,
}

pub struct FakeCharger {
    state: Mutex<FakeChargerState>,
    has_millis: bool,
    has_phase_switch: bool,
    identifier: Mutex<Option<String>>,
    has_identifier: bool,
}

impl FakeCharger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeChargerState::default()),
            has_millis: false,
            has_phase_switch: false,
            identifier: Mutex::new(None),
            has_identifier: false,
        }
    }

    pub fn with_millis(mut self) -> Self {
        self.has_millis = true;
        self
    }

    pub fn with_phase_switch(mut self) -> Self {
        self.has_phase_switch = true;
        self
    }

    pub fn with_identifier(mut self) -> Self {
        self.has_identifier = true;
        self
    }

    pub fn set_status(&self, status: ChargeStatus) {
        self.state.lock().status = status;
    }

    /// Queue statuses returned by successive `status()` calls; the last
    /// one sticks.
    pub fn push_status(&self, status: ChargeStatus) {
        self.state.lock().status_queue.push_back(status);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    pub fn set_identifier(&self, id: &str) {
        *self.identifier.lock() = Some(id.to_string());
    }

    pub fn calls(&self) -> Vec<ChargerCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

impl Default for FakeCharger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Charger for FakeCharger {
    async fn status(&self) -> DeviceResult<ChargeStatus> {
        let mut state = self.state.lock();
        if let Some(next) = state.status_queue.pop_front() {
            state.status = next;
        }
        Ok(state.status)
    }

    async fn enabled(&self) -> DeviceResult<bool> {
        Ok(self.state.lock().enabled)
    }

    async fn enable(&self, enable: bool) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.enabled = enable;
        state.calls.push(ChargerCall::Enable(enable));
        Ok(())
    }

    async fn max_current(&self, amps: i64) -> DeviceResult<()> {
        self.state.lock().calls.push(ChargerCall::MaxCurrent(amps));
        Ok(())
    }

    fn as_current_millis(&self) -> Option<&dyn CurrentMillis> {
        self.has_millis.then_some(self as &dyn CurrentMillis)
    }

    fn as_phase_switcher(&self) -> Option<&dyn PhaseSwitcher> {
        self.has_phase_switch.then_some(self as &dyn PhaseSwitcher)
    }

    fn as_identifier(&self) -> Option<&dyn Identifier> {
        self.has_identifier.then_some(self as &dyn Identifier)
    }
}

#[async_trait]
impl CurrentMillis for FakeCharger {
    async fn max_current_millis(&self, amps: f64) -> DeviceResult<()> {
        self.state
            .lock()
            .calls
            .push(ChargerCall::MaxCurrentMillis(amps));
        Ok(())
    }
}

#[async_trait]
impl PhaseSwitcher for FakeCharger {
    async fn phases_1p3p(&self, phases: u8) -> DeviceResult<()> {
        self.state.lock().calls.push(ChargerCall::Phases(phases));
        Ok(())
    }
}

#[async_trait]
impl Identifier for FakeCharger {
    async fn identify(&self) -> DeviceResult<String> {
        Ok(self.identifier.lock().clone().unwrap_or_default())
    }
}

#[derive(Default)]
struct FakeVehicleState {
    soc: f64,
    soc_queue: VecDeque<DeviceResult<f64>>,
    charge_status: Option<ChargeStatus>,
    climater: Option<ClimaterState>,
    start_calls: usize,
    stop_calls: usize,
}

pub struct FakeVehicle {
    title: String,
    capacity_wh: f64,
    identify_id: Option<String>,
    remote_charge: bool,
    state: Mutex<FakeVehicleState>,
}

impl FakeVehicle {
    pub fn new(title: &str, capacity_wh: f64) -> Self {
        Self {
            title: title.to_string(),
            capacity_wh,
            identify_id: None,
            remote_charge: false,
            state: Mutex::new(FakeVehicleState::default()),
        }
    }

    pub fn with_identify(mut self, id: &str) -> Self {
        self.identify_id = Some(id.to_string());
        self
    }

    pub fn with_remote_charge(mut self) -> Self {
        self.remote_charge = true;
        self
    }

    pub fn set_soc(&self, soc: f64) {
        self.state.lock().soc = soc;
    }

    /// Queue results for successive `soc()` calls; afterwards the fixed
    /// value applies.
    pub fn push_soc(&self, result: DeviceResult<f64>) {
        self.state.lock().soc_queue.push_back(result);
    }

    pub fn set_charge_status(&self, status: ChargeStatus) {
        self.state.lock().charge_status = Some(status);
    }

    pub fn set_climater(&self, climater: Option<ClimaterState>) {
        self.state.lock().climater = climater;
    }

    pub fn start_calls(&self) -> usize {
        self.state.lock().start_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.state.lock().stop_calls
    }
}

#[async_trait]
impl Vehicle for FakeVehicle {
    fn title(&self) -> &str {
        &self.title
    }

    fn capacity_wh(&self) -> f64 {
        self.capacity_wh
    }

    async fn soc(&self) -> DeviceResult<f64> {
        let mut state = self.state.lock();
        match state.soc_queue.pop_front() {
            Some(Ok(v)) => {
                state.soc = v;
                Ok(v)
            }
            Some(Err(e)) => Err(e),
            None => Ok(state.soc),
        }
    }

    fn as_charge_state(&self) -> Option<&dyn VehicleChargeState> {
        self.state
            .lock()
            .charge_status
            .is_some()
            .then_some(self as &dyn VehicleChargeState)
    }

    fn as_identify(&self) -> Option<&dyn VehicleIdentify> {
        self.identify_id
            .is_some()
            .then_some(self as &dyn VehicleIdentify)
    }

    fn as_climater(&self) -> Option<&dyn VehicleClimater> {
        self.state
            .lock()
            .climater
            .is_some()
            .then_some(self as &dyn VehicleClimater)
    }

    fn as_start_charge(&self) -> Option<&dyn VehicleStartCharge> {
        self.remote_charge.then_some(self as &dyn VehicleStartCharge)
    }

    fn as_stop_charge(&self) -> Option<&dyn VehicleStopCharge> {
        self.remote_charge.then_some(self as &dyn VehicleStopCharge)
    }
}

#[async_trait]
impl VehicleChargeState for FakeVehicle {
    async fn status(&self) -> DeviceResult<ChargeStatus> {
        self.state
            .lock()
            .charge_status
            .ok_or(DeviceError::NotAvailable)
    }
}

#[async_trait]
impl VehicleIdentify for FakeVehicle {
    async fn identify(&self) -> DeviceResult<String> {
        Ok(self.identify_id.clone().unwrap_or_default())
    }
}

#[async_trait]
impl VehicleClimater for FakeVehicle {
    async fn climater(&self) -> DeviceResult<ClimaterState> {
        self.state
            .lock()
            .climater
            .ok_or(DeviceError::NotAvailable)
    }
}

#[async_trait]
impl VehicleStartCharge for FakeVehicle {
    async fn start_charge(&self) -> DeviceResult<()> {
        self.state.lock().start_calls += 1;
        Ok(())
    }
}

#[async_trait]
impl VehicleStopCharge for FakeVehicle {
    async fn stop_charge(&self) -> DeviceResult<()> {
        self.state.lock().stop_calls += 1;
        Ok(())
    }
}

pub struct FakeMeter {
    power_w: Mutex<f64>,
    currents: Mutex<Option<(f64, f64, f64)>>,
}

impl FakeMeter {
    pub fn new(power_w: f64) -> Self {
        Self {
            power_w: Mutex::new(power_w),
            currents: Mutex::new(None),
        }
    }

    pub fn set_power(&self, power_w: f64) {
        *self.power_w.lock() = power_w;
    }

    pub fn set_currents(&self, l1: f64, l2: f64, l3: f64) {
        *self.currents.lock() = Some((l1, l2, l3));
    }
}

#[async_trait]
impl Meter for FakeMeter {
    async fn current_power(&self) -> DeviceResult<f64> {
        Ok(*self.power_w.lock())
    }

    fn as_phase_currents(&self) -> Option<&dyn PhaseCurrents> {
        self.currents
            .lock()
            .is_some()
            .then_some(self as &dyn PhaseCurrents)
    }
}

#[async_trait]
impl PhaseCurrents for FakeMeter {
    async fn currents(&self) -> DeviceResult<(f64, f64, f64)> {
        self.currents.lock().ok_or(DeviceError::NotAvailable)
    }
}

/// Fixed-value session rater with no integration behaviour.
pub struct FakeRater {
    energy_kwh: Mutex<f64>,
}

impl FakeRater {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            energy_kwh: Mutex::new(0.0),
        })
    }

    pub fn set_energy(&self, kwh: f64) {
        *self.energy_kwh.lock() = kwh;
    }
}

#[async_trait]
impl ChargeRater for FakeRater {
    async fn charged_energy(&self) -> DeviceResult<f64> {
        Ok(*self.energy_kwh.lock())
    }
}

pub struct FakeChargeTimer;

#[async_trait]
impl ChargeTimer for FakeChargeTimer {
    async fn charging_time(&self) -> DeviceResult<std::time::Duration> {
        Ok(std::time::Duration::ZERO)
    }
}

/// Drain all pending params, keeping the latest value per key.
pub fn drain_params(
    rx: &mut mpsc::UnboundedReceiver<Param>,
) -> std::collections::HashMap<&'static str, Value> {
    let mut seen = std::collections::HashMap::new();
    while let Ok(param) = rx.try_recv() {
        seen.insert(param.key, param.value);
    }
    seen
}
