use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bus::{ChargeEvent, EventBus};
use crate::cache::Param;
use crate::clock::Clock;
use crate::controller::coordinator::Coordinator;
use crate::controller::wrapper::{
    SyntheticChargeMeter, SyntheticChargeRater, SyntheticChargeTimer,
};
use crate::domain::{
    ChargeMode, ChargeRater, ChargeStatus, ChargeTimer, Charger, DeviceError, DeviceResult, Meter,
    PollMode, RemoteDemand, Vehicle,
};
use crate::provider::CacheFlush;
use crate::push::{EventKind, PushEvent};
use crate::settings::{RuntimeSettings, SettingsStore};
use crate::soc::{Estimator, Timer as SocTimer, TimerContext};
use crate::util::{retry, wildcard_match, with_timeout};

/// Minimum current at which a phase is treated as active.
const MIN_ACTIVE_CURRENT: f64 = 1.0;
/// Poll cadence while waiting to identify the connected vehicle.
const VEHICLE_DETECT_INTERVAL_SECS: i64 = 3 * 60;
/// Length of the vehicle detection window after connect.
const VEHICLE_DETECT_DURATION_SECS: i64 = 10 * 60;
/// Floor for the vehicle SoC poll interval.
pub const POLL_INTERVAL: StdDuration = StdDuration::from_secs(60 * 60);

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: StdDuration = StdDuration::from_millis(100);

/// PV enable/disable hysteresis parameters.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdConfig {
    pub delay: chrono::Duration,
    /// Site power threshold in W. Enable: start charging when site power
    /// drops below it; disable: stop when site power exceeds it.
    pub threshold: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            delay: chrono::Duration::seconds(60),
            threshold: 0.0,
        }
    }
}

/// Vehicle SoC polling configuration.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub mode: PollMode,
    pub interval: chrono::Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            mode: PollMode::Charging,
            interval: chrono::Duration::from_std(POLL_INTERVAL).unwrap(),
        }
    }
}

/// SoC handling configuration.
#[derive(Debug, Clone, Copy)]
pub struct SocConfig {
    pub poll: PollConfig,
    pub estimate: bool,
    /// Charge at full power below this SoC regardless of mode; 0 disables.
    pub min: u32,
    /// Stop charging at this SoC; 100 lets the car finish naturally.
    pub target: u32,
}

impl Default for SocConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            estimate: true,
            min: 0,
            target: 100,
        }
    }
}

/// Mode/target overrides applied on disconnect or identification.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionConfig {
    pub mode: Option<ChargeMode>,
    pub target_soc: Option<u32>,
}

/// Everything needed to assemble a loadpoint.
pub struct LoadpointParams {
    pub id: usize,
    pub title: String,
    pub clock: Arc<dyn Clock>,
    pub charger: Arc<dyn Charger>,
    pub charge_meter: Option<Arc<dyn Meter>>,
    pub vehicles: Vec<Arc<dyn Vehicle>>,
    pub coordinator: Arc<Coordinator>,
    pub cache_flush: Arc<CacheFlush>,
    pub settings: Option<Arc<SettingsStore>>,
    pub ui_tx: mpsc::UnboundedSender<Param>,
    pub push_tx: mpsc::UnboundedSender<PushEvent>,
    /// Out-of-band site update trigger, capacity 1, latest wins.
    pub update_tx: Option<mpsc::Sender<()>>,
    pub voltage: f64,
    pub op_timeout: StdDuration,
    pub mode: ChargeMode,
    pub phases: u8,
    pub min_current: f64,
    pub max_current: f64,
    pub guard_duration: chrono::Duration,
    pub enable: ThresholdConfig,
    pub disable: ThresholdConfig,
    pub soc: SocConfig,
    pub on_disconnect: ActionConfig,
    pub on_identify: HashMap<String, ActionConfig>,
}

pub(crate) enum MeterSource {
    External(Arc<dyn Meter>),
    Charger,
    Synthetic(Arc<SyntheticChargeMeter>),
}

pub(crate) enum RaterSource {
    Charger,
    External(Arc<dyn ChargeRater>),
    Synthetic(Arc<SyntheticChargeRater>),
}

pub(crate) enum TimerSource {
    Charger,
    External(Arc<dyn ChargeTimer>),
    Synthetic(Arc<SyntheticChargeTimer>),
}

/// User-visible fields, shared with external callers behind one exclusive
/// lock.
pub(crate) struct Guarded {
    pub mode: ChargeMode,
    pub status: ChargeStatus,
    pub min_current: f64,
    pub max_current: f64,
    /// Configured phase count (1 or 3).
    pub phases: u8,
    pub target_soc: u32,
    pub min_soc: u32,
    pub remote_demand: RemoteDemand,
    pub vehicle: Option<Arc<dyn Vehicle>>,
    pub charge_power: f64,
    pub remaining_duration: Option<StdDuration>,
    pub remaining_energy_wh: f64,
    /// Armed target-charge deadline and its SoC.
    pub target_time: Option<DateTime<Utc>>,
    pub timer_soc: u32,
    /// Set by external mutations; the worker elapses the PV and guard
    /// timers before the next decision.
    pub elapse_timers: bool,
}

/// Worker-owned state, touched only from the loadpoint's own update cycle.
pub(crate) struct LoopState {
    pub enabled: bool,
    pub charge_current: f64,
    pub active_phases: u8,
    pub charge_power: f64,
    pub charge_currents: Option<[f64; 3]>,
    pub charged_energy_wh: f64,
    pub charge_duration: StdDuration,
    pub vehicle_soc: f64,

    pub guard_updated: Option<DateTime<Utc>>,
    pub pv_timer: Option<DateTime<Utc>>,
    pub phase_timer: Option<DateTime<Utc>>,
    pub soc_updated: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub vehicle_detect_started: Option<DateTime<Utc>>,
    pub vehicle_refresh_at: Option<DateTime<Utc>>,
    pub vehicle_id: Option<String>,

    pub estimator: Option<Estimator>,
    pub soc_timer: SocTimer,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            enabled: false,
            charge_current: 0.0,
            active_phases: 3,
            charge_power: 0.0,
            charge_currents: None,
            charged_energy_wh: 0.0,
            charge_duration: StdDuration::ZERO,
            vehicle_soc: 0.0,
            guard_updated: None,
            pv_timer: None,
            phase_timer: None,
            soc_updated: None,
            connected_at: None,
            vehicle_detect_started: None,
            vehicle_refresh_at: None,
            vehicle_id: None,
            estimator: None,
            soc_timer: SocTimer::new(),
        }
    }
}

/// One charging station: charger, meter, vehicle pool and policy. Controls
/// charge current and phases depending on SoC needs and power
/// availability; driven once per site tick via [`Loadpoint::update`].
pub struct Loadpoint {
    pub(crate) id: usize,
    pub(crate) title: String,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) voltage: f64,
    pub(crate) op_timeout: StdDuration,

    pub(crate) charger: Arc<dyn Charger>,
    pub(crate) meter: MeterSource,
    pub(crate) rater: RaterSource,
    pub(crate) timer: TimerSource,
    pub(crate) vehicles: Vec<Arc<dyn Vehicle>>,
    pub(crate) coordinator: Arc<Coordinator>,
    pub(crate) cache_flush: Arc<CacheFlush>,
    pub(crate) settings_store: Option<Arc<SettingsStore>>,

    pub(crate) bus: EventBus,
    pub(crate) ui_tx: mpsc::UnboundedSender<Param>,
    pub(crate) push_tx: mpsc::UnboundedSender<PushEvent>,
    pub(crate) update_tx: Option<mpsc::Sender<()>>,

    pub(crate) guard_duration: chrono::Duration,
    pub(crate) enable: ThresholdConfig,
    pub(crate) disable: ThresholdConfig,
    pub(crate) soc_cfg: SocConfig,
    pub(crate) on_disconnect: ActionConfig,
    pub(crate) on_identify: HashMap<String, ActionConfig>,

    pub(crate) guarded: Mutex<Guarded>,
    pub(crate) state: tokio::sync::Mutex<LoopState>,
}

impl Loadpoint {
    pub fn new(params: LoadpointParams) -> Self {
        let LoadpointParams {
            id,
            title,
            clock,
            charger,
            charge_meter,
            vehicles,
            coordinator,
            cache_flush,
            settings,
            ui_tx,
            push_tx,
            update_tx,
            voltage,
            op_timeout,
            mode,
            phases,
            min_current,
            max_current,
            guard_duration,
            enable,
            disable,
            soc,
            on_disconnect,
            on_identify,
        } = params;

        let mut bus = EventBus::new();

        // ensure a charge meter exists: physical, charger-integrated, or
        // synthesized from the commanded current
        let meter = if let Some(m) = charge_meter {
            MeterSource::External(m)
        } else if charger.as_meter().is_some() {
            MeterSource::Charger
        } else {
            let meter = SyntheticChargeMeter::new();
            let handle = Arc::clone(&meter);
            bus.subscribe(move |ev| match *ev {
                ChargeEvent::Current {
                    amps,
                    active_phases,
                    charging,
                } => {
                    let power = if charging {
                        amps * active_phases as f64 * voltage
                    } else {
                        0.0
                    };
                    handle.set_power(power);
                }
                ChargeEvent::Stop => handle.set_power(0.0),
                _ => {}
            });
            MeterSource::Synthetic(meter)
        };

        // ensure a charge rater exists
        let rater = if charger.as_rater().is_some() {
            RaterSource::Charger
        } else {
            let rater = SyntheticChargeRater::new(Arc::clone(&clock));
            let handle = Arc::clone(&rater);
            bus.subscribe(move |ev| match *ev {
                ChargeEvent::Power { watts } => handle.set_charge_power(watts),
                ChargeEvent::Connect => handle.start_charge(false),
                ChargeEvent::Start => handle.start_charge(true),
                ChargeEvent::Stop => handle.stop_charge(),
                _ => {}
            });
            RaterSource::Synthetic(rater)
        };

        // ensure a charge timer exists
        let timer = if charger.as_timer().is_some() {
            TimerSource::Charger
        } else {
            let timer = SyntheticChargeTimer::new(Arc::clone(&clock));
            let handle = Arc::clone(&timer);
            bus.subscribe(move |ev| match *ev {
                ChargeEvent::Connect => handle.start_charge(false),
                ChargeEvent::Start => handle.start_charge(true),
                ChargeEvent::Stop => handle.stop_charge(),
                _ => {}
            });
            TimerSource::Synthetic(timer)
        };

        Self {
            id,
            title,
            clock,
            voltage,
            op_timeout,
            charger,
            meter,
            rater,
            timer,
            vehicles,
            coordinator,
            cache_flush,
            settings_store: settings,
            bus,
            ui_tx,
            push_tx,
            update_tx,
            guard_duration,
            enable,
            disable,
            soc_cfg: soc,
            on_disconnect,
            on_identify,
            guarded: Mutex::new(Guarded {
                mode,
                status: ChargeStatus::None,
                min_current,
                max_current,
                phases,
                target_soc: soc.target,
                min_soc: soc.min,
                remote_demand: RemoteDemand::Enable,
                vehicle: None,
                charge_power: 0.0,
                remaining_duration: None,
                remaining_energy_wh: 0.0,
                target_time: None,
                timer_soc: 0,
                elapse_timers: false,
            }),
            state: tokio::sync::Mutex::new(LoopState::default()),
        }
    }

    /// Human-readable loadpoint title.
    pub fn name(&self) -> &str {
        &self.title
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn publish(&self, key: &'static str, value: impl Serialize) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(_) => return,
        };
        let _ = self.ui_tx.send(Param {
            loadpoint: Some(self.id),
            key,
            value,
        });
    }

    pub(crate) fn push_event(&self, kind: EventKind) {
        let _ = self.push_tx.send(PushEvent {
            loadpoint: Some(self.id),
            kind,
        });
    }

    /// Ask the site for an out-of-band update; coalesces.
    pub(crate) fn request_update(&self) {
        if let Some(tx) = &self.update_tx {
            let _ = tx.try_send(());
        }
    }

    pub(crate) fn connected(&self) -> bool {
        self.status().is_connected()
    }

    pub(crate) fn charging(&self) -> bool {
        self.status().is_charging()
    }

    pub fn status(&self) -> ChargeStatus {
        self.guarded.lock().status
    }

    fn set_status(&self, status: ChargeStatus) {
        self.guarded.lock().status = status;
    }

    /// Prepare the loadpoint: publish initial values, adopt the charger's
    /// enabled state and restore persisted runtime settings.
    pub async fn prepare(&self) {
        let mut st = self.state.lock().await;

        // assume all configured phases are active
        st.active_phases = self.phases();

        self.publish("title", &self.title);
        self.publish("minCurrent", self.min_current());
        self.publish("maxCurrent", self.max_current());
        self.publish("phases", self.phases());
        self.publish("activePhases", st.active_phases);
        self.publish("hasVehicle", !self.vehicles.is_empty());
        self.publish("mode", self.mode());
        self.publish("targetSoC", self.target_soc());
        self.publish("minSoC", self.min_soc());

        // always treat a single vehicle as attached so poll mode `always`
        // works while disconnected
        if self.vehicles.len() == 1 {
            let vehicle = Arc::clone(&self.vehicles[0]);
            self.set_active_vehicle(&mut st, Some(vehicle)).await;
        } else if self.vehicles.len() > 1 {
            self.start_vehicle_detection(&mut st);
        }

        // read initial charger state to avoid bouncing the contactor on
        // restart
        match with_timeout(self.op_timeout, self.charger.enabled()).await {
            Ok(enabled) => {
                st.enabled = enabled;
                if enabled {
                    st.guard_updated = Some(self.clock.now());
                    let min = self.min_current();
                    if let Err(e) = self.set_limit(&mut st, min, false).await {
                        error!(loadpoint = %self.title, error = %e, "initial current");
                    }
                }
            }
            Err(e) => error!(loadpoint = %self.title, error = %e, "charger"),
        }

        drop(st);

        // re-arm a persisted target charge
        if let Some(store) = &self.settings_store {
            let persisted = store.get(self.id);
            if let Some(finish) = persisted.finish_at {
                if finish > self.clock.now() {
                    let soc = persisted.target_soc.unwrap_or_else(|| self.target_soc());
                    self.set_target_charge(finish, soc);
                    return;
                }
            }
            if let Some(soc) = persisted.target_soc {
                let _ = self.set_target_soc(soc);
            }
        }
    }

    /// Main control function: reevaluates meters and charger state and
    /// applies the resulting current limit.
    pub async fn update(&self, site_power: f64, cheap: bool) {
        let mut st = self.state.lock().await;

        let mode = self.mode();
        self.publish("mode", mode);

        // read and publish meters first
        self.update_charge_power(&mut st).await;
        self.update_charge_currents(&mut st).await;

        // sync the synthetic meter and rater with the initial readings
        self.publish_current_event(&st);
        self.bus.publish(ChargeEvent::Power {
            watts: st.charge_power,
        });

        // update progress before the status may change
        self.publish_charge_progress(&mut st).await;

        if let Err(e) = self.update_charger_status(&mut st).await {
            error!(loadpoint = %self.title, error = %e, "charger");
            return;
        }

        self.publish("connected", self.connected());
        self.publish("charging", self.charging());
        self.publish("enabled", st.enabled);

        // identify the connected vehicle
        if self.connected() {
            self.identify_vehicle(&mut st).await;

            if self.vehicle_unidentified(&mut st) {
                self.identify_vehicle_by_status(&mut st).await;
            }
        }

        // publish soc after the status update so the initial connected
        // state matches the charger status
        self.publish_soc_and_range(&mut st).await;

        self.sync_charger(&st).await;

        // honour deferred timer elapse requests from external mutations
        if std::mem::take(&mut self.guarded.lock().elapse_timers) {
            self.elapse_pv_timer(&mut st);
        }

        let res = self.decide(&mut st, mode, site_power, cheap).await;
        if let Err(e) = res {
            error!(loadpoint = %self.title, error = %e, "update");
        }
    }

    /// Decision table; first match wins.
    async fn decide(
        &self,
        st: &mut LoopState,
        mode: ChargeMode,
        site_power: f64,
        cheap: bool,
    ) -> DeviceResult<()> {
        let mut remote_disabled = RemoteDemand::Enable;

        let res = if !self.connected() {
            // always disable the charger when no vehicle is connected
            self.set_limit(st, 0.0, false).await
        } else if self.target_soc_reached(st) {
            debug!(
                loadpoint = %self.title,
                soc = st.vehicle_soc,
                target = self.target_soc(),
                "target soc reached"
            );

            let mut target = 0.0; // zero disables
            if self.climate_active().await {
                debug!(loadpoint = %self.title, "climater active");
                target = self.min_current();
            }
            let res = self.set_limit(st, target, true).await;

            // once the target is reached the timer request is dropped
            self.reset_soc_timer(st);
            res
        } else if self.remote_controlled(RemoteDemand::HardDisable) {
            remote_disabled = RemoteDemand::HardDisable;
            self.set_limit(st, 0.0, true).await
        } else if mode == ChargeMode::Off {
            self.set_limit(st, 0.0, true).await
        } else if self.min_soc_not_reached(st) {
            // charge at full power up to the minimum soc, 3p if possible
            let res = match self.scale_phases_if_available(st, 3).await {
                Ok(()) => {
                    let max = self.max_current();
                    self.set_limit(st, max, true).await
                }
                Err(e) => Err(e),
            };
            // let PV mode disable again right afterwards
            self.elapse_pv_timer(st);
            res
        } else if mode == ChargeMode::Now {
            match self.scale_phases_if_available(st, 3).await {
                Ok(()) => {
                    let max = self.max_current();
                    self.set_limit(st, max, true).await
                }
                Err(e) => Err(e),
            }
        } else if self.target_time_demand_active(st) {
            let current = {
                let ctx = self.timer_context();
                st.soc_timer.handle(&ctx)
            };
            self.publish_timer_state(st);
            self.set_limit(st, current, true).await
        } else if mode == ChargeMode::MinPv || mode == ChargeMode::Pv {
            let mut target = self.pv_max_current(st, mode, site_power).await;
            debug!(loadpoint = %self.title, current = target, "pv max charge current");

            let mut required = false;

            if target == 0.0 && self.climate_active().await {
                target = self.max_current();
                required = true;
            }

            if cheap {
                target = self.max_current();
                debug!(loadpoint = %self.title, current = target, "cheap tariff");
                required = true;
            }

            if self.remote_controlled(RemoteDemand::SoftDisable) {
                remote_disabled = RemoteDemand::SoftDisable;
                target = 0.0;
                required = true;
            }

            self.set_limit(st, target, required).await
        } else {
            Ok(())
        };

        if remote_disabled != RemoteDemand::Enable {
            self.publish("remoteDisabled", remote_disabled);
        }

        res
    }

    // --- telemetry -------------------------------------------------------

    async fn meter_power(&self) -> DeviceResult<f64> {
        match &self.meter {
            MeterSource::External(m) => m.current_power().await,
            MeterSource::Synthetic(m) => m.current_power().await,
            MeterSource::Charger => match self.charger.as_meter() {
                Some(m) => m.current_power().await,
                None => Err(DeviceError::NotAvailable),
            },
        }
    }

    async fn meter_currents(&self) -> Option<DeviceResult<(f64, f64, f64)>> {
        let currents = match &self.meter {
            MeterSource::External(m) => m.as_phase_currents()?.currents().await,
            MeterSource::Synthetic(_) => return None,
            MeterSource::Charger => {
                self.charger
                    .as_meter()?
                    .as_phase_currents()?
                    .currents()
                    .await
            }
        };
        Some(currents)
    }

    async fn charged_energy_kwh(&self) -> DeviceResult<f64> {
        match &self.rater {
            RaterSource::External(r) => r.charged_energy().await,
            RaterSource::Synthetic(r) => r.charged_energy().await,
            RaterSource::Charger => match self.charger.as_rater() {
                Some(r) => r.charged_energy().await,
                None => Err(DeviceError::NotAvailable),
            },
        }
    }

    async fn charging_time(&self) -> DeviceResult<StdDuration> {
        match &self.timer {
            TimerSource::External(t) => t.charging_time().await,
            TimerSource::Synthetic(t) => t.charging_time().await,
            TimerSource::Charger => match self.charger.as_timer() {
                Some(t) => t.charging_time().await,
                None => Err(DeviceError::NotAvailable),
            },
        }
    }

    /// Update charge meter power, retrying transient read failures.
    async fn update_charge_power(&self, st: &mut LoopState) {
        let res = retry(RETRY_ATTEMPTS, RETRY_DELAY, || {
            with_timeout(self.op_timeout, self.meter_power())
        })
        .await;

        match res {
            Ok(power) => {
                st.charge_power = power;
                self.guarded.lock().charge_power = power;
                debug!(loadpoint = %self.title, power, "charge power");
                self.publish("chargePower", power);
            }
            Err(e) => error!(loadpoint = %self.title, error = %e, "charge meter"),
        }
    }

    /// Read per-phase currents if the meter supports them, otherwise infer
    /// the active phase count from power draw.
    async fn update_charge_currents(&self, st: &mut LoopState) {
        st.charge_currents = None;

        let Some(res) = self.meter_currents().await else {
            // guess active phases from power consumption; assumes the
            // charge power has been updated before
            if self.charging() && st.charge_current > 0.0 {
                let phases = (st.charge_power / self.voltage / st.charge_current).round();
                if (1.0..=3.0).contains(&phases) {
                    st.active_phases = phases as u8;
                    debug!(
                        loadpoint = %self.title,
                        phases = st.active_phases,
                        "detected phases"
                    );
                    self.publish("activePhases", st.active_phases);
                }
            }
            return;
        };

        let (l1, l2, l3) = match res {
            Ok(currents) => currents,
            Err(e) => {
                if !e.is_not_available() {
                    error!(loadpoint = %self.title, error = %e, "charge meter");
                }
                return;
            }
        };

        st.charge_currents = Some([l1, l2, l3]);
        self.publish("chargeCurrents", [l1, l2, l3]);

        if self.charging() {
            let phases = [l1, l2, l3]
                .iter()
                .filter(|&&i| i >= MIN_ACTIVE_CURRENT)
                .count() as u8;

            if phases >= 1 {
                st.active_phases = phases;
                debug!(loadpoint = %self.title, phases, "detected phases");
                self.publish("activePhases", st.active_phases);
            }
        }
    }

    /// Publish charged energy and charging duration.
    async fn publish_charge_progress(&self, st: &mut LoopState) {
        match self.charged_energy_kwh().await {
            Ok(kwh) => st.charged_energy_wh = 1e3 * kwh,
            Err(e) => error!(loadpoint = %self.title, error = %e, "charge rater"),
        }

        match self.charging_time().await {
            Ok(duration) => st.charge_duration = StdDuration::from_secs(duration.as_secs()),
            Err(e) => error!(loadpoint = %self.title, error = %e, "charge timer"),
        }

        self.publish("chargedEnergy", st.charged_energy_wh);
        self.publish("chargeDuration", st.charge_duration.as_secs());
    }

    fn publish_current_event(&self, st: &LoopState) {
        self.bus.publish(ChargeEvent::Current {
            amps: st.charge_current,
            active_phases: st.active_phases,
            charging: st.enabled && self.charging(),
        });
        self.publish(
            "chargeCurrent",
            if st.enabled { st.charge_current } else { 0.0 },
        );
    }

    // --- status ----------------------------------------------------------

    /// Update charger status and derive connect/disconnect and charge
    /// start/stop transitions.
    async fn update_charger_status(&self, st: &mut LoopState) -> DeviceResult<()> {
        let status = with_timeout(self.op_timeout, self.charger.status()).await?;
        debug!(loadpoint = %self.title, status = %status, "charger status");

        let prev = self.status();
        if status == prev {
            return Ok(());
        }
        self.set_status(status);

        // initial startup: set connected silently
        if prev == ChargeStatus::None {
            st.connected_at = Some(self.clock.now());
            self.publish("connectedDuration", 0u64);
        }

        // coming from A: vehicle connected
        if prev == ChargeStatus::Disconnected && status.is_connected() {
            self.on_vehicle_connect(st).await;
        }

        // charge cycle start/stop; handled before disconnect so the final
        // energy is accounted for
        if status.is_charging() {
            self.on_charge_start(st);
        } else if prev == ChargeStatus::Charging {
            self.on_charge_stop(st);
        }

        // moving to A: vehicle disconnected
        if status == ChargeStatus::Disconnected && prev.is_connected() {
            self.on_vehicle_disconnect(st).await;
        }

        // resync dependents on every state change
        self.publish_current_event(st);

        Ok(())
    }

    async fn on_vehicle_connect(&self, st: &mut LoopState) {
        info!(loadpoint = %self.title, "car connected");

        st.charged_energy_wh = 0.0;
        self.publish("chargedEnergy", 0.0);

        st.connected_at = Some(self.clock.now());
        self.publish("connectedDuration", 0u64);

        st.soc_updated = None;

        // soc estimation restarts on car change
        if let Some(estimator) = st.estimator.as_mut() {
            estimator.reset();
        }

        // flush all cached driver values before reading state
        debug!(loadpoint = %self.title, "vehicle api refresh");
        self.cache_flush.flush();

        self.start_vehicle_detection(st);

        // immediately allow pv mode activity
        self.elapse_pv_timer(st);

        self.bus.publish(ChargeEvent::Connect);
        self.push_event(EventKind::Connect);
    }

    async fn on_vehicle_disconnect(&self, st: &mut LoopState) {
        info!(loadpoint = %self.title, "car disconnected");

        self.publish("chargedEnergy", st.charged_energy_wh);
        if let Some(connected_at) = st.connected_at {
            let connected = (self.clock.now() - connected_at).num_seconds().max(0);
            self.publish("connectedDuration", connected as u64);
        }

        self.bus.publish(ChargeEvent::Disconnect);
        self.push_event(EventKind::Disconnect);

        // remove the active vehicle when it was auto-detected
        if self.vehicles.len() > 1 {
            self.set_active_vehicle(st, None).await;
        }

        self.apply_action(self.on_disconnect);

        st.soc_updated = None;
    }

    fn on_charge_start(&self, st: &mut LoopState) {
        info!(loadpoint = %self.title, "start charging ->");
        st.soc_updated = None;
        self.bus.publish(ChargeEvent::Start);
        self.push_event(EventKind::Start);
    }

    fn on_charge_stop(&self, st: &mut LoopState) {
        info!(loadpoint = %self.title, "stop charging <-");
        st.soc_updated = None;
        self.bus.publish(ChargeEvent::Stop);
        self.push_event(EventKind::Stop);
    }

    /// Apply a configured mode/target override.
    fn apply_action(&self, action: ActionConfig) {
        if let Some(mode) = action.mode {
            self.set_mode(mode);
        }
        if let Some(target_soc) = action.target_soc {
            let _ = self.set_target_soc(target_soc);
        }
    }

    // --- vehicle ---------------------------------------------------------

    fn start_vehicle_detection(&self, st: &mut LoopState) {
        let now = self.clock.now();
        st.vehicle_detect_started = Some(now);
        st.vehicle_refresh_at = Some(now);
    }

    /// Read vehicle identification from the charger and run the matching
    /// action.
    async fn identify_vehicle(&self, st: &mut LoopState) {
        let Some(identifier) = self.charger.as_identifier() else {
            return;
        };

        let id = match with_timeout(self.op_timeout, identifier.identify()).await {
            Ok(id) => id,
            Err(e) => {
                error!(loadpoint = %self.title, error = %e, "charger vehicle id");
                return;
            }
        };

        if st.vehicle_id.as_deref() == Some(id.as_str()) {
            return;
        }

        // vehicle found or removed
        st.vehicle_id = Some(id.clone());
        debug!(loadpoint = %self.title, id = %id, "charger vehicle id");
        self.publish("vehicleIdentity", &id);

        if !id.is_empty() {
            if let Some(vehicle) = self.select_vehicle_by_id(&id).await {
                self.set_active_vehicle(st, Some(vehicle)).await;
            }

            if let Some(action) = self.on_identify.get(&id).copied() {
                debug!(loadpoint = %self.title, id = %id, "running vehicle action");
                self.apply_action(action);
            }
        }
    }

    /// Select a vehicle by identifier: exact match first, then `*`
    /// placeholders.
    async fn select_vehicle_by_id(&self, id: &str) -> Option<Arc<dyn Vehicle>> {
        // exact match
        for vehicle in &self.vehicles {
            if let Some(identify) = vehicle.as_identify() {
                if let Ok(vid) = identify.identify().await {
                    if vid == id {
                        return Some(Arc::clone(vehicle));
                    }
                }
            }
        }

        // placeholder match
        for vehicle in &self.vehicles {
            if let Some(identify) = vehicle.as_identify() {
                if let Ok(vid) = identify.identify().await {
                    if !vid.is_empty() && wildcard_match(&vid, id) {
                        return Some(Arc::clone(vehicle));
                    }
                }
            }
        }

        None
    }

    /// Assign the active vehicle and configure its soc estimator.
    async fn set_active_vehicle(&self, st: &mut LoopState, vehicle: Option<Arc<dyn Vehicle>>) {
        let prev = self.guarded.lock().vehicle.clone();

        match (&prev, &vehicle) {
            (None, None) => return,
            (Some(a), Some(b)) if Arc::ptr_eq(a, b) => return,
            _ => {}
        }

        let mut from = "unknown";
        if let Some(prev) = &prev {
            self.coordinator.release(prev);
            from = prev.title();
        }
        let mut to = "unknown";
        if let Some(vehicle) = &vehicle {
            self.coordinator.acquire(self.id, vehicle);
            to = vehicle.title();
        }
        info!(loadpoint = %self.title, from, to, "vehicle updated");

        self.guarded.lock().vehicle = vehicle.clone();

        if let Some(vehicle) = vehicle {
            st.estimator = Some(Estimator::new(vehicle.capacity_wh(), self.soc_cfg.estimate));

            self.publish("vehiclePresent", true);
            self.publish("vehicleTitle", vehicle.title());
            self.publish("vehicleCapacity", vehicle.capacity_wh());

            if let Some(odometer) = vehicle.as_odometer() {
                if let Ok(km) = odometer.odometer().await {
                    self.publish("vehicleOdometer", km);
                }
            }
        } else {
            st.estimator = None;

            self.publish("vehiclePresent", false);
            self.publish("vehicleTitle", "");
            self.publish("vehicleCapacity", 0.0);
            self.publish("vehicleOdometer", 0.0);
        }
    }

    /// True while the discovery window after connect is open for a
    /// multi-vehicle loadpoint. Requests periodic cache flushes while
    /// waiting.
    fn vehicle_unidentified(&self, st: &mut LoopState) -> bool {
        if self.vehicles.len() <= 1 {
            return false;
        }

        let now = self.clock.now();
        let within_window = st.vehicle_detect_started.is_some_and(|t| {
            now - t < chrono::Duration::seconds(VEHICLE_DETECT_DURATION_SECS)
        });

        if within_window {
            let refresh_due = st.vehicle_refresh_at.map_or(true, |t| {
                now - t >= chrono::Duration::seconds(VEHICLE_DETECT_INTERVAL_SECS)
            });
            if refresh_due {
                debug!(loadpoint = %self.title, "vehicle api refresh");
                self.cache_flush.flush();
                st.vehicle_refresh_at = Some(now);
            }
        }

        within_window
    }

    /// Validate the active vehicle by polling charge state across the
    /// available pool.
    async fn identify_vehicle_by_status(&self, st: &mut LoopState) {
        if self.vehicles.len() <= 1 {
            return;
        }

        if let Some(vehicle) = self
            .coordinator
            .identify_by_status(self.id, &self.vehicles)
            .await
        {
            self.set_active_vehicle(st, Some(vehicle)).await;
            return;
        }

        // remove the previous vehicle when its status was not confirmed
        let unconfirmed = self
            .guarded
            .lock()
            .vehicle
            .as_ref()
            .is_some_and(|v| v.as_charge_state().is_some());
        if unconfirmed {
            self.set_active_vehicle(st, None).await;
        }
    }

    // --- soc -------------------------------------------------------------

    fn target_soc_reached(&self, st: &LoopState) -> bool {
        let guarded = self.guarded.lock();
        guarded.vehicle.is_some()
            && guarded.target_soc > 0
            && guarded.target_soc < 100
            && st.vehicle_soc >= guarded.target_soc as f64
    }

    fn min_soc_not_reached(&self, st: &LoopState) -> bool {
        let guarded = self.guarded.lock();
        guarded.vehicle.is_some() && guarded.min_soc > 0 && st.vehicle_soc < guarded.min_soc as f64
    }

    fn remote_controlled(&self, demand: RemoteDemand) -> bool {
        self.guarded.lock().remote_demand == demand
    }

    /// True when the vehicle has an active climatisation request.
    async fn climate_active(&self) -> bool {
        let vehicle = self.guarded.lock().vehicle.clone();
        let Some(vehicle) = vehicle else {
            return false;
        };
        let Some(climater) = vehicle.as_climater() else {
            return false;
        };

        match climater.climater().await {
            Ok(state) => {
                debug!(
                    loadpoint = %self.title,
                    active = state.active,
                    target_temp = state.target_temp_c,
                    outside_temp = state.outside_temp_c,
                    "climater"
                );

                let status = if !state.active {
                    "off"
                } else if state.outside_temp_c < state.target_temp_c {
                    "heating"
                } else if state.outside_temp_c > state.target_temp_c {
                    "cooling"
                } else {
                    "on"
                };
                self.publish("climater", status);

                state.active
            }
            Err(e) => {
                if !e.is_not_available() {
                    error!(loadpoint = %self.title, error = %e, "climater");
                }
                false
            }
        }
    }

    /// Validate the charging state against the polling mode.
    fn soc_poll_allowed(&self, st: &LoopState) -> bool {
        let now = self.clock.now();
        let interval = self.soc_cfg.poll.interval;

        let elapsed_ok = st.soc_updated.map_or(true, |t| now - t >= interval);

        let honour_interval = self.soc_cfg.poll.mode == PollMode::Always
            || (self.soc_cfg.poll.mode == PollMode::Connected && self.connected());

        if honour_interval && !elapsed_ok {
            if let Some(t) = st.soc_updated {
                let remaining = interval - (now - t);
                debug!(
                    loadpoint = %self.title,
                    remaining_secs = remaining.num_seconds(),
                    "next soc poll"
                );
            }
        }

        self.charging()
            || honour_interval && elapsed_ok
            || self.connected() && st.soc_updated.is_none()
    }

    /// True when the charger can provide the vehicle's SoC itself.
    async fn soc_provided_by_charger(&self) -> bool {
        match self.charger.as_battery() {
            Some(battery) => battery.soc().await.is_ok(),
            None => false,
        }
    }

    /// Publish state of charge, remaining energy/duration and range.
    async fn publish_soc_and_range(&self, st: &mut LoopState) {
        if st.estimator.is_none() {
            return;
        }

        if self.soc_poll_allowed(st) || self.soc_provided_by_charger().await {
            st.soc_updated = Some(self.clock.now());

            let reading = self.read_vehicle_soc().await;
            let target_soc = self.target_soc();
            let charged_energy = st.charged_energy_wh;
            let charge_power = st.charge_power;

            let outcome = {
                let estimator = st.estimator.as_mut().expect("estimator present");
                estimator.update(reading, charged_energy).map(|soc| {
                    (
                        soc,
                        estimator.remaining_charge_duration(charge_power, target_soc),
                        estimator.remaining_charge_energy(target_soc),
                    )
                })
            };

            match outcome {
                Ok((soc, duration, energy)) => {
                    st.vehicle_soc = soc.trunc();
                    debug!(loadpoint = %self.title, soc = st.vehicle_soc, "vehicle soc");
                    self.publish("vehicleSoC", st.vehicle_soc);

                    if self.charging() {
                        self.set_remaining_duration(duration);
                    } else {
                        self.set_remaining_duration(None);
                    }

                    self.set_remaining_energy(energy);
                }
                Err(DeviceError::MustRetry) => {
                    // retry next tick
                    st.soc_updated = None;
                }
                Err(e) => error!(loadpoint = %self.title, error = %e, "vehicle soc"),
            }

            // range
            let vehicle = self.guarded.lock().vehicle.clone();
            if let Some(range) = vehicle.as_ref().and_then(|v| v.as_range()) {
                if let Ok(km) = range.range().await {
                    debug!(loadpoint = %self.title, range_km = km, "vehicle range");
                    self.publish("range", km);
                }
            }

            return;
        }

        // reset published values when unplugged in non-always mode
        if self.soc_cfg.poll.mode != PollMode::Always && !self.connected() {
            self.publish("vehicleSoC", -1);
            self.publish("chargeRemainingDuration", -1);
            self.publish("range", -1);
        }
    }

    /// Fetch the vehicle SoC, preferring the charger's pass-through.
    async fn read_vehicle_soc(&self) -> DeviceResult<f64> {
        if let Some(battery) = self.charger.as_battery() {
            match with_timeout(self.op_timeout, battery.soc()).await {
                Ok(soc) => return Ok(soc),
                Err(e) if e.is_not_available() => {}
                Err(e) => return Err(e),
            }
        }

        let vehicle = self.guarded.lock().vehicle.clone();
        match vehicle {
            Some(v) => with_timeout(self.op_timeout, v.soc()).await,
            None => Err(DeviceError::NotAvailable),
        }
    }

    // --- charger sync ----------------------------------------------------

    /// Reconcile the charger's enabled state with the expectation.
    async fn sync_charger(&self, st: &LoopState) {
        let res = with_timeout(self.op_timeout, self.charger.enabled()).await;

        match res {
            Ok(enabled) => {
                if enabled != st.enabled {
                    warn!(
                        loadpoint = %self.title,
                        expected = st.enabled,
                        actual = enabled,
                        "charger out of sync"
                    );
                    if let Err(e) = self.charger.enable(st.enabled).await {
                        error!(loadpoint = %self.title, error = %e, "charger");
                    }
                }

                if !enabled && self.charging() {
                    warn!(loadpoint = %self.title, "charger logic error: disabled but charging");
                }
            }
            Err(e) => error!(loadpoint = %self.title, error = %e, "charger"),
        }
    }

    // --- limit handling --------------------------------------------------

    /// Apply the charger current limit and enable/disable accordingly.
    /// Unless `force`, an enable-state change respects the guard duration.
    pub(crate) async fn set_limit(
        &self,
        st: &mut LoopState,
        mut current: f64,
        force: bool,
    ) -> DeviceResult<()> {
        let min_current = self.min_current();

        // set current
        if current != st.charge_current && current >= min_current {
            let res = if let Some(millis) = self.charger.as_current_millis() {
                millis.max_current_millis(current).await
            } else {
                current = current.trunc();
                self.charger.max_current(current as i64).await
            };

            match res {
                Ok(()) => {
                    st.charge_current = current;
                    debug!(loadpoint = %self.title, current, "max charge current");
                    self.publish_current_event(st);
                }
                Err(e) => {
                    return Err(DeviceError::Communication(format!(
                        "max charge current {current:.3}A: {e}"
                    )))
                }
            }
        }

        // set enabled/disabled
        let enabled = current >= min_current;
        if enabled != st.enabled {
            if !force {
                let now = self.clock.now();
                let elapsed = st
                    .guard_updated
                    .map_or(self.guard_duration, |t| now - t);
                if elapsed < self.guard_duration {
                    let remaining = (self.guard_duration - elapsed).num_seconds();
                    debug!(
                        loadpoint = %self.title,
                        enabled,
                        remaining_secs = remaining,
                        "contactor delay"
                    );
                    return Ok(());
                }
            }

            let vehicle = self.guarded.lock().vehicle.clone();

            // put the vehicle to sleep before opening the contactor
            if !enabled {
                if let Some(stop) = vehicle.as_ref().and_then(|v| v.as_stop_charge()) {
                    // log but don't propagate
                    if let Err(e) = stop.stop_charge().await {
                        error!(loadpoint = %self.title, error = %e, "vehicle remote charge stop");
                    }
                }
            }

            debug!(loadpoint = %self.title, enabled, "charger");
            match self.charger.enable(enabled).await {
                Ok(()) => {
                    st.enabled = enabled;
                    st.guard_updated = Some(self.clock.now());
                    if !enabled {
                        st.charge_current = 0.0;
                    }
                    self.publish_current_event(st);

                    // wake up the vehicle
                    if enabled {
                        if let Some(start) = vehicle.as_ref().and_then(|v| v.as_start_charge()) {
                            // log but don't propagate
                            if let Err(e) = start.start_charge().await {
                                error!(
                                    loadpoint = %self.title,
                                    error = %e,
                                    "vehicle remote charge start"
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    return Err(DeviceError::Communication(format!(
                        "charger {}: {e}",
                        if enabled { "enable" } else { "disable" }
                    )))
                }
            }
        }

        Ok(())
    }

    /// Currently effective charging current. Vehicles may draw less than
    /// commanded; the measured phase-1 current wins, capped 2 A above the
    /// commanded value.
    fn effective_current(&self, st: &LoopState) -> f64 {
        if let Some(currents) = st.charge_currents {
            return (currents[0] + 2.0).min(st.charge_current);
        }

        if !self.charging() {
            return 0.0;
        }

        st.charge_current
    }

    /// Put the PV enable/disable timer and the contactor guard into the
    /// elapsed state so the next decision can act immediately.
    pub(crate) fn elapse_pv_timer(&self, st: &mut LoopState) {
        let now = self.clock.now();
        st.pv_timer = Some(now - self.disable.delay);
        st.guard_updated = Some(now - self.guard_duration);
    }

    fn power_to_current(&self, power: f64, phases: u8) -> f64 {
        power / (self.voltage * phases as f64)
    }

    // --- phase scaling ---------------------------------------------------

    /// Switch the charger phase configuration, ignoring chargers without
    /// the capability.
    async fn scale_phases_if_available(&self, st: &mut LoopState, phases: u8) -> DeviceResult<()> {
        match self.scale_phases(st, phases).await {
            Err(e) if e.is_not_available() => Ok(()),
            res => res,
        }
    }

    /// Adjust the configured phase count. Disables the charger first, then
    /// commands the switch and resets the PV hysteresis.
    pub(crate) async fn scale_phases(&self, st: &mut LoopState, phases: u8) -> DeviceResult<()> {
        if phases != 1 && phases != 3 {
            return Err(DeviceError::Communication(format!(
                "invalid number of phases: {phases}"
            )));
        }

        let Some(switcher) = self.charger.as_phase_switcher() else {
            return Err(DeviceError::NotAvailable);
        };

        if self.phases() == phases {
            return Ok(());
        }

        // disable charger; this also stops the car via its api if possible
        self.set_limit(st, 0.0, true).await?;

        switcher
            .phases_1p3p(phases)
            .await
            .map_err(|e| DeviceError::Communication(format!("switch phases: {e}")))?;

        self.guarded.lock().phases = phases;
        self.publish("phases", phases);

        st.phase_timer = None;

        // allow pv mode to re-enable the charger right away
        self.elapse_pv_timer(st);

        Ok(())
    }

    /// Switch phases up or down based on available PV power; returns true
    /// when a switch occurred this cycle.
    pub(crate) async fn pv_scale_phases(
        &self,
        st: &mut LoopState,
        available_power: f64,
        min_current: f64,
    ) -> bool {
        let mut waiting = false;
        let now = self.clock.now();

        let phases = self.phases();
        let target_current = self.power_to_current(available_power, st.active_phases);

        if phases < st.active_phases {
            warn!(
                loadpoint = %self.title,
                active = st.active_phases,
                configured = phases,
                "invalid status: more phases active than configured"
            );
        }

        // scale down
        if target_current < min_current && phases > 1 && st.active_phases > 1 {
            debug!(
                loadpoint = %self.title,
                available_power,
                "available power below active-phase min threshold"
            );

            let started = *st.phase_timer.get_or_insert(now);
            let elapsed = now - started;

            if elapsed >= self.disable.delay {
                debug!(loadpoint = %self.title, "phase disable timer elapsed");
                match self.scale_phases(st, 1).await {
                    Ok(()) => {
                        // current detection will not see 1p while charging
                        // is disabled; assume it so pv mode can start
                        st.active_phases = 1;
                        self.publish("activePhases", st.active_phases);
                        return true;
                    }
                    Err(e) => error!(loadpoint = %self.title, error = %e, "switch phases"),
                }
            }

            waiting = true;
        }

        // scale up
        if self.power_to_current(available_power, 3) >= min_current && phases == 1 {
            debug!(
                loadpoint = %self.title,
                available_power,
                "available power above 3p min threshold"
            );

            let started = *st.phase_timer.get_or_insert(now);
            let elapsed = now - started;

            if elapsed >= self.enable.delay {
                debug!(loadpoint = %self.title, "phase enable timer elapsed");
                match self.scale_phases(st, 3).await {
                    Ok(()) => return true,
                    Err(e) => error!(loadpoint = %self.title, error = %e, "switch phases"),
                }
            }

            waiting = true;
        }

        // reset timer to disabled state
        if !waiting && st.phase_timer.is_some() {
            debug!(loadpoint = %self.title, "phase timer reset");
            st.phase_timer = None;
        }

        false
    }

    // --- pv --------------------------------------------------------------

    /// Maximum target current for PV and MinPV mode, applying phase
    /// scaling and the enable/disable hysteresis.
    pub(crate) async fn pv_max_current(
        &self,
        st: &mut LoopState,
        mode: ChargeMode,
        site_power: f64,
    ) -> f64 {
        // read only once
        let min_current = self.min_current();
        let max_current = self.max_current();
        let now = self.clock.now();

        // target current from delta power and the actual current
        let effective_current = self.effective_current(st);
        let delta_current = self.power_to_current(-site_power, st.active_phases);
        let target_current = (effective_current + delta_current).max(0.0);

        debug!(
            loadpoint = %self.title,
            target = target_current,
            effective = effective_current,
            delta = delta_current,
            site_power,
            phases = st.active_phases,
            "pv charge current"
        );

        // switch phases up/down
        if self.charger.as_phase_switcher().is_some() {
            let available_power = -site_power + st.charge_power;

            // in case of scaling, keep the charger disabled for this cycle
            if self.pv_scale_phases(st, available_power, min_current).await {
                return 0.0;
            }
        }

        // in MinPV mode return at least min_current
        if mode == ChargeMode::MinPv && target_current < min_current {
            return min_current;
        }

        if mode == ChargeMode::Pv && st.enabled && target_current < min_current {
            // kick off the disable sequence
            if site_power >= self.disable.threshold {
                debug!(
                    loadpoint = %self.title,
                    site_power,
                    threshold = self.disable.threshold,
                    "site power at or above disable threshold"
                );

                let started = *st.pv_timer.get_or_insert(now);
                let elapsed = now - started;

                if elapsed >= self.disable.delay {
                    debug!(loadpoint = %self.title, "pv disable timer elapsed");
                    return 0.0;
                }

                debug!(
                    loadpoint = %self.title,
                    remaining_secs = (self.disable.delay - elapsed).num_seconds(),
                    "pv disable timer remaining"
                );
            } else {
                // reset timer
                st.pv_timer = Some(now);
            }

            debug!(loadpoint = %self.title, "pv timer: keep enabled");
            return min_current;
        }

        if mode == ChargeMode::Pv && !st.enabled {
            // kick off the enable sequence
            let threshold = self.enable.threshold;
            if (threshold == 0.0 && target_current >= min_current)
                || (threshold != 0.0 && site_power <= threshold)
            {
                debug!(
                    loadpoint = %self.title,
                    site_power,
                    threshold,
                    "site power below enable threshold"
                );

                let started = *st.pv_timer.get_or_insert(now);
                let elapsed = now - started;

                if elapsed >= self.enable.delay {
                    debug!(loadpoint = %self.title, "pv enable timer elapsed");
                    return min_current;
                }

                debug!(
                    loadpoint = %self.title,
                    remaining_secs = (self.enable.delay - elapsed).num_seconds(),
                    "pv enable timer remaining"
                );
            } else {
                // reset timer
                st.pv_timer = Some(now);
            }

            debug!(loadpoint = %self.title, "pv timer: keep disabled");
            return 0.0;
        }

        // reset timer to disabled state
        if st.pv_timer.is_some() {
            debug!(loadpoint = %self.title, "pv timer reset");
            st.pv_timer = None;
        }

        // cap at the maximum current
        target_current.min(max_current)
    }

    // --- target time charging -------------------------------------------

    fn timer_context(&self) -> TimerContext<'_> {
        let guarded = self.guarded.lock();
        TimerContext {
            clock: self.clock.as_ref(),
            status: guarded.status,
            min_current: guarded.min_current,
            max_current: guarded.max_current,
            max_power: self.voltage * guarded.max_current * guarded.phases as f64,
        }
    }

    /// Sync the worker-side timer with the armed request and evaluate
    /// whether target charging must steer this cycle.
    fn target_time_demand_active(&self, st: &mut LoopState) -> bool {
        let (target_time, timer_soc, max_current) = {
            let guarded = self.guarded.lock();
            (guarded.target_time, guarded.timer_soc, guarded.max_current)
        };

        match target_time {
            Some(time) => st.soc_timer.set(time, timer_soc),
            None => {
                if st.soc_timer.target_time().is_some() {
                    st.soc_timer.reset(max_current);
                }
                return false;
            }
        }

        let active = {
            let ctx = self.timer_context();
            let LoopState {
                soc_timer,
                estimator,
                ..
            } = st;
            soc_timer.demand_active(&ctx, estimator.as_ref())
        };

        self.publish_timer_state(st);
        active
    }

    fn publish_timer_state(&self, st: &LoopState) {
        let now = self.clock.now();
        self.publish("timerSet", st.soc_timer.is_set(now));
        self.publish("timerActive", st.soc_timer.is_active());
        self.publish(
            "timerProjectedEnd",
            st.soc_timer.finish_at().map(|t| t.to_rfc3339()),
        );
    }

    /// Drop the target charging request once the target soc is reached.
    fn reset_soc_timer(&self, st: &mut LoopState) {
        let max_current = self.max_current();
        st.soc_timer.reset(max_current);

        let (target_soc, changed) = {
            let mut guarded = self.guarded.lock();
            let changed = guarded.target_time.is_some();
            guarded.target_time = None;
            (guarded.target_soc, changed)
        };

        if changed {
            self.publish("targetTime", json!(null));
            if let Some(store) = &self.settings_store {
                let _ = store.set(
                    self.id,
                    RuntimeSettings {
                        target_soc: Some(target_soc),
                        finish_at: None,
                    },
                );
            }
        }
    }

    // --- derived values --------------------------------------------------

    pub(crate) fn set_remaining_duration(&self, duration: Option<StdDuration>) {
        let changed = {
            let mut guarded = self.guarded.lock();
            let changed = guarded.remaining_duration != duration;
            guarded.remaining_duration = duration;
            changed
        };

        if changed {
            self.publish(
                "chargeRemainingDuration",
                duration.map_or(-1, |d| d.as_secs() as i64),
            );
        }
    }

    pub(crate) fn set_remaining_energy(&self, energy_wh: f64) {
        let changed = {
            let mut guarded = self.guarded.lock();
            let changed = guarded.remaining_energy_wh != energy_wh;
            guarded.remaining_energy_wh = energy_wh;
            changed
        };

        if changed {
            self.publish("chargeRemainingEnergy", energy_wh);
        }
    }
}
