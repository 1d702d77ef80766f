#![allow(dead_code)]
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::Param;
use crate::clock::Clock;
use crate::controller::loadpoint::Loadpoint;
use crate::domain::{DeviceResult, Meter, Tariff};
use crate::util::with_timeout;

/// Site-wide properties exposed to external callers.
#[derive(Debug, Clone, Serialize)]
pub struct SiteProperties {
    pub title: String,
    pub voltage: f64,
    pub interval: StdDuration,
}

/// Aggregates the site meters, computes the residual power available to
/// the loadpoints and drives their update cycle.
pub struct Site {
    clock: Arc<dyn Clock>,
    properties: SiteProperties,
    op_timeout: StdDuration,

    grid_meter: Arc<dyn Meter>,
    pv_meter: Option<Arc<dyn Meter>>,
    battery_meter: Option<Arc<dyn Meter>>,
    aux_meters: Vec<Arc<dyn Meter>>,
    tariff: Option<Arc<dyn Tariff>>,

    loadpoints: Vec<Arc<Loadpoint>>,
    ui_tx: mpsc::UnboundedSender<Param>,

    /// Out-of-band update requests from loadpoints; capacity 1, coalescing.
    update_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,

    /// Home battery SoC floor below which PV surplus is withheld from the
    /// loadpoints; 0 disables.
    priority_soc: Mutex<f64>,
    last_tick: Mutex<Option<DateTime<Utc>>>,
}

pub struct SiteParams {
    pub clock: Arc<dyn Clock>,
    pub properties: SiteProperties,
    pub op_timeout: StdDuration,
    pub grid_meter: Arc<dyn Meter>,
    pub pv_meter: Option<Arc<dyn Meter>>,
    pub battery_meter: Option<Arc<dyn Meter>>,
    pub aux_meters: Vec<Arc<dyn Meter>>,
    pub tariff: Option<Arc<dyn Tariff>>,
    pub loadpoints: Vec<Arc<Loadpoint>>,
    pub ui_tx: mpsc::UnboundedSender<Param>,
    pub update_rx: mpsc::Receiver<()>,
    pub priority_soc: f64,
}

impl Site {
    pub fn new(params: SiteParams) -> Self {
        Self {
            clock: params.clock,
            properties: params.properties,
            op_timeout: params.op_timeout,
            grid_meter: params.grid_meter,
            pv_meter: params.pv_meter,
            battery_meter: params.battery_meter,
            aux_meters: params.aux_meters,
            tariff: params.tariff,
            loadpoints: params.loadpoints,
            ui_tx: params.ui_tx,
            update_rx: tokio::sync::Mutex::new(params.update_rx),
            priority_soc: Mutex::new(params.priority_soc),
            last_tick: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SiteProperties {
        &self.properties
    }

    pub fn loadpoints(&self) -> &[Arc<Loadpoint>] {
        &self.loadpoints
    }

    pub fn priority_soc(&self) -> f64 {
        *self.priority_soc.lock()
    }

    pub fn set_priority_soc(&self, soc: f64) {
        *self.priority_soc.lock() = soc.clamp(0.0, 100.0);
        self.publish("prioritySoC", soc);
    }

    /// Site health: the last tick completed within twice the tick
    /// interval.
    pub fn healthy(&self) -> bool {
        let last = *self.last_tick.lock();
        last.is_some_and(|t| {
            let elapsed = (self.clock.now() - t).to_std().unwrap_or(StdDuration::MAX);
            elapsed <= 2 * self.properties.interval
        })
    }

    fn publish(&self, key: &'static str, value: impl Serialize) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(_) => return,
        };
        let _ = self.ui_tx.send(Param {
            loadpoint: None,
            key,
            value,
        });
    }

    /// Tick loop: drives every loadpoint at the configured interval and
    /// whenever a loadpoint requests an out-of-band update.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut update_rx = self.update_rx.lock().await;
        let mut ticker = tokio::time::interval(self.properties.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("site loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
                Some(()) = update_rx.recv() => {
                    debug!("loadpoint requested update");
                }
            }

            self.update_all().await;
        }
    }

    /// One tick: compute site power and fan it out to all loadpoints in
    /// parallel, blocking until every loadpoint completed.
    pub async fn update_all(&self) {
        let site_power = match self.site_power().await {
            Ok(power) => power,
            Err(e) => {
                // only grid meter failures make the site unhealthy
                error!(error = %e, "grid meter");
                return;
            }
        };

        let cheap = match &self.tariff {
            Some(tariff) => tariff.is_cheap().await.unwrap_or(false),
            None => false,
        };

        join_all(
            self.loadpoints
                .iter()
                .map(|lp| lp.update(site_power, cheap)),
        )
        .await;

        *self.last_tick.lock() = Some(self.clock.now());
    }

    async fn read_optional(&self, meter: &Option<Arc<dyn Meter>>) -> Option<DeviceResult<f64>> {
        match meter {
            Some(m) => Some(with_timeout(self.op_timeout, m.current_power()).await),
            None => None,
        }
    }

    /// Residual site power in W seen by the loadpoints: grid import plus
    /// battery discharge plus aux consumers. Positive means the site draws
    /// from the grid; negative is surplus available for charging.
    pub async fn site_power(&self) -> DeviceResult<f64> {
        let (grid, pv, battery) = tokio::join!(
            with_timeout(self.op_timeout, self.grid_meter.current_power()),
            self.read_optional(&self.pv_meter),
            self.read_optional(&self.battery_meter),
        );

        let grid_power = grid?;
        self.publish("gridPower", grid_power);
        debug!(power = grid_power, "grid power");

        if let Some(res) = pv {
            match res {
                Ok(power) => self.publish("pvPower", power),
                Err(e) => error!(error = %e, "pv meter"),
            }
        }

        // battery meter: positive = discharge into the site
        let mut battery_power = 0.0;
        if let Some(res) = battery {
            match res {
                Ok(power) => {
                    battery_power = power;
                    self.publish("batteryPower", power);
                }
                Err(e) => error!(error = %e, "battery meter"),
            }
        }

        let aux_readings = join_all(
            self.aux_meters
                .iter()
                .map(|m| with_timeout(self.op_timeout, m.current_power())),
        )
        .await;

        let mut aux_power = 0.0;
        for res in aux_readings {
            match res {
                Ok(power) => aux_power += power,
                Err(e) => error!(error = %e, "aux meter"),
            }
        }

        let mut site_power = grid_power + battery_power + aux_power;

        // while the home battery is below its priority soc it gets the
        // surplus first
        let priority_soc = self.priority_soc();
        if priority_soc > 0.0 {
            if let Some(soc_reader) = self
                .battery_meter
                .as_ref()
                .and_then(|m| m.as_battery().map(|b| b.soc()))
            {
                match soc_reader.await {
                    Ok(soc) => {
                        self.publish("batterySoC", soc);
                        if soc < priority_soc && site_power < 0.0 {
                            debug!(soc, priority_soc, "battery below priority soc");
                            site_power = 0.0;
                        }
                    }
                    Err(e) => error!(error = %e, "battery soc"),
                }
            }
        }

        self.publish("sitePower", site_power);

        Ok(site_power)
    }
}
