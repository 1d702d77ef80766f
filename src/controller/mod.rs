pub mod api;
pub mod coordinator;
pub mod loadpoint;
pub mod site;
pub mod wrapper;

pub use coordinator::Coordinator;
pub use loadpoint::{
    ActionConfig, Loadpoint, LoadpointParams, PollConfig, SocConfig, ThresholdConfig,
};
pub use site::{Site, SiteParams, SiteProperties};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cache::{Param, ParamCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{AppConfig, LoadpointConfig};
use crate::domain::{Meter, PollMode, Tariff, Vehicle};
use crate::hardware::{DeviceFactory, ScheduledTariff};
use crate::provider::CacheFlush;
use crate::push::{Hub, LogSender, PushEvent};
use crate::settings::SettingsStore;

use self::loadpoint::POLL_INTERVAL;

/// Fully assembled controller: site, loadpoints and the supporting
/// services, plus the channel consumers waiting to be spawned.
pub struct AppState {
    pub site: Arc<Site>,
    pub cache: Arc<ParamCache>,

    hub: Option<Hub>,
    ui_rx: Option<mpsc::UnboundedReceiver<Param>>,
    push_rx: Option<mpsc::UnboundedReceiver<PushEvent>>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        // out-of-band update requests coalesce: capacity 1, latest wins
        let (update_tx, update_rx) = mpsc::channel(1);

        let cache = Arc::new(ParamCache::new());
        let cache_flush = CacheFlush::new();
        let coordinator = Arc::new(Coordinator::new());

        let settings =
            Arc::new(SettingsStore::load(&config.settings.file).context("load runtime settings")?);

        let factory =
            DeviceFactory::from_config(&config, Arc::clone(&cache_flush)).context("devices")?;

        let mut hub = Hub::new(
            Arc::clone(&clock),
            StdDuration::from_secs(config.push.min_interval_secs),
        );
        hub.add(Box::new(LogSender));

        let op_timeout = StdDuration::from_secs(config.site.op_timeout_secs);

        let mut loadpoints = Vec::new();
        for (id, lp_config) in config.loadpoints.iter().enumerate() {
            let lp = build_loadpoint(
                id,
                lp_config,
                &config,
                &factory,
                Arc::clone(&clock),
                Arc::clone(&coordinator),
                Arc::clone(&cache_flush),
                Arc::clone(&settings),
                ui_tx.clone(),
                push_tx.clone(),
                update_tx.clone(),
                op_timeout,
            )?;
            loadpoints.push(Arc::new(lp));
        }

        for lp in &loadpoints {
            lp.prepare().await;
        }

        let tariff = config.tariff.as_ref().map(|t| {
            Arc::new(ScheduledTariff::new(
                Arc::clone(&clock),
                t.cheap_hours.clone(),
            )) as Arc<dyn Tariff>
        });

        let aux_meters = config
            .site
            .aux_meters
            .iter()
            .map(|name| factory.meter(name))
            .collect::<Result<Vec<_>, _>>()
            .context("aux meters")?;

        let site = Arc::new(Site::new(SiteParams {
            clock,
            properties: SiteProperties {
                title: config.site.title.clone(),
                voltage: config.site.voltage,
                interval: StdDuration::from_secs(config.site.interval_secs),
            },
            op_timeout,
            grid_meter: factory
                .meter(&config.site.grid_meter)
                .context("grid meter")?,
            pv_meter: optional_meter(&factory, &config.site.pv_meter)?,
            battery_meter: optional_meter(&factory, &config.site.battery_meter)?,
            aux_meters,
            tariff,
            loadpoints,
            ui_tx,
            update_rx,
            priority_soc: config.site.battery_priority_soc,
        }));

        Ok(Self {
            site,
            cache,
            hub: Some(hub),
            ui_rx: Some(ui_rx),
            push_rx: Some(push_rx),
        })
    }

    /// Spawn the background tasks: the param cache, the push hub and the
    /// site tick loop. The channel tasks drain and exit once all senders
    /// are gone, which happens after the site loop has stopped.
    pub fn spawn_tasks(&mut self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let (Some(hub), Some(push_rx)) = (self.hub.take(), self.push_rx.take()) {
            handles.push(tokio::spawn(hub.run(push_rx)));
        }

        if let Some(ui_rx) = self.ui_rx.take() {
            handles.push(tokio::spawn(Arc::clone(&self.cache).run(ui_rx)));
        }

        handles.push(tokio::spawn(
            Arc::clone(&self.site).run(cancel.child_token()),
        ));

        handles
    }
}

fn optional_meter(
    factory: &DeviceFactory,
    name: &Option<String>,
) -> Result<Option<Arc<dyn Meter>>> {
    match name {
        Some(name) => Ok(Some(factory.meter(name)?)),
        None => Ok(None),
    }
}

/// Build one loadpoint from configuration, applying defaults and logging
/// configuration smells.
#[allow(clippy::too_many_arguments)]
fn build_loadpoint(
    id: usize,
    lp_config: &LoadpointConfig,
    config: &AppConfig,
    factory: &DeviceFactory,
    clock: Arc<dyn Clock>,
    coordinator: Arc<Coordinator>,
    cache_flush: Arc<CacheFlush>,
    settings: Arc<SettingsStore>,
    ui_tx: mpsc::UnboundedSender<Param>,
    push_tx: mpsc::UnboundedSender<PushEvent>,
    update_tx: mpsc::Sender<()>,
    op_timeout: StdDuration,
) -> Result<Loadpoint> {
    let title = &lp_config.title;

    // vehicle polling mode
    let poll_mode = lp_config.soc.poll.mode;
    if matches!(poll_mode, PollMode::Connected | PollMode::Always) {
        warn!(
            loadpoint = %title,
            mode = %poll_mode,
            "poll mode may deplete your battery or lead to api misuse"
        );
    }

    // vehicle polling interval, floored at one hour
    let mut poll_interval = StdDuration::from_secs(60 * lp_config.soc.poll.interval_minutes);
    if poll_interval < POLL_INTERVAL {
        if poll_interval.is_zero() {
            poll_interval = POLL_INTERVAL;
        } else {
            warn!(
                loadpoint = %title,
                interval_minutes = lp_config.soc.poll.interval_minutes,
                "poll interval below one hour may deplete your battery or lead to api misuse"
            );
        }
    }

    // use the disconnect value as default target soc
    let mut target_soc = lp_config.soc.target;
    if target_soc == 0 {
        target_soc = lp_config.on_disconnect.target_soc.unwrap_or(0);
        if target_soc == 0 {
            target_soc = 100;
        }
    }

    if lp_config.min_current == 0.0 {
        warn!(loadpoint = %title, "minCurrent must not be zero");
    }
    if lp_config.max_current <= lp_config.min_current {
        warn!(loadpoint = %title, "maxCurrent must be larger than minCurrent");
    }

    if lp_config.enable.threshold > lp_config.disable.threshold {
        warn!(
            loadpoint = %title,
            enable = lp_config.enable.threshold,
            disable = lp_config.disable.threshold,
            "pv mode enable threshold is larger than disable threshold"
        );
    } else if lp_config.enable.threshold > 0.0 {
        warn!(
            loadpoint = %title,
            threshold = lp_config.enable.threshold,
            "positive pv mode enable threshold starts charging on grid consumption"
        );
    }

    let charger = factory.charger(&lp_config.charger).context("charger")?;

    let charge_meter = match &lp_config.charge_meter {
        Some(name) => Some(factory.meter(name).context("charge meter")?),
        None => None,
    };

    let mut vehicles: Vec<Arc<dyn Vehicle>> = Vec::new();
    for name in &lp_config.vehicles {
        vehicles.push(factory.vehicle(name).context("vehicle")?);
    }
    if let Some(name) = &lp_config.vehicle {
        vehicles.push(factory.vehicle(name).context("vehicle")?);
    }

    let on_identify = lp_config
        .on_identify
        .iter()
        .map(|(id, action)| {
            (
                id.clone(),
                ActionConfig {
                    mode: action.mode,
                    target_soc: action.target_soc,
                },
            )
        })
        .collect::<HashMap<_, _>>();

    Ok(Loadpoint::new(LoadpointParams {
        id,
        title: lp_config.title.clone(),
        clock,
        charger,
        charge_meter,
        vehicles,
        coordinator,
        cache_flush,
        settings: Some(settings),
        ui_tx,
        push_tx,
        update_tx: Some(update_tx),
        voltage: config.site.voltage,
        op_timeout,
        mode: lp_config.mode,
        phases: lp_config.phases,
        min_current: lp_config.min_current,
        max_current: lp_config.max_current,
        guard_duration: chrono::Duration::seconds(lp_config.guard_duration_secs as i64),
        enable: ThresholdConfig {
            delay: chrono::Duration::seconds(lp_config.enable.delay_secs as i64),
            threshold: lp_config.enable.threshold,
        },
        disable: ThresholdConfig {
            delay: chrono::Duration::seconds(lp_config.disable.delay_secs as i64),
            threshold: lp_config.disable.threshold,
        },
        soc: SocConfig {
            poll: PollConfig {
                mode: poll_mode,
                interval: chrono::Duration::from_std(poll_interval)
                    .unwrap_or_else(|_| chrono::Duration::hours(1)),
            },
            estimate: lp_config.soc.estimate,
            min: lp_config.soc.min,
            target: target_soc,
        },
        on_disconnect: ActionConfig {
            mode: lp_config.on_disconnect.mode,
            target_soc: lp_config.on_disconnect.target_soc,
        },
        on_identify,
    }))
}
