#![allow(dead_code)]
use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::domain::{ChargeMode, PollMode};

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub site: SiteConfig,

    #[serde(default)]
    #[validate(nested)]
    pub push: PushConfig,

    #[serde(default)]
    #[validate(nested)]
    pub settings: SettingsConfig,

    #[serde(default)]
    pub tariff: Option<TariffConfig>,

    #[serde(default)]
    pub meters: Vec<MeterConfig>,

    pub chargers: Vec<ChargerConfig>,

    #[serde(default)]
    pub vehicles: Vec<VehicleConfig>,

    #[validate(length(min = 1), nested)]
    pub loadpoints: Vec<LoadpointConfig>,
}

/// Site-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SiteConfig {
    #[serde(default = "default_site_title")]
    pub title: String,

    /// Tick interval driving the loadpoint updates
    #[serde(default = "default_interval_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub interval_secs: u64,

    /// Per-operation driver deadline
    #[serde(default = "default_op_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub op_timeout_secs: u64,

    #[serde(default = "default_voltage")]
    #[validate(range(min = 100.0, max = 400.0))]
    pub voltage: f64,

    /// Grid meter reference (required, signed, import positive)
    #[validate(length(min = 1))]
    pub grid_meter: String,

    #[serde(default)]
    pub pv_meter: Option<String>,

    #[serde(default)]
    pub battery_meter: Option<String>,

    #[serde(default)]
    pub aux_meters: Vec<String>,

    /// Home battery SoC floor; PV surplus is withheld below it. 0 disables.
    #[serde(default)]
    #[validate(range(min = 0.0, max = 100.0))]
    pub battery_priority_soc: f64,

    #[serde(default)]
    pub sponsor_token: Option<String>,
}

/// Push notification configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PushConfig {
    /// Minimum interval between identical events
    #[serde(default = "default_push_interval_secs")]
    #[validate(range(min = 0, max = 3600))]
    pub min_interval_secs: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: default_push_interval_secs(),
        }
    }
}

/// Runtime settings persistence
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SettingsConfig {
    #[serde(default = "default_settings_file")]
    pub file: PathBuf,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            file: default_settings_file(),
        }
    }
}

/// Static cheap-tariff windows by hour of day
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TariffConfig {
    #[serde(default)]
    pub cheap_hours: Vec<u32>,
}

/// Simulated meter definition
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct MeterConfig {
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default)]
    pub power_w: f64,

    #[serde(default)]
    pub currents: Option<[f64; 3]>,

    #[serde(default)]
    pub soc: Option<f64>,

    #[serde(default)]
    pub energy_kwh: Option<f64>,
}

/// Simulated charger definition
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ChargerConfig {
    #[validate(length(min = 1))]
    pub name: String,

    /// Wired phases
    #[serde(default = "default_phases")]
    #[validate(range(min = 1, max = 3))]
    pub phases: u8,

    /// Charger has an integrated meter
    #[serde(default)]
    pub has_meter: bool,

    /// Supports 1p/3p switching
    #[serde(default)]
    pub phase_switch: bool,

    /// Supports millisecond current precision
    #[serde(default)]
    pub millis: bool,

    /// Fixed identifier reported for the connected vehicle
    #[serde(default)]
    pub identifier: Option<String>,

    /// Driver is gated behind sponsorship
    #[serde(default)]
    pub requires_sponsor: bool,
}

/// Simulated vehicle definition
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct VehicleConfig {
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default = "default_capacity_kwh")]
    #[validate(range(min = 1.0, max = 300.0))]
    pub capacity_kwh: f64,

    #[serde(default = "default_initial_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub soc: f64,

    /// Identifier for charger-side matching, `*` placeholders allowed
    #[serde(default)]
    pub identify: Option<String>,

    /// Vehicle reports its charge state (enables detection)
    #[serde(default)]
    pub charge_state: bool,

    /// Vehicle exposes a climater
    #[serde(default)]
    pub climate: bool,

    /// Driver response cache TTL
    #[serde(default = "default_vehicle_cache_ttl_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub cache_ttl_secs: u64,
}

/// PV hysteresis threshold
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Validate)]
pub struct ThresholdEntry {
    #[serde(default = "default_threshold_delay_secs")]
    #[validate(range(min = 0, max = 3600))]
    pub delay_secs: u64,

    /// Site power threshold in W
    #[serde(default)]
    pub threshold: f64,
}

impl Default for ThresholdEntry {
    fn default() -> Self {
        Self {
            delay_secs: default_threshold_delay_secs(),
            threshold: 0.0,
        }
    }
}

/// Vehicle SoC polling configuration
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct PollEntry {
    #[serde(default = "default_poll_mode")]
    pub mode: PollMode,

    #[serde(default = "default_poll_interval_minutes")]
    pub interval_minutes: u64,
}

impl Default for PollEntry {
    fn default() -> Self {
        Self {
            mode: default_poll_mode(),
            interval_minutes: default_poll_interval_minutes(),
        }
    }
}

/// Loadpoint SoC settings
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Validate)]
pub struct SocEntry {
    #[serde(default)]
    pub poll: PollEntry,

    #[serde(default = "default_estimate")]
    pub estimate: bool,

    #[serde(default)]
    #[validate(range(min = 0, max = 100))]
    pub min: u32,

    /// 0 falls back to the on-disconnect target, then 100
    #[serde(default)]
    #[validate(range(min = 0, max = 100))]
    pub target: u32,
}

impl Default for SocEntry {
    fn default() -> Self {
        Self {
            poll: PollEntry::default(),
            estimate: default_estimate(),
            min: 0,
            target: 0,
        }
    }
}

/// Action applied on disconnect or identification
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct ActionEntry {
    #[serde(default)]
    pub mode: Option<ChargeMode>,

    #[serde(default)]
    pub target_soc: Option<u32>,
}

/// Loadpoint definition
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_loadpoint_config"))]
pub struct LoadpointConfig {
    #[validate(length(min = 1))]
    pub title: String,

    #[validate(length(min = 1))]
    pub charger: String,

    #[serde(default)]
    pub charge_meter: Option<String>,

    #[serde(default)]
    pub vehicle: Option<String>,

    #[serde(default)]
    pub vehicles: Vec<String>,

    #[serde(default = "default_mode")]
    pub mode: ChargeMode,

    /// Charger-enabled phases
    #[serde(default = "default_phases")]
    pub phases: u8,

    #[serde(default = "default_min_current")]
    #[validate(range(min = 0.1, max = 64.0))]
    pub min_current: f64,

    #[serde(default = "default_max_current")]
    #[validate(range(min = 0.1, max = 64.0))]
    pub max_current: f64,

    /// Charger enable/disable minimum holding time
    #[serde(default = "default_guard_duration_secs")]
    #[validate(range(min = 0, max = 3600))]
    pub guard_duration_secs: u64,

    #[serde(default)]
    #[validate(nested)]
    pub enable: ThresholdEntry,

    #[serde(default)]
    #[validate(nested)]
    pub disable: ThresholdEntry,

    #[serde(default)]
    #[validate(nested)]
    pub soc: SocEntry,

    #[serde(default)]
    pub on_disconnect: ActionEntry,

    #[serde(default)]
    pub on_identify: HashMap<String, ActionEntry>,
}

fn validate_loadpoint_config(config: &LoadpointConfig) -> Result<(), validator::ValidationError> {
    if config.phases != 1 && config.phases != 3 {
        return Err(validator::ValidationError::new("phases must be 1 or 3"));
    }

    if config.vehicle.is_some() && !config.vehicles.is_empty() {
        return Err(validator::ValidationError::new(
            "vehicle and vehicles are mutually exclusive",
        ));
    }

    Ok(())
}

// Default value functions
fn default_site_title() -> String { "Home".to_string() }
fn default_interval_secs() -> u64 { 10 }
fn default_op_timeout_secs() -> u64 { 10 }
fn default_voltage() -> f64 { 230.0 }
fn default_push_interval_secs() -> u64 { 30 }
fn default_settings_file() -> PathBuf { PathBuf::from("runtime.json") }
fn default_phases() -> u8 { 3 }
fn default_capacity_kwh() -> f64 { 50.0 }
fn default_initial_soc() -> f64 { 50.0 }
fn default_vehicle_cache_ttl_secs() -> u64 { 15 }
fn default_threshold_delay_secs() -> u64 { 60 }
fn default_poll_mode() -> PollMode { PollMode::Charging }
fn default_poll_interval_minutes() -> u64 { 60 }
fn default_estimate() -> bool { true }
fn default_mode() -> ChargeMode { ChargeMode::Off }
fn default_min_current() -> f64 { 6.0 }
fn default_max_current() -> f64 { 16.0 }
fn default_guard_duration_secs() -> u64 { 300 }

impl AppConfig {
    /// Load configuration from TOML files and environment variables
    ///
    /// Configuration is loaded in this order (later overrides earlier):
    /// 1. config/default.toml (base configuration)
    /// 2. config/<environment>.toml when an environment is given
    /// 3. Environment variables with OCC__ prefix
    pub fn load() -> Result<Self> {
        Self::load_with_env(None)
    }

    /// Load configuration with a specific environment override
    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            let env_file = format!("config/{}.toml", env);
            figment = figment.merge(Toml::file(env_file));
        }

        // OCC__SITE__VOLTAGE -> site.voltage
        figment = figment.merge(Env::prefixed("OCC__").split("__"));

        let config: AppConfig = figment.extract().context("Failed to parse configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = Figment::new()
            .merge(Toml::string(toml_str))
            .extract()
            .context("Failed to parse configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [site]
        grid_meter = "grid"

        [[meters]]
        name = "grid"
        power_w = -500.0

        [[chargers]]
        name = "wallbox"

        [[loadpoints]]
        title = "Garage"
        charger = "wallbox"
    "#;

    #[test]
    fn minimal_config_applies_defaults() {
        let config = AppConfig::from_toml(MINIMAL).unwrap();

        assert_eq!(config.site.interval_secs, 10);
        assert_eq!(config.site.voltage, 230.0);

        let lp = &config.loadpoints[0];
        assert_eq!(lp.mode, ChargeMode::Off);
        assert_eq!(lp.min_current, 6.0);
        assert_eq!(lp.max_current, 16.0);
        assert_eq!(lp.phases, 3);
        assert_eq!(lp.guard_duration_secs, 300);
        assert_eq!(lp.enable.delay_secs, 60);
        assert_eq!(lp.soc.poll.mode, PollMode::Charging);
        assert_eq!(lp.soc.poll.interval_minutes, 60);
        assert!(lp.soc.estimate);
    }

    #[test]
    fn missing_loadpoints_is_rejected() {
        let toml = r#"
            [site]
            grid_meter = "grid"

            [[chargers]]
            name = "wallbox"
        "#;
        assert!(AppConfig::from_toml(toml).is_err());
    }

    #[test]
    fn invalid_phase_count_is_rejected() {
        let toml = r#"
            [site]
            grid_meter = "grid"

            [[chargers]]
            name = "wallbox"

            [[loadpoints]]
            title = "Garage"
            charger = "wallbox"
            phases = 2
        "#;
        assert!(AppConfig::from_toml(toml).is_err());
    }

    #[test]
    fn mode_and_poll_parse_from_strings() {
        let toml = r#"
            [site]
            grid_meter = "grid"

            [[chargers]]
            name = "wallbox"

            [[loadpoints]]
            title = "Garage"
            charger = "wallbox"
            mode = "pv"

            [loadpoints.soc]
            target = 80

            [loadpoints.soc.poll]
            mode = "connected"
            interval_minutes = 120
        "#;
        let config = AppConfig::from_toml(toml).unwrap();
        let lp = &config.loadpoints[0];
        assert_eq!(lp.mode, ChargeMode::Pv);
        assert_eq!(lp.soc.target, 80);
        assert_eq!(lp.soc.poll.mode, PollMode::Connected);
        assert_eq!(lp.soc.poll.interval_minutes, 120);
    }

    #[test]
    fn conflicting_vehicle_references_are_rejected() {
        let toml = r#"
            [site]
            grid_meter = "grid"

            [[chargers]]
            name = "wallbox"

            [[vehicles]]
            name = "ev"

            [[loadpoints]]
            title = "Garage"
            charger = "wallbox"
            vehicle = "ev"
            vehicles = ["ev"]
        "#;
        assert!(AppConfig::from_toml(toml).is_err());
    }
}
