#![allow(dead_code)]
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::AppConfig;
use crate::domain::{Charger, Meter, Vehicle};
use crate::hardware::simulated::{SimulatedCharger, SimulatedMeter, SimulatedVehicle};
use crate::provider::CacheFlush;

/// Errors during device construction. These abort configuration.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("unknown {kind} reference: {name}")]
    UnknownRef { kind: &'static str, name: String },

    #[error("duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },

    #[error("sponsorship token required for charger {0}")]
    SponsorRequired(String),
}

/// Builds the configured device instances and resolves references by name.
pub struct DeviceFactory {
    meters: HashMap<String, Arc<SimulatedMeter>>,
    chargers: HashMap<String, Arc<SimulatedCharger>>,
    vehicles: HashMap<String, Arc<SimulatedVehicle>>,
}

impl DeviceFactory {
    pub fn from_config(config: &AppConfig, flush: Arc<CacheFlush>) -> Result<Self, SetupError> {
        let mut meters = HashMap::new();
        for meter_config in &config.meters {
            let prev = meters.insert(
                meter_config.name.clone(),
                SimulatedMeter::from_config(meter_config),
            );
            if prev.is_some() {
                return Err(SetupError::DuplicateName {
                    kind: "meter",
                    name: meter_config.name.clone(),
                });
            }
        }

        let mut chargers = HashMap::new();
        for charger_config in &config.chargers {
            if charger_config.requires_sponsor && config.site.sponsor_token.is_none() {
                return Err(SetupError::SponsorRequired(charger_config.name.clone()));
            }

            let prev = chargers.insert(
                charger_config.name.clone(),
                SimulatedCharger::from_config(charger_config, config.site.voltage),
            );
            if prev.is_some() {
                return Err(SetupError::DuplicateName {
                    kind: "charger",
                    name: charger_config.name.clone(),
                });
            }
        }

        let mut vehicles = HashMap::new();
        for vehicle_config in &config.vehicles {
            let prev = vehicles.insert(
                vehicle_config.name.clone(),
                SimulatedVehicle::from_config(vehicle_config, Arc::clone(&flush)),
            );
            if prev.is_some() {
                return Err(SetupError::DuplicateName {
                    kind: "vehicle",
                    name: vehicle_config.name.clone(),
                });
            }
        }

        info!(
            meters = meters.len(),
            chargers = chargers.len(),
            vehicles = vehicles.len(),
            "devices configured"
        );

        Ok(Self {
            meters,
            chargers,
            vehicles,
        })
    }

    pub fn meter(&self, name: &str) -> Result<Arc<dyn Meter>, SetupError> {
        self.meters
            .get(name)
            .map(|m| Arc::clone(m) as Arc<dyn Meter>)
            .ok_or_else(|| SetupError::UnknownRef {
                kind: "meter",
                name: name.to_string(),
            })
    }

    pub fn charger(&self, name: &str) -> Result<Arc<dyn Charger>, SetupError> {
        self.chargers
            .get(name)
            .map(|c| Arc::clone(c) as Arc<dyn Charger>)
            .ok_or_else(|| SetupError::UnknownRef {
                kind: "charger",
                name: name.to_string(),
            })
    }

    pub fn vehicle(&self, name: &str) -> Result<Arc<dyn Vehicle>, SetupError> {
        self.vehicles
            .get(name)
            .map(|v| Arc::clone(v) as Arc<dyn Vehicle>)
            .ok_or_else(|| SetupError::UnknownRef {
                kind: "vehicle",
                name: name.to_string(),
            })
    }

    /// Concrete simulated charger handle, for simulation drivers.
    pub fn simulated_charger(&self, name: &str) -> Option<Arc<SimulatedCharger>> {
        self.chargers.get(name).cloned()
    }
}
