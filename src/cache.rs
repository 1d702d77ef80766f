#![allow(dead_code)]
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// A single published telemetry value.
#[derive(Debug, Clone)]
pub struct Param {
    /// Loadpoint id, or `None` for site-level values.
    pub loadpoint: Option<usize>,
    pub key: &'static str,
    pub value: Value,
}

/// Outbound telemetry cache. Holds the last value per key and suppresses
/// republication of unchanged values so downstream consumers only see
/// deltas.
#[derive(Default)]
pub struct ParamCache {
    values: Mutex<HashMap<(Option<usize>, &'static str), Value>>,
}

impl ParamCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `param`; returns true when the value changed.
    pub fn update(&self, param: &Param) -> bool {
        let mut values = self.values.lock();
        match values.get(&(param.loadpoint, param.key)) {
            Some(prev) if *prev == param.value => false,
            _ => {
                values.insert((param.loadpoint, param.key), param.value.clone());
                true
            }
        }
    }

    pub fn get(&self, loadpoint: Option<usize>, key: &'static str) -> Option<Value> {
        self.values.lock().get(&(loadpoint, key)).cloned()
    }

    /// Snapshot of all current values.
    pub fn all(&self) -> Vec<Param> {
        self.values
            .lock()
            .iter()
            .map(|((loadpoint, key), value)| Param {
                loadpoint: *loadpoint,
                key,
                value: value.clone(),
            })
            .collect()
    }

    /// Drain the param channel into the cache, logging deltas.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Param>) {
        while let Some(param) = rx.recv().await {
            if self.update(&param) {
                debug!(loadpoint = ?param.loadpoint, key = param.key, value = %param.value, "publish");
            }
        }
    }
}
