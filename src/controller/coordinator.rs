use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::domain::{ChargeStatus, Vehicle};

/// Stable identity for a shared vehicle instance. The coordinator keeps a
/// weak owner-by-identity association without holding the vehicle itself.
fn vehicle_key(vehicle: &Arc<dyn Vehicle>) -> usize {
    Arc::as_ptr(vehicle) as *const () as usize
}

/// Arbitrates which loadpoint owns which vehicle when several loadpoints
/// share a vehicle pool. Ownership is advisory: it scopes identification,
/// not control.
#[derive(Default)]
pub struct Coordinator {
    tracked: Mutex<HashMap<usize, usize>>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, owner: usize, vehicle: &Arc<dyn Vehicle>) {
        self.tracked.lock().insert(vehicle_key(vehicle), owner);
    }

    pub fn release(&self, vehicle: &Arc<dyn Vehicle>) {
        self.tracked.lock().remove(&vehicle_key(vehicle));
    }

    /// Vehicles from `pool` that expose charge-state reads and are either
    /// unowned or owned by `owner`.
    pub fn available_vehicles(
        &self,
        owner: usize,
        pool: &[Arc<dyn Vehicle>],
    ) -> Vec<Arc<dyn Vehicle>> {
        let tracked = self.tracked.lock();

        pool.iter()
            .filter(|v| v.as_charge_state().is_some())
            .filter(|v| match tracked.get(&vehicle_key(v)) {
                None => true,
                Some(o) => *o == owner,
            })
            .cloned()
            .collect()
    }

    /// Poll the available vehicles' charge state; a single vehicle in
    /// state B or C wins. Zero or multiple matches return `None` and the
    /// caller keeps its previous assignment.
    pub async fn identify_by_status(
        &self,
        owner: usize,
        pool: &[Arc<dyn Vehicle>],
    ) -> Option<Arc<dyn Vehicle>> {
        let mut found: Option<Arc<dyn Vehicle>> = None;

        for vehicle in self.available_vehicles(owner, pool) {
            let Some(state) = vehicle.as_charge_state() else {
                continue;
            };

            let status = match state.status().await {
                Ok(s) => s,
                Err(e) => {
                    error!(vehicle = vehicle.title(), error = %e, "vehicle status");
                    continue;
                }
            };

            debug!(vehicle = vehicle.title(), status = %status, "vehicle status");

            if matches!(status, ChargeStatus::Connected | ChargeStatus::Charging) {
                if found.is_some() {
                    debug!("vehicle status: >1 matches, giving up");
                    return None;
                }
                found = Some(vehicle);
            }
        }

        found
    }
}
