/// Per-loadpoint value events. The synthetic charge meter, rater and timer
/// subscribe to these; there are no cross-loadpoint subscriptions.
#[derive(Debug, Clone, Copy)]
pub enum ChargeEvent {
    /// Charging cycle started (status went to C).
    Start,
    /// Charging cycle stopped (status left C).
    Stop,
    /// Vehicle connected.
    Connect,
    /// Vehicle disconnected.
    Disconnect,
    /// Commanded charge current changed. `charging` is true when the
    /// charger is enabled and in state C, so a synthetic meter can derive
    /// power without reaching back into the loadpoint.
    Current {
        amps: f64,
        active_phases: u8,
        charging: bool,
    },
    /// Measured charge power changed.
    Power { watts: f64 },
}

type Subscriber = Box<dyn Fn(&ChargeEvent) + Send + Sync>;

/// Typed in-process event hub. Subscribers are registered once during
/// loadpoint construction and invoked synchronously in registration order.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Subscriber>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, f: F)
    where
        F: Fn(&ChargeEvent) + Send + Sync + 'static,
    {
        self.subscribers.push(Box::new(f));
    }

    pub fn publish(&self, event: ChargeEvent) {
        for sub in &self.subscribers {
            sub(&event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
