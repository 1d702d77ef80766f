#![allow(dead_code)]
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use strum_macros::Display;
use tokio::sync::mpsc;
use tracing::info;

use crate::clock::Clock;

/// Lifecycle event kinds surfaced to notification senders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Start,
    Stop,
    Connect,
    Disconnect,
}

/// A notification event.
#[derive(Debug, Clone, Copy)]
pub struct PushEvent {
    /// Originating loadpoint, if any.
    pub loadpoint: Option<usize>,
    pub kind: EventKind,
}

/// Notification sender. Message templating is a separate concern; senders
/// receive the raw event.
pub trait Sender: Send + Sync {
    fn send(&self, event: &PushEvent);
}

/// Sender that logs events, used when no external sender is configured.
pub struct LogSender;

impl Sender for LogSender {
    fn send(&self, event: &PushEvent) {
        info!(loadpoint = ?event.loadpoint, kind = %event.kind, "push event");
    }
}

/// Push hub: receives events from loadpoints and fans them out to senders,
/// dropping repeats of the same event within `min_interval`.
pub struct Hub {
    clock: Arc<dyn Clock>,
    min_interval: Duration,
    senders: Vec<Box<dyn Sender>>,
    last_sent: Mutex<HashMap<(Option<usize>, EventKind), DateTime<Utc>>>,
}

impl Hub {
    pub fn new(clock: Arc<dyn Clock>, min_interval: Duration) -> Self {
        Self {
            clock,
            min_interval,
            senders: Vec::new(),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&mut self, sender: Box<dyn Sender>) {
        self.senders.push(sender);
    }

    /// Returns true when the event passed rate limiting and was delivered.
    pub fn dispatch(&self, event: &PushEvent) -> bool {
        let now = self.clock.now();
        let key = (event.loadpoint, event.kind);

        {
            let mut last_sent = self.last_sent.lock();
            if let Some(last) = last_sent.get(&key) {
                if (now - *last).to_std().unwrap_or_default() < self.min_interval {
                    return false;
                }
            }
            last_sent.insert(key, now);
        }

        for sender in &self.senders {
            sender.send(event);
        }
        true
    }

    /// Main publishing loop.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<PushEvent>) {
        while let Some(event) = rx.recv().await {
            self.dispatch(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn hub_with_mock() -> (Hub, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new());
        let mut hub = Hub::new(clock.clone(), Duration::from_secs(30));
        hub.add(Box::new(LogSender));
        (hub, clock)
    }

    #[test]
    fn repeats_within_interval_are_dropped() {
        let (hub, clock) = hub_with_mock();
        let ev = PushEvent {
            loadpoint: Some(0),
            kind: EventKind::Start,
        };

        assert!(hub.dispatch(&ev));
        assert!(!hub.dispatch(&ev));

        clock.advance(chrono::Duration::seconds(31));
        assert!(hub.dispatch(&ev));
    }

    #[test]
    fn distinct_kinds_are_not_rate_limited_together() {
        let (hub, _clock) = hub_with_mock();

        assert!(hub.dispatch(&PushEvent {
            loadpoint: Some(0),
            kind: EventKind::Connect,
        }));
        assert!(hub.dispatch(&PushEvent {
            loadpoint: Some(0),
            kind: EventKind::Start,
        }));
        assert!(hub.dispatch(&PushEvent {
            loadpoint: Some(1),
            kind: EventKind::Start,
        }));
    }
}
