use chrono::{DateTime, Utc};

/// Injectable wall-clock. All time reads in the control core go through
/// this trait so tests can step time deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually stepped clock for tests.
#[cfg(test)]
pub struct MockClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl MockClock {
    pub fn new() -> Self {
        // arbitrary fixed epoch so test output is stable
        let start = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Self {
            now: parking_lot::Mutex::new(start),
        }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.now.lock() = t;
    }

    pub fn advance(&self, d: chrono::Duration) {
        let mut now = self.now.lock();
        *now += d;
    }
}

#[cfg(test)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
