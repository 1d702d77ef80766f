use std::future::Future;
use std::time::Duration;

use crate::domain::{DeviceError, DeviceResult};

/// Run a fallible async operation up to `attempts` times with exponential
/// back-off, returning the last error. `MustRetry` and `NotAvailable` are
/// surfaced immediately: the former defers to the next tick, the latter
/// will never succeed on retry.
pub async fn retry<T, F, Fut>(attempts: u32, base_delay: Duration, mut op: F) -> DeviceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DeviceResult<T>>,
{
    let mut delay = base_delay;
    let mut last = DeviceError::Communication("no attempts made".into());

    for attempt in 0..attempts.max(1) {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e @ (DeviceError::MustRetry | DeviceError::NotAvailable)) => return Err(e),
            Err(e) => last = e,
        }

        if attempt + 1 < attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    Err(last)
}

/// Bound an async device operation by a deadline, mapping elapse to
/// `DeviceError::Timeout`.
pub async fn with_timeout<T, Fut>(deadline: Duration, fut: Fut) -> DeviceResult<T>
where
    Fut: Future<Output = DeviceResult<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(DeviceError::Timeout(deadline)),
    }
}

/// Match `value` against `pattern` where `*` matches any run of characters.
/// Used for vehicle identifier placeholders like `WVWZZZ*`.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    fn inner(p: &[u8], v: &[u8]) -> bool {
        match p.first() {
            None => v.is_empty(),
            Some(b'*') => {
                // try every possible consumption of the star
                (0..=v.len()).any(|i| inner(&p[1..], &v[i..]))
            }
            Some(c) => v.first() == Some(c) && inner(&p[1..], &v[1..]),
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}
