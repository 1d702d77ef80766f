use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::domain::DeviceResult;

/// Invalidation service for cached driver values. One instance is
/// constructed at startup and shared by every cache; flushing bumps the
/// epoch so all caches refetch on next access. Emitted on vehicle connect
/// so the first identification reads fresh state.
#[derive(Debug, Default)]
pub struct CacheFlush {
    epoch: AtomicU64,
}

impl CacheFlush {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Invalidate every cache attached to this service.
    pub fn flush(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

struct Entry<T> {
    at: Instant,
    epoch: u64,
    value: T,
}

/// Per-call TTL cache for slow or rate-limited driver reads. Values expire
/// after `ttl` or when the flush service's epoch moves. Errors are never
/// cached.
pub struct Cached<T> {
    ttl: Duration,
    flush: Arc<CacheFlush>,
    entry: Mutex<Option<Entry<T>>>,
}

impl<T: Clone> Cached<T> {
    pub fn new(ttl: Duration, flush: Arc<CacheFlush>) -> Self {
        Self {
            ttl,
            flush,
            entry: Mutex::new(None),
        }
    }

    pub async fn get<F, Fut>(&self, fetch: F) -> DeviceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DeviceResult<T>>,
    {
        let mut entry = self.entry.lock().await;

        if let Some(e) = entry.as_ref() {
            if e.epoch == self.flush.epoch() && e.at.elapsed() < self.ttl {
                return Ok(e.value.clone());
            }
        }

        let value = fetch().await?;
        *entry = Some(Entry {
            at: Instant::now(),
            epoch: self.flush.epoch(),
            value: value.clone(),
        });

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn caches_within_ttl() {
        let flush = CacheFlush::new();
        let cache = Cached::new(Duration::from_secs(60), flush);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let v = cache
                .get(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(7) }
                })
                .await
                .unwrap();
            assert_eq!(v, 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn flush_invalidates() {
        let flush = CacheFlush::new();
        let cache = Cached::new(Duration::from_secs(60), Arc::clone(&flush));
        let calls = AtomicU32::new(0);

        let fetch = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(1) }
        };

        cache.get(fetch).await.unwrap();
        flush.flush();
        cache.get(fetch).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn errors_pass_through_uncached() {
        use crate::domain::DeviceError;

        let flush = CacheFlush::new();
        let cache: Cached<u32> = Cached::new(Duration::from_secs(60), flush);
        let res = cache.get(|| async { Err(DeviceError::MustRetry) }).await;
        assert!(matches!(res, Err(DeviceError::MustRetry)));

        // next call fetches again
        let v = cache.get(|| async { Ok(3) }).await.unwrap();
        assert_eq!(v, 3);
    }
}
