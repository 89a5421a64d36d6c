//! A scope-keyed single-flight primitive: concurrent callers asking for the
//! same key coalesce into one in-flight future, per design note §9
//! ("a map of keys to futures, with the first arrival owning the
//! acquisition and latecomers awaiting its result").

use crate::error::ProxyError;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;

type SharedResult<V> = std::result::Result<V, Arc<ProxyError>>;
type InflightFuture<V> = Shared<BoxFuture<'static, SharedResult<V>>>;

pub struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, InflightFuture<V>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `fetch` for `key`. If another caller is already fetching the
    /// same key, await its result instead of issuing a second call.
    pub async fn run<F>(&self, key: K, fetch: F) -> Result<V, ProxyError>
    where
        F: std::future::Future<Output = Result<V, ProxyError>> + Send + 'static,
    {
        let (shared, is_owner) = {
            let mut inflight = self.inflight.lock().await;
            if let Some(existing) = inflight.get(&key) {
                (existing.clone(), false)
            } else {
                let boxed: BoxFuture<'static, SharedResult<V>> =
                    Box::pin(async move { fetch.await.map_err(Arc::new) });
                let shared = boxed.shared();
                inflight.insert(key.clone(), shared.clone());
                (shared, true)
            }
        };

        let result = shared.await;

        // Only the caller that inserted the entry removes it. A latecomer
        // removing it could evict a fresh in-flight future a later caller
        // started for the same key after the owner already removed it.
        if is_owner {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&key);
        }

        result.map_err(|arc_err| {
            Arc::try_unwrap(arc_err).unwrap_or_else(|arc_err| ProxyError::Internal(arc_err.to_string()))
        })
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn coalesces_concurrent_calls_for_the_same_key() {
        let single_flight: Arc<SingleFlight<String, u32>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let single_flight = single_flight.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                single_flight
                    .run("k".to_string(), async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let single_flight: SingleFlight<String, u32> = SingleFlight::new();

        let a = single_flight.run("a".to_string(), async { Ok(1) });
        let b = single_flight.run("b".to_string(), async { Ok(2) });

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 2);
    }

    #[tokio::test]
    async fn a_fresh_call_after_completion_runs_again() {
        let single_flight: SingleFlight<String, u32> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            single_flight
                .run("k".to_string(), async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
