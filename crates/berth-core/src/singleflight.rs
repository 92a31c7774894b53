use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;

use crate::models::{CoreError, CoreResult};

/// At most one in-flight computation per key; concurrent callers for the same
/// key wait for the leader and share its result.
pub struct SingleFlight<V> {
    calls: Mutex<HashMap<String, broadcast::Sender<CoreResult<V>>>>,
}

impl<V> Default for SingleFlight<V> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone + Send + 'static> SingleFlight<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut>(&self, key: &str, work: F) -> CoreResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<V>>,
    {
        let waiter = {
            let mut calls = self.lock_calls()?;
            match calls.get(key) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    calls.insert(key.to_string(), sender);
                    None
                }
            }
        };

        if let Some(mut receiver) = waiter {
            return receiver.recv().await.map_err(|_| {
                CoreError::internal(format!("single-flight leader for '{key}' went away"))
            })?;
        }

        let mut guard = FlightGuard {
            flights: self,
            key,
            finished: false,
        };
        let result = work().await;
        guard.finished = true;
        if let Some(sender) = self.lock_calls()?.remove(key) {
            let _ = sender.send(result.clone());
        }
        result
    }

    fn lock_calls(&self) -> CoreResult<MutexGuard<'_, HashMap<String, broadcast::Sender<CoreResult<V>>>>> {
        self.calls
            .lock()
            .map_err(|_| CoreError::internal("single-flight mutex poisoned"))
    }
}

/// Clears the key if the leader's future is dropped before it finishes, so
/// waiters see a closed channel instead of hanging.
struct FlightGuard<'a, V> {
    flights: &'a SingleFlight<V>,
    key: &'a str,
    finished: bool,
}

impl<V> Drop for FlightGuard<'_, V> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Ok(mut calls) = self.flights.calls.lock() {
            calls.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::SingleFlight;

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let flights = Arc::new(SingleFlight::<i64>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = flights.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run("cache:quota:project:1", || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(42));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn later_calls_recompute() {
        let flights = SingleFlight::<i64>::new();
        assert_eq!(flights.run("k", || async { Ok(1) }).await, Ok(1));
        assert_eq!(flights.run("k", || async { Ok(2) }).await, Ok(2));
    }
}
