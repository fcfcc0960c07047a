use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::Scheduler;

pub(crate) type Joined<V> = Shared<BoxFuture<'static, V>>;

struct Flight<V: Clone> {
    future: Joined<V>,
    done: Arc<AtomicBool>,
}

/// Marks its flight finished when the spawned work ends, even by panic or abort.
struct DoneGuard(Arc<AtomicBool>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Coalesces concurrent operations with the same key into one execution.
///
/// The work runs on a [`Scheduler`] task, so it completes even when every
/// caller stops waiting. Each caller gets a clone of the one outcome.
pub(crate) struct SingleFlight<K, V: Clone> {
    flights: Mutex<HashMap<K, Flight<V>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Joins the unfinished flight for `key`, or spawns `work` as a new one.
    ///
    /// `interrupted` supplies the outcome when the spawned task dies before
    /// producing a value.
    pub(crate) fn join_or_start<F>(
        &self,
        key: K,
        scheduler: &Scheduler,
        work: F,
        interrupted: fn() -> V,
    ) -> Joined<V>
    where
        F: Future<Output = V> + Send + 'static,
    {
        let mut flights = self.flights.lock();
        if let Some(flight) = flights.get(&key) {
            if !flight.done.load(Ordering::Acquire) {
                return flight.future.clone();
            }
        }
        flights.retain(|_, flight| !flight.done.load(Ordering::Acquire));

        let done = Arc::new(AtomicBool::new(false));
        let guard = DoneGuard(Arc::clone(&done));
        let task = scheduler.spawn(async move {
            let _guard = guard;
            work.await
        });
        let future = async move { task.await.unwrap_or_else(|_| interrupted()) }
            .boxed()
            .shared();

        flights.insert(
            key,
            Flight {
                future: future.clone(),
                done,
            },
        );
        future
    }

    pub(crate) fn is_in_flight(&self, key: &K) -> bool {
        self.flights
            .lock()
            .get(key)
            .is_some_and(|flight| !flight.done.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::SingleFlight;
    use crate::Scheduler;

    fn failed() -> Result<u32, String> {
        Err("interrupted".to_owned())
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flights: Arc<SingleFlight<&'static str, Result<u32, String>>> =
            Arc::new(SingleFlight::new());
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        let mut joined = Vec::new();
        for _ in 0..8 {
            let runs = Arc::clone(&runs);
            let gate = Arc::clone(&gate);
            joined.push(flights.join_or_start(
                "refresh",
                &scheduler,
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok(42)
                },
                failed,
            ));
        }

        assert!(flights.is_in_flight(&"refresh"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_waiters();

        for future in joined {
            assert_eq!(future.await, Ok(42));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finished_flight_is_replaced() {
        let flights: SingleFlight<u8, Result<u32, String>> = SingleFlight::new();
        let scheduler = Scheduler::new();

        let first = flights.join_or_start(1, &scheduler, async { Ok(1) }, failed).await;
        tokio::task::yield_now().await;
        assert!(!flights.is_in_flight(&1));

        let second = flights.join_or_start(1, &scheduler, async { Ok(2) }, failed).await;
        assert_eq!((first, second), (Ok(1), Ok(2)));
    }

    #[tokio::test]
    async fn panicking_work_resolves_to_interrupted() {
        let flights: SingleFlight<u8, Result<u32, String>> = SingleFlight::new();
        let scheduler = Scheduler::new();

        let explode = true;
        let outcome = flights
            .join_or_start(
                1,
                &scheduler,
                async move {
                    if explode {
                        panic!("identity provider exploded");
                    }
                    Ok(0)
                },
                failed,
            )
            .await;

        assert_eq!(outcome, Err("interrupted".to_owned()));
        assert!(!flights.is_in_flight(&1));
    }
}
