//! Request coalescing: at most one in-flight computation per key.
//!
//! The first caller for a key becomes the *leader* and runs its computation
//! on its own task. Callers arriving while it runs become *waiters* and
//! receive a clone of the leader's result instead of running anything.
//!
//! Per key the registry moves `Absent → InFlight → Absent`; the completed
//! value is published on the flight's watch channel before the entry is
//! removed, so a caller that finds the entry in that window still gets the
//! finished value.

use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::error::CoalesceError;

/// The value a caller of [`Coalescer::execute`] ended up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coalesced<T> {
    pub value: T,
    /// `true` when another caller's computation produced `value`.
    pub shared: bool,
}

struct Flight<T> {
    id: u64,
    started: Instant,
    result: watch::Receiver<Option<T>>,
}

enum Role<T> {
    Leader { id: u64, publish: watch::Sender<Option<T>> },
    Waiter(watch::Receiver<Option<T>>),
}

// Removes the leader's registration when the leader finishes, is dropped, or
// unwinds, unless a newer flight has taken the key over.
struct Registration<'a, T> {
    flights: &'a DashMap<String, Flight<T>>,
    key: &'a str,
    id: u64,
}

impl<T> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        let id = self.id;
        if self.flights.remove_if(self.key, |_, flight| flight.id == id).is_some() {
            trace!(key = %self.key, "in-flight computation deregistered");
        }
    }
}

/// The in-flight registry.
///
/// # Examples
///
/// ```
/// use pagecache::cache::Coalescer;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let coalescer: Coalescer<u32> = Coalescer::new();
/// let cancel = CancellationToken::new();
/// let outcome = coalescer.execute("answer", &cancel, || async { 42 }).await.unwrap();
/// assert_eq!(outcome.value, 42);
/// assert!(!outcome.shared);
/// assert_eq!(coalescer.in_flight(), 0);
/// # }
/// ```
pub struct Coalescer<T> {
    flights: DashMap<String, Flight<T>>,
    forget_after: Option<Duration>,
    next_id: AtomicU64,
}

impl<T> Default for Coalescer<T>
where
    T: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Coalescer<T>
where
    T: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self {
            flights: DashMap::new(),
            forget_after: None,
            next_id: AtomicU64::new(0),
        }
    }

    /// After `timeout`, a still-running flight stops accepting new waiters:
    /// the next caller for its key starts a fresh computation. Callers
    /// already waiting keep waiting for the original result.
    #[must_use]
    pub fn forget_after(mut self, timeout: Duration) -> Self {
        self.forget_after = Some(timeout);
        self
    }

    /// Number of keys with a registered computation.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Runs `computation` for `key` unless one is already in flight, in
    /// which case waits for that one's result.
    ///
    /// `cancel` only affects this caller while it waits: the in-flight
    /// computation and its other waiters are untouched. A leader is never
    /// interrupted by the token.
    ///
    /// # Errors
    ///
    /// - [`CoalesceError::Cancelled`] — `cancel` fired while waiting.
    /// - [`CoalesceError::Abandoned`] — the leader was dropped or panicked
    ///   before publishing a result.
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        computation: F,
    ) -> Result<Coalesced<T>, CoalesceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.join(key) {
            Role::Waiter(result) => Self::wait(result, cancel).await,
            Role::Leader { id, publish } => {
                let registration = Registration {
                    flights: &self.flights,
                    key,
                    id,
                };
                let value = computation().await;
                publish.send_replace(Some(value.clone()));
                drop(registration);
                Ok(Coalesced {
                    value,
                    shared: false,
                })
            }
        }
    }

    fn join(&self, key: &str) -> Role<T> {
        let now = Instant::now();
        match self.flights.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if !self.is_forgotten(occupied.get(), now) {
                    return Role::Waiter(occupied.get().result.clone());
                }
                trace!(key, "forget timeout elapsed, starting a fresh computation");
                let (flight, publish) = self.start(now);
                let id = flight.id;
                occupied.insert(flight);
                Role::Leader { id, publish }
            }
            Entry::Vacant(vacant) => {
                let (flight, publish) = self.start(now);
                let id = flight.id;
                vacant.insert(flight);
                trace!(key, "in-flight computation registered");
                Role::Leader { id, publish }
            }
        }
    }

    fn start(&self, now: Instant) -> (Flight<T>, watch::Sender<Option<T>>) {
        let (publish, result) = watch::channel(None);
        let flight = Flight {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            started: now,
            result,
        };
        (flight, publish)
    }

    fn is_forgotten(&self, flight: &Flight<T>, now: Instant) -> bool {
        self.forget_after
            .is_some_and(|timeout| now.duration_since(flight.started) >= timeout)
    }

    async fn wait(
        mut result: watch::Receiver<Option<T>>,
        cancel: &CancellationToken,
    ) -> Result<Coalesced<T>, CoalesceError> {
        let published = async {
            result
                .wait_for(Option::is_some)
                .await
                .map(|value| (*value).clone())
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoalesceError::Cancelled),
            published = published => match published {
                Ok(Some(value)) => Ok(Coalesced { value, shared: true }),
                Ok(None) | Err(_) => Err(CoalesceError::Abandoned),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    async fn slow_value(calls: Arc<AtomicUsize>, value: u32, delay: Duration) -> u32 {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        value
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_run() {
        let coalescer = Arc::new(Coalescer::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let coalescer = Arc::clone(&coalescer);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    coalescer
                        .execute("k", &cancel, || slow_value(calls, i, Duration::from_millis(100)))
                        .await
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let first = outcomes[0].value;
        assert!(outcomes.iter().all(|o| o.value == first));
        assert_eq!(outcomes.iter().filter(|o| !o.shared).count(), 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn sequential_calls_each_run() {
        let coalescer = Coalescer::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let outcome = coalescer
                .execute("k", &cancel, || slow_value(Arc::clone(&calls), 7, Duration::ZERO))
                .await
                .unwrap();
            assert!(!outcome.shared);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_do_not_coalesce() {
        let coalescer = Arc::new(Coalescer::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|key| {
                let coalescer = Arc::clone(&coalescer);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    coalescer
                        .execute(key, &cancel, || slow_value(calls, 1, Duration::from_millis(50)))
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert!(!task.await.unwrap().unwrap().shared);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_leaves_flight_alone() {
        let coalescer = Arc::new(Coalescer::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let leader = {
            let coalescer = Arc::clone(&coalescer);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                coalescer
                    .execute("k", &cancel, || slow_value(calls, 5, Duration::from_secs(1)))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(coalescer.in_flight(), 1);

        let impatient_token = CancellationToken::new();
        let impatient = {
            let coalescer = Arc::clone(&coalescer);
            let token = impatient_token.clone();
            tokio::spawn(async move { coalescer.execute("k", &token, || async { 0 }).await })
        };
        let patient = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                coalescer.execute("k", &cancel, || async { 0 }).await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        impatient_token.cancel();
        assert_eq!(impatient.await.unwrap(), Err(CoalesceError::Cancelled));

        assert_eq!(leader.await.unwrap().unwrap().value, 5);
        let shared = patient.await.unwrap().unwrap();
        assert_eq!(shared, Coalesced { value: 5, shared: true });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_timeout_lets_new_callers_start_over() {
        let coalescer = Arc::new(Coalescer::<u32>::new().forget_after(Duration::from_secs(1)));
        let calls = Arc::new(AtomicUsize::new(0));

        let stuck = {
            let coalescer = Arc::clone(&coalescer);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                coalescer
                    .execute("k", &cancel, || slow_value(calls, 1, Duration::from_secs(10)))
                    .await
            })
        };
        tokio::task::yield_now().await;

        let early_waiter = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                coalescer.execute("k", &cancel, || async { 99 }).await
            })
        };
        tokio::task::yield_now().await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        let cancel = CancellationToken::new();
        let fresh = coalescer
            .execute("k", &cancel, || slow_value(Arc::clone(&calls), 2, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(fresh, Coalesced { value: 2, shared: false });

        assert_eq!(stuck.await.unwrap().unwrap().value, 1);
        assert_eq!(
            early_waiter.await.unwrap().unwrap(),
            Coalesced { value: 1, shared: true }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_leader_abandons_waiters() {
        let coalescer = Arc::new(Coalescer::<u32>::new());
        let leader = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                coalescer
                    .execute("k", &cancel, || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        1
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let waiter = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                coalescer.execute("k", &cancel, || async { 2 }).await
            })
        };
        tokio::task::yield_now().await;

        leader.abort();
        assert_eq!(waiter.await.unwrap(), Err(CoalesceError::Abandoned));
        assert_eq!(coalescer.in_flight(), 0);
    }
}
