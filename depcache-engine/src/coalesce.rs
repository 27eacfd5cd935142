//! In-flight computation coalescing.
//!
//! The first caller for a key becomes the leader and runs the computation
//! itself. Later callers become followers and wait on a watch channel for the
//! leader's outcome. The leader's guard removes the key from the map before
//! publishing, so once a result is visible a new caller starts a fresh flight.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use depcache_core::{ComputeError, DepcacheError, DepcacheResult};
use depcache_storage::RequestKey;
use tokio::sync::watch;

/// Identity of a coalesced computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Request(RequestKey),
    Work(String),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(key) => write!(f, "{key}"),
            Self::Work(key) => write!(f, "work:{key}"),
        }
    }
}

/// Type-erased result handed from a leader to its followers.
pub type Outcome = Result<Arc<dyn Any + Send + Sync>, DepcacheError>;

type Slot = watch::Receiver<Option<Outcome>>;

/// Map of computations currently running.
#[derive(Default)]
pub struct InFlight {
    flights: Mutex<HashMap<CacheKey, Slot>>,
}

/// What a caller should do for a key.
pub enum Flight<'a> {
    /// Nobody is computing the key: run the computation and complete the guard.
    Leader(FlightGuard<'a>),
    /// Another caller is computing the key: wait for its outcome.
    Follower(FlightWaiter),
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn flights(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot>> {
        self.flights
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register interest in `key`.
    pub fn join(&self, key: CacheKey) -> Flight<'_> {
        let mut flights = self.flights();
        if let Some(receiver) = flights.get(&key) {
            return Flight::Follower(FlightWaiter {
                key,
                receiver: receiver.clone(),
            });
        }
        let (sender, receiver) = watch::channel(None);
        flights.insert(key.clone(), receiver);
        Flight::Leader(FlightGuard {
            in_flight: self,
            key,
            sender: Some(sender),
        })
    }

    /// Number of computations currently registered.
    pub fn len(&self) -> usize {
        self.flights().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn deregister(&self, key: &CacheKey) {
        self.flights().remove(key);
    }
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("len", &self.len())
            .finish()
    }
}

/// Held by the leader of a flight.
///
/// Dropping the guard without completing it (the leader's future was dropped
/// or panicked) deregisters the key and fails every follower with
/// [`ComputeError::Abandoned`].
pub struct FlightGuard<'a> {
    in_flight: &'a InFlight,
    key: CacheKey,
    sender: Option<watch::Sender<Option<Outcome>>>,
}

impl FlightGuard<'_> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Deregister the key, then publish `outcome` to followers.
    pub fn complete(mut self, outcome: Outcome) {
        self.publish(outcome);
    }

    fn publish(&mut self, outcome: Outcome) {
        if let Some(sender) = self.sender.take() {
            self.in_flight.deregister(&self.key);
            sender.send_replace(Some(outcome));
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            tracing::debug!(key = %self.key, "in-flight computation abandoned");
            let abandoned = ComputeError::Abandoned {
                key: self.key.to_string(),
            };
            self.publish(Err(abandoned.into()));
        }
    }
}

/// Held by a follower of a flight.
pub struct FlightWaiter {
    key: CacheKey,
    receiver: Slot,
}

impl FlightWaiter {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Wait for the leader's outcome.
    pub async fn wait(mut self) -> Outcome {
        let published = match self.receiver.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        published.unwrap_or_else(|| {
            Err(ComputeError::Abandoned {
                key: self.key.to_string(),
            }
            .into())
        })
    }
}

/// Downcast a coalesced value to the caller's type.
pub fn downcast<V: Clone + 'static>(
    key: &CacheKey,
    value: &Arc<dyn Any + Send + Sync>,
) -> DepcacheResult<V> {
    value.downcast_ref::<V>().cloned().ok_or_else(|| {
        ComputeError::TypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<V>(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work(key: &str) -> CacheKey {
        CacheKey::Work(key.to_string())
    }

    #[tokio::test]
    async fn test_second_caller_follows_leader() {
        let in_flight = InFlight::new();

        let leader = match in_flight.join(work("k")) {
            Flight::Leader(guard) => guard,
            Flight::Follower(_) => panic!("first caller should lead"),
        };
        let follower = match in_flight.join(work("k")) {
            Flight::Follower(waiter) => waiter,
            Flight::Leader(_) => panic!("second caller should follow"),
        };
        assert_eq!(in_flight.len(), 1);

        leader.complete(Ok(Arc::new(42u32)));
        assert!(in_flight.is_empty());

        let value = follower.wait().await.expect("leader succeeded");
        assert_eq!(downcast::<u32>(&work("k"), &value).expect("u32"), 42);
    }

    #[tokio::test]
    async fn test_failure_reaches_followers() {
        let in_flight = InFlight::new();
        let Flight::Leader(leader) = in_flight.join(work("k")) else {
            panic!("first caller should lead");
        };
        let Flight::Follower(follower) = in_flight.join(work("k")) else {
            panic!("second caller should follow");
        };

        let failure = DepcacheError::compute_failed("k", "boom");
        leader.complete(Err(failure.clone()));
        assert_eq!(follower.wait().await.unwrap_err(), failure);
    }

    #[tokio::test]
    async fn test_dropped_leader_abandons_followers() {
        let in_flight = InFlight::new();
        let Flight::Leader(leader) = in_flight.join(work("k")) else {
            panic!("first caller should lead");
        };
        let Flight::Follower(follower) = in_flight.join(work("k")) else {
            panic!("second caller should follow");
        };

        drop(leader);
        assert!(in_flight.is_empty());
        assert!(matches!(
            follower.wait().await.unwrap_err(),
            DepcacheError::Compute(ComputeError::Abandoned { .. })
        ));

        assert!(matches!(in_flight.join(work("k")), Flight::Leader(_)));
    }

    #[test]
    fn test_distinct_keys_do_not_coalesce() {
        let in_flight = InFlight::new();
        let a = in_flight.join(work("a"));
        let b = in_flight.join(CacheKey::Request(RequestKey::new("GET", "http://h/a")));
        assert!(matches!(a, Flight::Leader(_)));
        assert!(matches!(b, Flight::Leader(_)));
        assert_eq!(in_flight.len(), 2);
    }

    #[test]
    fn test_downcast_mismatch() {
        let value: Arc<dyn Any + Send + Sync> = Arc::new("text".to_string());
        let err = downcast::<u32>(&work("k"), &value).unwrap_err();
        assert!(matches!(
            err,
            DepcacheError::Compute(ComputeError::TypeMismatch { .. })
        ));
    }
}
