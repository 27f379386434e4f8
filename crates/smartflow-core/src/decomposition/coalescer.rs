//! Single-flight coalescing of identical in-flight requests
//!
//! The first caller for a fingerprint becomes the leader and does the work;
//! later callers subscribe to the leader's outcome. The in-flight entry is
//! removed before the outcome is sent, so a request arriving after
//! publication starts a fresh flight instead of reading a stale one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, warn};

use super::error::DecompositionError;
use super::request::Fingerprint;
use super::result::DecompositionResult;

/// What every participant of a flight receives
pub type Outcome = Result<DecompositionResult, DecompositionError>;

struct InFlight {
    sender: watch::Sender<Option<Outcome>>,
    generation: u64,
}

#[derive(Default)]
struct FlightTable {
    flights: HashMap<Fingerprint, InFlight>,
    next_generation: u64,
}

/// Registry of in-flight decompositions
#[derive(Clone, Default)]
pub struct Coalescer {
    table: Arc<Mutex<FlightTable>>,
}

impl std::fmt::Debug for Coalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// A caller's part in a flight
#[derive(Debug)]
pub enum Role {
    Leader(LeaderHandle),
    Follower(WaitHandle),
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FlightTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Join an existing flight for `fingerprint` or start one
    pub fn join_or_lead(&self, fingerprint: &Fingerprint) -> Role {
        let mut table = self.lock();

        if let Some(flight) = table.flights.get(fingerprint) {
            debug!(fingerprint = %fingerprint.short(), "Joining in-flight decomposition");
            return Role::Follower(WaitHandle {
                receiver: flight.sender.subscribe(),
            });
        }

        table.next_generation += 1;
        let generation = table.next_generation;
        let (sender, _) = watch::channel(None);
        table
            .flights
            .insert(fingerprint.clone(), InFlight { sender, generation });

        Role::Leader(LeaderHandle {
            coalescer: self.clone(),
            fingerprint: fingerprint.clone(),
            generation,
            published: false,
        })
    }

    fn publish(&self, fingerprint: &Fingerprint, generation: u64, outcome: Outcome) {
        let flight = {
            let mut table = self.lock();
            let current = table
                .flights
                .get(fingerprint)
                .is_some_and(|flight| flight.generation == generation);
            if current {
                table.flights.remove(fingerprint)
            } else {
                None
            }
        };

        match flight {
            // No receivers left is fine: every waiter already gave up
            Some(flight) => {
                let _ = flight.sender.send(Some(outcome));
            }
            None => warn!(fingerprint = %fingerprint.short(), "Publish for a flight that no longer exists"),
        }
    }

    fn subscribe(&self, fingerprint: &Fingerprint, generation: u64) -> Option<WaitHandle> {
        let table = self.lock();
        table
            .flights
            .get(fingerprint)
            .filter(|flight| flight.generation == generation)
            .map(|flight| WaitHandle {
                receiver: flight.sender.subscribe(),
            })
    }

    /// Number of fingerprints currently being computed
    pub fn in_flight(&self) -> usize {
        self.lock().flights.len()
    }

    /// Number of callers waiting on a fingerprint's flight
    pub fn subscribers(&self, fingerprint: &Fingerprint) -> usize {
        self.lock()
            .flights
            .get(fingerprint)
            .map_or(0, |flight| flight.sender.receiver_count())
    }
}

/// Held by the caller doing the work for a flight
///
/// Dropping it without publishing releases all waiters with
/// [`DecompositionError::LeaderAbandoned`].
#[derive(Debug)]
pub struct LeaderHandle {
    coalescer: Coalescer,
    fingerprint: Fingerprint,
    generation: u64,
    published: bool,
}

impl LeaderHandle {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Wait on this leader's own outcome
    pub fn subscribe(&self) -> Option<WaitHandle> {
        self.coalescer.subscribe(&self.fingerprint, self.generation)
    }

    /// Hand the outcome to every waiter and close the flight
    pub fn publish(mut self, outcome: Outcome) {
        self.published = true;
        self.coalescer
            .publish(&self.fingerprint, self.generation, outcome);
    }
}

impl Drop for LeaderHandle {
    fn drop(&mut self) {
        if !self.published {
            debug!(fingerprint = %self.fingerprint.short(), "Leader dropped without publishing");
            self.coalescer.publish(
                &self.fingerprint,
                self.generation,
                Err(DecompositionError::LeaderAbandoned),
            );
        }
    }
}

/// Held by a caller waiting on a flight
#[derive(Debug)]
pub struct WaitHandle {
    receiver: watch::Receiver<Option<Outcome>>,
}

impl WaitHandle {
    /// Wait for the flight's outcome
    pub async fn wait(mut self) -> Outcome {
        let outcome = match self.receiver.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(DecompositionError::LeaderAbandoned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposition::{DecompositionRequest, PreferenceProfile};

    fn fixture(name: &str) -> (Fingerprint, DecompositionResult) {
        let request = DecompositionRequest::new(name, PreferenceProfile::default());
        (
            request.fingerprint(),
            DecompositionResult::fallback(&request, 60, 5.0),
        )
    }

    fn expect_leader(role: Role) -> LeaderHandle {
        match role {
            Role::Leader(handle) => handle,
            Role::Follower(_) => panic!("expected to lead"),
        }
    }

    fn expect_follower(role: Role) -> WaitHandle {
        match role {
            Role::Follower(handle) => handle,
            Role::Leader(_) => panic!("expected to follow"),
        }
    }

    #[tokio::test]
    async fn test_first_caller_leads_others_follow() {
        let coalescer = Coalescer::new();
        let (fp, result) = fixture("task");

        let leader = expect_leader(coalescer.join_or_lead(&fp));
        let followers: Vec<WaitHandle> = (0..3)
            .map(|_| expect_follower(coalescer.join_or_lead(&fp)))
            .collect();
        assert_eq!(coalescer.in_flight(), 1);
        assert_eq!(coalescer.subscribers(&fp), 3);

        leader.publish(Ok(result.clone()));
        assert_eq!(coalescer.in_flight(), 0);

        for follower in followers {
            assert_eq!(follower.wait().await, Ok(result.clone()));
        }
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_do_not_coalesce() {
        let coalescer = Coalescer::new();
        let (a, _) = fixture("a");
        let (b, _) = fixture("b");

        let _la = expect_leader(coalescer.join_or_lead(&a));
        let _lb = expect_leader(coalescer.join_or_lead(&b));
        assert_eq!(coalescer.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_dropped_leader_releases_followers() {
        let coalescer = Coalescer::new();
        let (fp, _) = fixture("task");

        let leader = expect_leader(coalescer.join_or_lead(&fp));
        let follower = expect_follower(coalescer.join_or_lead(&fp));
        drop(leader);

        assert_eq!(follower.wait().await, Err(DecompositionError::LeaderAbandoned));
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_shared() {
        let coalescer = Coalescer::new();
        let (fp, _) = fixture("task");

        let leader = expect_leader(coalescer.join_or_lead(&fp));
        let own = leader.subscribe().unwrap();
        let follower = expect_follower(coalescer.join_or_lead(&fp));

        let err = DecompositionError::Upstream("Unauthorized".to_string());
        leader.publish(Err(err.clone()));

        assert_eq!(own.wait().await, Err(err.clone()));
        assert_eq!(follower.wait().await, Err(err));
    }

    #[tokio::test]
    async fn test_new_flight_after_publish() {
        let coalescer = Coalescer::new();
        let (fp, result) = fixture("task");

        let first = expect_leader(coalescer.join_or_lead(&fp));
        first.publish(Ok(result));

        let second = expect_leader(coalescer.join_or_lead(&fp));
        assert_eq!(coalescer.in_flight(), 1);
        drop(second);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_follower_waits_across_tasks() {
        let coalescer = Coalescer::new();
        let (fp, result) = fixture("task");

        let leader = expect_leader(coalescer.join_or_lead(&fp));
        let follower = expect_follower(coalescer.join_or_lead(&fp));
        let waiter = tokio::spawn(follower.wait());

        tokio::task::yield_now().await;
        leader.publish(Ok(result.clone()));

        assert_eq!(waiter.await.unwrap(), Ok(result));
    }
}
