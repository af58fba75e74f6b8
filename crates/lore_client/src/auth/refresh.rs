//! Single-flight coordination of access token refreshes.
//!
//! The first caller to hit an expired credential becomes the leader and runs the
//! exchange. Everyone arriving while it is outstanding parks a [`Continuation`]
//! and is resumed with the leader's outcome. The check of `in_flight` and its
//! transition happen under one lock acquisition, and the lock is never held
//! across an await, so two exchanges can never overlap on a multi-threaded
//! runtime.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::oneshot;

use crate::error::RefreshError;

pub type RefreshOutcome = Result<String, RefreshError>;

/// A parked caller waiting for the in-flight exchange to settle.
#[derive(Debug)]
pub struct Continuation {
    request_id: u64,
    resume: oneshot::Sender<RefreshOutcome>,
}

impl Continuation {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Consumes the continuation, so each one is resolved at most once.
    fn resume(self, outcome: RefreshOutcome) -> bool {
        self.resume.send(outcome).is_ok()
    }
}

#[derive(Debug, Default)]
struct RefreshState {
    in_flight: bool,
    /// Number of the latest attempt; 0 before the first one starts.
    attempt: u64,
    waiters: VecDeque<Continuation>,
}

/// Result of joining a refresh attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub outcome: RefreshOutcome,
    /// The attempt this caller joined. Callers of one attempt share the number.
    pub attempt: u64,
    /// True for the caller that ran the exchange.
    pub led: bool,
}

enum Role {
    Leader(u64),
    Follower(u64, oneshot::Receiver<RefreshOutcome>),
}

#[derive(Debug, Default)]
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    exchange_timeout: Option<Duration>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exchange_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock().in_flight
    }

    /// Number of continuations parked on the current attempt.
    pub fn queued(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Total exchanges started over the coordinator's lifetime.
    pub fn exchanges_started(&self) -> u64 {
        self.lock().attempt
    }

    /// Joins the current refresh attempt, or starts one by running `exchange`.
    ///
    /// `exchange` runs only when no attempt is outstanding, and must persist the
    /// new credential before returning it: waiters are resumed as soon as it
    /// returns.
    pub async fn refresh<F, Fut>(&self, request_id: u64, exchange: F) -> Settlement
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshOutcome>,
    {
        let role = {
            let mut state = self.lock();
            if state.in_flight {
                let (resume, parked) = oneshot::channel();
                state.waiters.push_back(Continuation { request_id, resume });
                debug!(
                    "Request {} queued behind in-flight refresh ({} waiting)",
                    request_id,
                    state.waiters.len()
                );
                Role::Follower(state.attempt, parked)
            } else {
                state.in_flight = true;
                state.attempt += 1;
                Role::Leader(state.attempt)
            }
        };

        match role {
            Role::Follower(attempt, parked) => Settlement {
                outcome: parked.await.unwrap_or(Err(RefreshError::Abandoned)),
                attempt,
                led: false,
            },
            Role::Leader(attempt) => {
                info!(
                    "Request {} started access token refresh #{}",
                    request_id, attempt
                );
                let mut flight = Flight {
                    coordinator: self,
                    settled: false,
                };
                let outcome = match self.exchange_timeout {
                    Some(limit) => tokio::time::timeout(limit, exchange())
                        .await
                        .unwrap_or(Err(RefreshError::TimedOut(limit))),
                    None => exchange().await,
                };
                flight.settle(&outcome);
                Settlement {
                    outcome,
                    attempt,
                    led: true,
                }
            }
        }
    }

    /// Returns to idle and resolves every parked continuation, in FIFO order.
    fn settle(&self, outcome: &RefreshOutcome) -> usize {
        let waiters = {
            let mut state = self.lock();
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };

        let drained = waiters.len();
        for continuation in waiters {
            let request_id = continuation.request_id();
            if !continuation.resume(outcome.clone()) {
                debug!("Request {} stopped waiting before the refresh settled", request_id);
            }
        }
        match outcome {
            Ok(_) => info!("Refresh succeeded, resumed {} queued requests", drained),
            Err(err) => warn!("Refresh failed ({}), failing {} queued requests", err, drained),
        }
        drained
    }
}

/// Guarantees the attempt settles even if the leader's future is dropped mid-exchange.
struct Flight<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl Flight<'_> {
    fn settle(&mut self, outcome: &RefreshOutcome) {
        self.settled = true;
        self.coordinator.settle(outcome);
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Refresh leader dropped before the exchange settled");
            self.coordinator.settle(&Err(RefreshError::Abandoned));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Notify;

    async fn wait_for_queue(coordinator: &RefreshCoordinator, expected: usize) {
        for _ in 0..200 {
            if coordinator.queued() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue never reached {expected}, got {}", coordinator.queued());
    }

    #[tokio::test]
    async fn idle_coordinator_runs_exchange_once() {
        let coordinator = RefreshCoordinator::new();
        let settlement = coordinator
            .refresh(1, || async { Ok::<_, RefreshError>("T2".to_string()) })
            .await;

        assert_eq!(settlement.outcome, Ok("T2".to_string()));
        assert!(settlement.led);
        assert!(!coordinator.is_refreshing());
        assert_eq!(coordinator.exchanges_started(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_exchange() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let release = Arc::new(Notify::new());

        let leader = {
            let coordinator = Arc::clone(&coordinator);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                coordinator
                    .refresh(0, || async move {
                        release.notified().await;
                        Ok::<_, RefreshError>("T2".to_string())
                    })
                    .await
            })
        };
        while !coordinator.is_refreshing() {
            tokio::task::yield_now().await;
        }

        let followers: Vec<_> = (1..=5)
            .map(|id| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    coordinator
                        .refresh(id, || async {
                            Err::<String, _>(RefreshError::Transport(
                                "follower ran the exchange".to_string(),
                            ))
                        })
                        .await
                })
            })
            .collect();
        wait_for_queue(&coordinator, 5).await;
        release.notify_one();

        let leader = leader.await.expect("leader task");
        assert!(leader.led);
        for follower in followers {
            let settlement = follower.await.expect("follower task");
            assert!(!settlement.led);
            assert_eq!(settlement.outcome, Ok("T2".to_string()));
        }
        assert_eq!(coordinator.exchanges_started(), 1);
        assert_eq!(coordinator.queued(), 0);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let release = Arc::new(Notify::new());
        let rejected = RefreshError::Rejected {
            status: 401,
            body: "refresh expired".to_string(),
        };

        let leader = {
            let coordinator = Arc::clone(&coordinator);
            let release = Arc::clone(&release);
            let rejected = rejected.clone();
            tokio::spawn(async move {
                coordinator
                    .refresh(0, || async move {
                        release.notified().await;
                        Err::<String, _>(rejected)
                    })
                    .await
            })
        };
        while !coordinator.is_refreshing() {
            tokio::task::yield_now().await;
        }
        let follower = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .refresh(1, || async { Ok::<_, RefreshError>("never".to_string()) })
                    .await
            })
        };
        wait_for_queue(&coordinator, 1).await;
        release.notify_one();

        let leader = leader.await.expect("leader task");
        let follower = follower.await.expect("follower task");
        assert_eq!(leader.outcome, Err(rejected.clone()));
        assert_eq!(follower.outcome, Err(rejected));
        assert!(leader.led && !follower.led);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn waiters_resume_in_arrival_order() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let release = Arc::new(Notify::new());
        let resumed = Arc::new(Mutex::new(Vec::new()));

        let leader = {
            let coordinator = Arc::clone(&coordinator);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                coordinator
                    .refresh(0, || async move {
                        release.notified().await;
                        Ok::<_, RefreshError>("T2".to_string())
                    })
                    .await
            })
        };
        while !coordinator.is_refreshing() {
            tokio::task::yield_now().await;
        }

        let mut followers = Vec::new();
        for id in 1..=4u64 {
            let follower_coordinator = Arc::clone(&coordinator);
            let resumed = Arc::clone(&resumed);
            followers.push(tokio::spawn(async move {
                let settlement = follower_coordinator
                    .refresh(id, || async { Ok::<_, RefreshError>("never".to_string()) })
                    .await;
                resumed.lock().expect("resumed").push(id);
                settlement
            }));
            // Each follower is parked before the next one is spawned.
            wait_for_queue(&coordinator, id as usize).await;
        }
        release.notify_one();

        let leader = leader.await.expect("leader task");
        for follower in followers {
            let settlement = follower.await.expect("follower task");
            assert_eq!(settlement.attempt, leader.attempt);
        }
        assert_eq!(*resumed.lock().expect("resumed"), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn next_attempt_starts_fresh_after_settling() {
        let coordinator = RefreshCoordinator::new();
        let first = coordinator
            .refresh(1, || async {
                Err::<String, _>(RefreshError::Transport("down".to_string()))
            })
            .await;
        let second = coordinator
            .refresh(2, || async { Ok::<_, RefreshError>("T3".to_string()) })
            .await;

        assert!(first.outcome.is_err());
        assert_eq!(second.outcome, Ok("T3".to_string()));
        assert!(second.led);
        assert_eq!((first.attempt, second.attempt), (1, 2));
        assert_eq!(coordinator.exchanges_started(), 2);
    }

    #[tokio::test]
    async fn exchange_timeout_fails_the_attempt() {
        let coordinator =
            RefreshCoordinator::new().with_exchange_timeout(Some(Duration::from_millis(20)));
        let settlement = coordinator
            .refresh(1, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, RefreshError>("late".to_string())
            })
            .await;

        assert_eq!(
            settlement.outcome,
            Err(RefreshError::TimedOut(Duration::from_millis(20)))
        );
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn dropped_leader_releases_waiters() {
        let coordinator = Arc::new(RefreshCoordinator::new());

        let leader = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .refresh(0, || std::future::pending::<RefreshOutcome>())
                    .await
            })
        };
        while !coordinator.is_refreshing() {
            tokio::task::yield_now().await;
        }
        let follower = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .refresh(1, || async { Ok::<_, RefreshError>("never".to_string()) })
                    .await
            })
        };
        wait_for_queue(&coordinator, 1).await;

        leader.abort();
        let follower = follower.await.expect("follower task");
        assert_eq!(follower.outcome, Err(RefreshError::Abandoned));
        assert!(!coordinator.is_refreshing());
    }
}
