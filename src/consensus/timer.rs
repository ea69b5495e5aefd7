use crate::background::{self as stop_signal};
use crate::consensus::actor::{ConsensusClient, LeaderTick};
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, Weak};
use tokio::time::{Duration, Instant};

#[derive(Clone, Default)]
pub(crate) struct SharedOption<T> {
    data: Arc<Mutex<Option<T>>>,
}

impl<T> SharedOption<T> {
    pub(crate) fn new() -> Self {
        SharedOption {
            data: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn replace(&self, new_data: T) {
        self.data
            .lock()
            .expect("SharedOption.replace() mutex guard poison")
            .replace(new_data);
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.data.lock().expect("SharedOption.take() mutex guard poison").take()
    }
}

/// Handle armed while a member is follower or candidate. When the timeout
/// elapses without a reset, the actor receives a follower-timeout event and
/// starts an election. Timeouts are re-randomized on every reset to avoid
/// synchronized elections.
pub(crate) struct FollowerTimerHandle {
    next_wake_time: SharedOption<Instant>,
    timeout_range: RangeInclusive<Duration>,
    _to_drop: stop_signal::Stopper,
}

struct FollowerTimerTask {
    next_wake_time: SharedOption<Instant>,
    actor_client: ConsensusClient,
    stop_check: stop_signal::StopCheck,
    // Static wait between repeated timeout notifications, in case the actor
    // stays follower (e.g. it is partitioned away and elections never
    // conclude).
    timeout_backoff: Duration,
}

impl FollowerTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: ConsensusClient,
    ) -> Self {
        let shared_opt = SharedOption::new();
        let (stopper, stop_check) = stop_signal::stop_signal();

        let task = FollowerTimerTask {
            next_wake_time: shared_opt.clone(),
            actor_client,
            stop_check,
            timeout_backoff: min_timeout,
        };
        let handle = FollowerTimerHandle {
            next_wake_time: shared_opt,
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            _to_drop: stopper,
        };

        // The task must have a timeout present when it starts, otherwise it
        // may trigger an election immediately after we become a follower.
        handle.reset_timeout();
        tokio::task::spawn(task.run());

        handle
    }

    pub(crate) fn reset_timeout(&self) {
        self.next_wake_time.replace(self.random_wake_time());
    }

    fn random_wake_time(&self) -> Instant {
        let rand_timeout = rand::thread_rng().gen_range(self.timeout_range.clone());
        Instant::now() + rand_timeout
    }
}

impl FollowerTimerTask {
    async fn run(self) {
        loop {
            match self.next_wake_time.take() {
                Some(wake_time) => {
                    // Heard from a leader recently; sleep until the next
                    // possible timeout.
                    tokio::time::sleep_until(wake_time).await;
                }
                None => {
                    // Slept through `wake_time` without another reset: no
                    // leader contact. Notify the actor and back off.
                    if self.stop_check.should_stop() {
                        return;
                    }
                    self.actor_client.follower_timeout().await;
                    tokio::time::sleep(self.timeout_backoff).await;
                }
            }

            // The handle dropped: we are no longer follower/candidate for
            // the same term. Exit without triggering another election.
            if self.stop_check.should_stop() {
                return;
            }
        }
    }
}

/// Per-peer heartbeat timer held by the leader. The first loop iteration
/// fires immediately, which establishes the new leader-follower pair eagerly.
pub(crate) struct LeaderTimerHandle {
    shared: Arc<LeaderTimerShared>,
}

struct LeaderTimerShared {
    heartbeat_duration: Duration,
    next_heartbeat_time: SharedOption<Instant>,
}

struct LeaderTimerTask {
    weak_shared: Weak<LeaderTimerShared>,
    next_heartbeat_time: SharedOption<Instant>,
    actor_client: ConsensusClient,
    event: LeaderTick,
}

impl LeaderTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_duration: Duration,
        actor_client: ConsensusClient,
        event: LeaderTick,
    ) -> Self {
        let shared_opt = SharedOption::new();
        let shared = Arc::new(LeaderTimerShared {
            heartbeat_duration,
            next_heartbeat_time: shared_opt.clone(),
        });

        let task = LeaderTimerTask {
            weak_shared: Arc::downgrade(&shared),
            next_heartbeat_time: shared_opt,
            actor_client,
            event,
        };
        tokio::task::spawn(task.run());

        LeaderTimerHandle { shared }
    }

    /// Push back the next periodic heartbeat for this peer, typically after
    /// the actor has just sent it a replicate request.
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.shared.reset_heartbeat_timer();
    }
}

impl LeaderTimerShared {
    fn reset_heartbeat_timer(&self) {
        let new_timeout = Instant::now() + self.heartbeat_duration;
        self.next_heartbeat_time.replace(new_timeout);
    }
}

impl LeaderTimerTask {
    async fn run(self) {
        loop {
            match self.next_heartbeat_time.take() {
                Some(wake_time) => {
                    tokio::time::sleep_until(wake_time).await;
                }
                None => {
                    // No send to this peer since the last wake. If the
                    // handle is alive we owe the peer a heartbeat.
                    if let Some(shared) = self.weak_shared.upgrade() {
                        self.actor_client.leader_tick(self.event.clone()).await;
                        shared.reset_heartbeat_timer();
                    } else {
                        // Handle dropped: no longer leader for this term.
                        return;
                    }
                }
            }
        }
    }
}
