//! Leader election using a lease lock
//!
//! Only one replica runs the restore controller. Replicas contend for a
//! coordination.k8s.io/v1 Lease; the holder renews it and everyone else polls
//! until it expires.
//!
//! # Atomicity
//!
//! Every write is compare-and-swap on the record's resourceVersion. If the
//! lease changes between read and write the write fails with a conflict and
//! we retry, so two replicas can never both believe they acquired it.
//!
//! # Expiry
//!
//! Expiry is judged from the local monotonic time at which we last saw the
//! record change, not from the remote `renewTime`. Clock skew between nodes
//! therefore cannot shorten a lease. Lease expiry bounds the dual-leader
//! window to one lease duration even if the old leader is frozen.
//!
//! # Loss
//!
//! A leader renews every retry period. If it cannot renew within the renew
//! deadline, or sees another holder, it reports [`LeadershipEvent::Lost`]
//! once and stops. The elector never becomes a candidate again.

mod lock;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use lock::{record_from_lease, KubeLeaseLock, LeaseLock, LeaseRecord, WriteOutcome};

#[cfg(any(test, feature = "mock"))]
pub use lock::MockLeaseLock;

// Reference timing
const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_DEADLINE: Duration = Duration::from_secs(10);
const RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Reads and writes attempted when releasing on shutdown
const RELEASE_ATTEMPTS: usize = 3;

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// An update was attempted without a version to compare against
    #[error("lease {lock} is missing resourceVersion")]
    MissingResourceVersion {
        /// Lock location
        lock: String,
    },

    /// Timing parameters that would allow flapping or split brain
    #[error("invalid election timing: {0}")]
    InvalidTiming(String),

    /// Non-Kubernetes backend failure
    #[error("lease backend error: {0}")]
    Backend(String),
}

/// Timing of the election protocol
///
/// Must satisfy `lease_duration > renew_deadline > retry_period > 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElectionConfig {
    /// How long a lease stays valid without renewal
    pub lease_duration: Duration,
    /// How long a leader may go without a successful renewal
    pub renew_deadline: Duration,
    /// Interval between acquire or renew attempts
    pub retry_period: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: LEASE_DURATION,
            renew_deadline: RENEW_DEADLINE,
            retry_period: RETRY_PERIOD,
        }
    }
}

impl ElectionConfig {
    /// Reject timings that break the lease protocol
    pub fn validate(&self) -> Result<(), LeaderElectionError> {
        if self.retry_period.is_zero() {
            return Err(LeaderElectionError::InvalidTiming(
                "retry period must be greater than zero".to_string(),
            ));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(LeaderElectionError::InvalidTiming(format!(
                "renew deadline ({:?}) must be greater than retry period ({:?})",
                self.renew_deadline, self.retry_period
            )));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(LeaderElectionError::InvalidTiming(format!(
                "lease duration ({:?}) must be greater than renew deadline ({:?})",
                self.lease_duration, self.renew_deadline
            )));
        }
        Ok(())
    }
}

/// Leadership transition observed by the elector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeadershipEvent {
    /// This replica now holds the lease
    Acquired,
    /// This replica held the lease and no longer does
    Lost,
}

/// Record as last seen, with the local time it was first seen
struct Observed {
    record: LeaseRecord,
    at: Instant,
}

/// Leader elector over a [`LeaseLock`]
pub struct LeaderElector {
    lock: Arc<dyn LeaseLock>,
    identity: String,
    config: ElectionConfig,
    observed: Mutex<Option<Observed>>,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create an elector; fails if `config` is not a safe timing
    pub fn new(
        lock: Arc<dyn LeaseLock>,
        identity: &str,
        config: ElectionConfig,
    ) -> Result<Self, LeaderElectionError> {
        config.validate()?;
        Ok(Self {
            lock,
            identity: identity.to_string(),
            config,
            observed: Mutex::new(None),
            is_leader: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Holder identity this elector writes into the lease
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Timing in use
    pub fn config(&self) -> ElectionConfig {
        self.config
    }

    /// Whether this replica currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Shared leadership flag, for status reporting
    pub fn leader_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.is_leader)
    }

    /// Run the election in a background task
    ///
    /// Emits [`LeadershipEvent::Acquired`] once when the lease is won and
    /// [`LeadershipEvent::Lost`] at most once afterwards. Cancelling
    /// `shutdown` stops the election; a held lease is released first and no
    /// `Lost` event is sent. The channel closes when the task ends.
    pub fn spawn(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> (mpsc::Receiver<LeadershipEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(2);
        let task = tokio::spawn(async move { self.run(shutdown, tx).await });
        (rx, task)
    }

    async fn run(
        self: Arc<Self>,
        shutdown: CancellationToken,
        events: mpsc::Sender<LeadershipEvent>,
    ) {
        let Some(mut guard) = Arc::clone(&self).acquire(&shutdown).await else {
            debug!(identity = %self.identity, "Election cancelled before leadership was acquired");
            return;
        };

        if events.send(LeadershipEvent::Acquired).await.is_err() {
            warn!(identity = %self.identity, "Leadership listener gone, stepping down");
            guard.step_down().await;
            return;
        }

        tokio::select! {
            _ = guard.lost() => {
                let _ = events.send(LeadershipEvent::Lost).await;
            }
            _ = shutdown.cancelled() => {
                info!(identity = %self.identity, "Shutting down, releasing leadership");
                guard.step_down().await;
            }
        }
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// Returns `None` if `shutdown` is cancelled first. Errors other than
    /// losing the race are logged and retried on the next tick.
    pub async fn acquire(self: Arc<Self>, shutdown: &CancellationToken) -> Option<LeaderGuard> {
        info!(
            identity = %self.identity,
            lease = %self.lock.describe(),
            "Waiting for leadership..."
        );

        loop {
            if shutdown.is_cancelled() {
                return None;
            }

            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, lease = %self.lock.describe(), "Leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return Some(self.create_guard());
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.config.retry_period.as_secs(),
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.config.retry_period.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let acquired_at = Instant::now();
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(acquired_at, lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    /// Try to acquire or renew the lease atomically
    ///
    /// Returns `Ok(true)` if we hold the lease after this call and
    /// `Ok(false)` if another replica holds it or won a concurrent write.
    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let now = Utc::now();

        let Some(current) = self.lock.get().await? else {
            // No lease yet - first leader
            let record = LeaseRecord {
                holder_identity: Some(self.identity.clone()),
                lease_duration: self.config.lease_duration,
                acquire_time: Some(now),
                renew_time: Some(now),
                lease_transitions: 0,
                resource_version: None,
            };
            return match self.lock.create(&record).await? {
                WriteOutcome::Written => {
                    info!(identity = %self.identity, "Created new lease");
                    self.observe(&record);
                    Ok(true)
                }
                WriteOutcome::Conflict => {
                    debug!(identity = %self.identity, "Lease creation conflict, will retry");
                    Ok(false)
                }
            };
        };

        self.observe(&current);

        if current.holder() == Some(self.identity.as_str()) {
            let record = LeaseRecord {
                lease_duration: self.config.lease_duration,
                renew_time: Some(now),
                ..current
            };
            return match self.lock.update(&record).await? {
                WriteOutcome::Written => {
                    debug!(identity = %self.identity, "Lease renewed");
                    self.observe(&record);
                    Ok(true)
                }
                WriteOutcome::Conflict => {
                    debug!(identity = %self.identity, "Lease renewal conflict");
                    Ok(false)
                }
            };
        }

        if !current.is_released() && !self.observed_expired() {
            return Ok(false);
        }

        let transitions = current.lease_transitions + 1;
        let record = LeaseRecord {
            holder_identity: Some(self.identity.clone()),
            lease_duration: self.config.lease_duration,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: transitions,
            resource_version: current.resource_version,
        };
        match self.lock.update(&record).await? {
            WriteOutcome::Written => {
                info!(
                    identity = %self.identity,
                    previous = current.holder_identity.as_deref().unwrap_or(""),
                    transitions,
                    "Took over lease"
                );
                self.observe(&record);
                Ok(true)
            }
            WriteOutcome::Conflict => {
                debug!(identity = %self.identity, "Lease takeover conflict, will retry");
                Ok(false)
            }
        }
    }

    /// Remember `record`, restarting the expiry clock if it changed
    fn observe(&self, record: &LeaseRecord) {
        let mut observed = self.observed.lock();
        let changed = observed.as_ref().map_or(true, |o| o.record != *record);
        if changed {
            *observed = Some(Observed {
                record: record.clone(),
                at: Instant::now(),
            });
        }
    }

    fn observed_expired(&self) -> bool {
        let observed = self.observed.lock();
        let Some(o) = observed.as_ref() else {
            return true;
        };
        let duration = if o.record.lease_duration.is_zero() {
            self.config.lease_duration
        } else {
            o.record.lease_duration
        };
        o.at.elapsed() >= duration
    }

    /// Another identity holds the last observed record
    fn observed_other_holder(&self) -> Option<String> {
        let observed = self.observed.lock();
        observed
            .as_ref()
            .and_then(|o| o.record.holder())
            .filter(|h| *h != self.identity)
            .map(str::to_string)
    }

    /// Renewal loop that runs while we hold leadership
    async fn renewal_loop(&self, acquired_at: Instant, lost_tx: oneshot::Sender<()>) {
        let deadline = self.config.renew_deadline;
        let mut last_renew = acquired_at;

        loop {
            let remaining = deadline.saturating_sub(last_renew.elapsed());
            tokio::time::sleep(self.config.retry_period.min(remaining)).await;

            let remaining = deadline.saturating_sub(last_renew.elapsed());
            if remaining.is_zero() {
                warn!(identity = %self.identity, "Renew deadline exceeded");
                break;
            }

            match tokio::time::timeout(remaining, self.try_acquire_or_renew()).await {
                Ok(Ok(true)) => last_renew = Instant::now(),
                Ok(Ok(false)) => {
                    if let Some(holder) = self.observed_other_holder() {
                        warn!(identity = %self.identity, holder = %holder, "Lease held by another replica");
                        break;
                    }
                }
                Ok(Err(e)) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        remaining_ms = remaining.as_millis() as u64,
                        "Failed to renew lease, retrying..."
                    );
                }
                Err(_) => {
                    warn!(identity = %self.identity, "Lease renewal timed out");
                    break;
                }
            }
        }

        warn!(identity = %self.identity, "Leadership lost");
        self.is_leader.store(false, Ordering::SeqCst);
        let _ = lost_tx.send(());
    }

    /// Release the lease by clearing the holder identity
    ///
    /// Lets a standby acquire immediately instead of waiting for expiry. A
    /// conflict is retried while we are still the holder, since our own last
    /// renewal may have landed between the read and the write.
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        for _ in 0..RELEASE_ATTEMPTS {
            let Some(current) = self.lock.get().await? else {
                debug!(identity = %self.identity, "Lease not found, nothing to release");
                return Ok(());
            };

            if current.holder() != Some(self.identity.as_str()) {
                debug!(identity = %self.identity, "Not the lease holder, nothing to release");
                return Ok(());
            }

            let record = LeaseRecord {
                holder_identity: None,
                renew_time: Some(Utc::now()),
                ..current
            };
            match self.lock.update(&record).await? {
                WriteOutcome::Written => {
                    info!(identity = %self.identity, "Lease released for fast failover");
                    return Ok(());
                }
                WriteOutcome::Conflict => {
                    debug!(identity = %self.identity, "Lease changed during release, re-reading");
                }
            }
        }

        warn!(
            identity = %self.identity,
            attempts = RELEASE_ATTEMPTS,
            "Could not release lease, standby will wait for expiry"
        );
        Ok(())
    }
}

/// Guard that maintains leadership
///
/// While this guard exists the elector renews the lease in the background.
/// Use `lost()` to wait for leadership loss. The renewal task is aborted when
/// the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.as_mut() {
            let _ = rx.await;
            self.lost_rx = None;
        } else {
            std::future::pending::<()>().await;
        }
    }

    /// Stop renewing and release the lease
    ///
    /// Renewal is stopped, and waited for, before the release so it cannot
    /// re-take the released lease.
    pub async fn step_down(mut self) {
        self.renewal_task.abort();
        let _ = (&mut self.renewal_task).await;
        self.elector.is_leader.store(false, Ordering::SeqCst);
        if let Err(e) = self.elector.release_lease().await {
            warn!(identity = %self.elector.identity, error = %e, "Failed to release lease");
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
    }
}
