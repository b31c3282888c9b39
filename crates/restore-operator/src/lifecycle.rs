//! Controller lifecycle gated on leadership
//!
//! The runner consumes [`LeadershipEvent`]s and moves through two states:
//!
//! - **Candidate**: nothing runs. `Acquired` starts the controller.
//! - **Leading**: the controller runs under a scope that is a child of the
//!   process shutdown token. `Lost`, a controller failure, or shutdown ends
//!   the run.
//!
//! The runner never restarts the controller and never goes back to
//! Candidate. Every outcome other than process shutdown is returned as an
//! error for the process boundary to treat as fatal. On loss of leadership
//! the controller scope is cancelled before the error is returned, but the
//! runner does not wait for the controller to stop. Only shutdown waits, up
//! to the stop grace period, while the lease is still held.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use restore_common::{LeadershipEvent, SelfService};

use crate::config::OperatorSettings;
use crate::controller::{ControllerError, ControllerFactory};

/// How long shutdown waits for a cancelled controller to stop on its own
pub const CONTROLLER_STOP_GRACE: Duration = Duration::from_secs(10);

/// Reasons the lifecycle ended
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// This replica lost the lease
    #[error("leader election lost")]
    LeadershipLost,

    /// The controller returned an error
    #[error("etcd restore operator stopped with error: {0}")]
    Controller(#[source] ControllerError),

    /// The controller task panicked or was aborted
    #[error("etcd restore operator task failed: {0}")]
    ControllerPanicked(String),

    /// The controller returned without being cancelled
    #[error("etcd restore operator exited while still leading")]
    ControllerExited,

    /// The election stopped reporting without a shutdown
    #[error("leader election ended unexpectedly")]
    ElectionEnded,
}

/// Runs the controller while this replica leads
pub struct LifecycleRunner {
    factory: Arc<dyn ControllerFactory>,
    settings: OperatorSettings,
    self_service: SelfService,
    stop_grace: Duration,
}

impl LifecycleRunner {
    /// Create a runner for the given settings and published Service
    pub fn new(
        factory: Arc<dyn ControllerFactory>,
        settings: OperatorSettings,
        self_service: SelfService,
    ) -> Self {
        Self {
            factory,
            settings,
            self_service,
            stop_grace: CONTROLLER_STOP_GRACE,
        }
    }

    /// Override the stop grace period
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Drive the lifecycle until shutdown or a fatal outcome
    ///
    /// Returns `Ok(())` only when `shutdown` is cancelled.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<LeadershipEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), LifecycleError> {
        // Candidate
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(LeadershipEvent::Acquired) => break,
                    Some(LeadershipEvent::Lost) => return Err(LifecycleError::LeadershipLost),
                    None => return Err(LifecycleError::ElectionEnded),
                },
            }
        }

        // Leading
        let scope = shutdown.child_token();
        let mut task = self.start_controller(scope.clone());

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping controller");
                    self.stop_controller(&scope, task).await;
                    return Ok(());
                }
                event = events.recv() => match event {
                    Some(LeadershipEvent::Acquired) => {
                        warn!("Duplicate leadership acquisition ignored");
                    }
                    // A standby may already hold the lease: cancel and return
                    // without waiting for the controller to wind down.
                    Some(LeadershipEvent::Lost) => {
                        error!("Leadership lost, cancelling controller");
                        scope.cancel();
                        return Err(LifecycleError::LeadershipLost);
                    }
                    None => {
                        error!("Leader election ended while leading, cancelling controller");
                        scope.cancel();
                        return Err(LifecycleError::ElectionEnded);
                    }
                },
                result = &mut task => {
                    return Err(match result {
                        Ok(Ok(())) => LifecycleError::ControllerExited,
                        Ok(Err(e)) => LifecycleError::Controller(e),
                        Err(e) => LifecycleError::ControllerPanicked(e.to_string()),
                    });
                }
            }
        }
    }

    fn start_controller(
        &self,
        scope: CancellationToken,
    ) -> JoinHandle<Result<(), ControllerError>> {
        let config = self.settings.controller_config(&self.self_service);
        info!(
            namespace = %config.namespace,
            cluster_wide = config.cluster_wide,
            create_crd = config.create_crd,
            service_addr = %config.self_service_address,
            "Became leader, starting controller"
        );
        let controller = self.factory.create(config);
        tokio::spawn(async move { controller.start(scope).await })
    }

    /// Cancel the controller scope and wait a bounded time for it to stop
    async fn stop_controller(
        &self,
        scope: &CancellationToken,
        task: JoinHandle<Result<(), ControllerError>>,
    ) {
        scope.cancel();
        match tokio::time::timeout(self.stop_grace, task).await {
            Ok(Ok(Ok(()))) => info!("Controller stopped"),
            Ok(Ok(Err(e))) => warn!(error = %e, "Controller stopped with error"),
            Ok(Err(e)) => warn!(error = %e, "Controller task failed"),
            Err(_) => warn!(
                grace_secs = self.stop_grace.as_secs(),
                "Controller did not stop within grace period"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::oneshot;

    use super::*;
    use crate::config::ControllerConfig;
    use crate::controller::Controller;
    use restore_common::Identity;

    /// How a scripted controller behaves once started
    #[derive(Clone, Copy)]
    enum Script {
        /// Run until cancelled
        UntilCancelled,
        /// Fail after a delay
        FailAfter(Duration),
        /// Return Ok after a delay without being cancelled
        ExitAfter(Duration),
        /// Ignore cancellation entirely
        Stubborn,
    }

    #[derive(Default)]
    struct Observations {
        started: AtomicUsize,
        configs: Mutex<Vec<ControllerConfig>>,
        scopes: Mutex<Vec<CancellationToken>>,
        stopped: Mutex<Option<oneshot::Sender<()>>>,
    }

    struct ScriptedFactory {
        script: Script,
        seen: Arc<Observations>,
    }

    struct ScriptedController {
        script: Script,
        seen: Arc<Observations>,
    }

    impl ControllerFactory for ScriptedFactory {
        fn create(&self, config: ControllerConfig) -> Box<dyn Controller> {
            self.seen.configs.lock().push(config);
            Box::new(ScriptedController {
                script: self.script,
                seen: Arc::clone(&self.seen),
            })
        }
    }

    #[async_trait]
    impl Controller for ScriptedController {
        async fn start(self: Box<Self>, cancel: CancellationToken) -> Result<(), ControllerError> {
            self.seen.started.fetch_add(1, Ordering::SeqCst);
            self.seen.scopes.lock().push(cancel.clone());
            let result = match self.script {
                Script::UntilCancelled => {
                    cancel.cancelled().await;
                    Ok(())
                }
                Script::FailAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    Err(ControllerError::WatchEnded("EtcdRestore".to_string()))
                }
                Script::ExitAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
                Script::Stubborn => std::future::pending().await,
            };
            if let Some(tx) = self.seen.stopped.lock().take() {
                let _ = tx.send(());
            }
            result
        }
    }

    fn settings() -> OperatorSettings {
        OperatorSettings {
            identity: Identity {
                namespace: "etcd".to_string(),
                instance_name: "restore-operator-0".to_string(),
                host_identity: "restore-operator-0".to_string(),
            },
            cluster_wide: false,
            create_crd: true,
            election: Default::default(),
        }
    }

    fn self_service() -> SelfService {
        SelfService {
            name: "etcd-restore-operator".to_string(),
            namespace: "etcd".to_string(),
            port: 19999,
        }
    }

    fn runner(script: Script) -> (LifecycleRunner, Arc<Observations>) {
        let seen = Arc::new(Observations::default());
        let factory = Arc::new(ScriptedFactory {
            script,
            seen: Arc::clone(&seen),
        });
        (LifecycleRunner::new(factory, settings(), self_service()), seen)
    }

    #[tokio::test(start_paused = true)]
    async fn controller_does_not_start_before_leadership() {
        let (runner, seen) = runner(Script::UntilCancelled);
        let (_tx, rx) = mpsc::channel(2);
        let shutdown = CancellationToken::new();

        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            cancel.cancel();
        });

        runner.run(rx, shutdown).await.unwrap();
        assert_eq!(seen.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquired_starts_controller_with_term_config() {
        let (runner, seen) = runner(Script::UntilCancelled);
        let (tx, rx) = mpsc::channel(2);
        let shutdown = CancellationToken::new();

        tx.send(LeadershipEvent::Acquired).await.unwrap();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        });

        runner.run(rx, shutdown).await.unwrap();
        assert_eq!(seen.started.load(Ordering::SeqCst), 1);
        let configs = seen.configs.lock();
        assert_eq!(configs.len(), 1);
        assert_eq!(
            configs[0].self_service_address,
            "etcd-restore-operator.etcd:19999"
        );
        assert_eq!(configs[0].namespace, "etcd");
        assert!(configs[0].create_crd);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_cancels_controller_scope_before_returning() {
        let (runner, seen) = runner(Script::UntilCancelled);
        let (stopped_tx, stopped_rx) = oneshot::channel();
        *seen.stopped.lock() = Some(stopped_tx);

        let (tx, rx) = mpsc::channel(2);
        tx.send(LeadershipEvent::Acquired).await.unwrap();
        let lose = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            lose.send(LeadershipEvent::Lost).await.unwrap();
        });

        let err = runner.run(rx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::LeadershipLost));
        let scopes = seen.scopes.lock().clone();
        assert_eq!(scopes.len(), 1);
        assert!(scopes[0].is_cancelled());

        // The controller still winds down on its own
        stopped_rx.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn lost_while_candidate_is_fatal() {
        let (runner, seen) = runner(Script::UntilCancelled);
        let (tx, rx) = mpsc::channel(2);
        tx.send(LeadershipEvent::Lost).await.unwrap();

        let err = runner.run(rx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::LeadershipLost));
        assert_eq!(seen.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn controller_failure_is_fatal_and_not_retried() {
        let (runner, seen) = runner(Script::FailAfter(Duration::from_secs(3)));
        let (tx, rx) = mpsc::channel(2);
        tx.send(LeadershipEvent::Acquired).await.unwrap();

        let err = runner.run(rx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Controller(_)));
        assert!(err.to_string().contains("stopped with error"));
        assert_eq!(seen.started.load(Ordering::SeqCst), 1);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn controller_exit_without_cancel_is_fatal() {
        let (runner, _seen) = runner(Script::ExitAfter(Duration::from_secs(1)));
        let (tx, rx) = mpsc::channel(2);
        tx.send(LeadershipEvent::Acquired).await.unwrap();

        let err = runner.run(rx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ControllerExited));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_acquired_does_not_start_second_controller() {
        let (runner, seen) = runner(Script::UntilCancelled);
        let (tx, rx) = mpsc::channel(4);
        tx.send(LeadershipEvent::Acquired).await.unwrap();
        tx.send(LeadershipEvent::Acquired).await.unwrap();
        tx.send(LeadershipEvent::Lost).await.unwrap();

        let err = runner.run(rx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::LeadershipLost));
        // Let the detached controller task run
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(seen.started.load(Ordering::SeqCst), 1);
        assert_eq!(seen.configs.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_event_stream_is_fatal() {
        let (runner, _seen) = runner(Script::UntilCancelled);
        let (tx, rx) = mpsc::channel::<LeadershipEvent>(2);
        drop(tx);

        let err = runner.run(rx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ElectionEnded));
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_controller_does_not_delay_loss() {
        let (runner, _seen) = runner(Script::Stubborn);
        let (tx, rx) = mpsc::channel(2);
        tx.send(LeadershipEvent::Acquired).await.unwrap();
        tx.send(LeadershipEvent::Lost).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = runner.run(rx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::LeadershipLost));

        // Loss is detected at most renew_deadline after the last renewal, so
        // anything spent here must fit in what remains of the lease.
        let election = settings().election;
        assert!(started.elapsed() < election.lease_duration - election.renew_deadline);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_controller_does_not_block_shutdown_past_grace() {
        let (runner, _seen) = runner(Script::Stubborn);
        let runner = runner.with_stop_grace(Duration::from_secs(3));
        let (tx, rx) = mpsc::channel(2);
        tx.send(LeadershipEvent::Acquired).await.unwrap();

        let shutdown = CancellationToken::new();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });

        let started = tokio::time::Instant::now();
        runner.run(rx, shutdown).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(4));
        drop(tx);
    }
}
