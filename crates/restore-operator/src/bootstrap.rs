//! Startup orchestration
//!
//! Identity → self-registration → probe server → election → lifecycle.
//! Configuration is resolved before any backend is constructed, so a replica
//! with a missing identity never touches the network.

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use restore_common::leader_election::{KubeLeaseLock, LeaseLock};
use restore_common::registration::{register_self, KubeServiceRegistry, ServiceRegistry};
use restore_common::{LeaderElector, LEADER_LEASE_NAME, SERVICE_PORT_FOR_MYSELF};

use crate::config::{OperatorArgs, OperatorSettings};
use crate::controller::{ControllerFactory, RestoreControllerFactory};
use crate::lifecycle::{LifecycleError, LifecycleRunner};
use crate::probe::{bind_probe_listener, probe_routes, serve_probes, ProbeState};

/// How long shutdown waits for the elector to release the lease
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fatal bootstrap outcomes
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration, registration or election setup failed
    #[error(transparent)]
    Startup(#[from] restore_common::Error),

    /// Kubernetes client could not be built
    #[error("failed to create kubernetes client: {0}")]
    Client(#[from] kube::Error),

    /// Probe port could not be bound
    #[error("failed to bind probe server on port {port}: {source}")]
    ProbeBind {
        /// Port that was requested
        port: u16,
        /// Underlying cause
        source: io::Error,
    },

    /// The leadership-gated lifecycle ended
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Backends the bootstrap talks to
pub struct Bootstrap {
    registry: Arc<dyn ServiceRegistry>,
    lock: Arc<dyn LeaseLock>,
    factory: Arc<dyn ControllerFactory>,
    probe_port: Option<u16>,
}

impl Bootstrap {
    /// Assemble a bootstrap from explicit backends
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        lock: Arc<dyn LeaseLock>,
        factory: Arc<dyn ControllerFactory>,
    ) -> Self {
        Self {
            registry,
            lock,
            factory,
            probe_port: None,
        }
    }

    /// Kubernetes-backed bootstrap for the replica described by `settings`
    pub fn for_cluster(client: Client, settings: &OperatorSettings) -> Self {
        let namespace = &settings.identity.namespace;
        Self::new(
            Arc::new(KubeServiceRegistry::new(client.clone())),
            Arc::new(KubeLeaseLock::new(client.clone(), namespace, LEADER_LEASE_NAME)),
            Arc::new(RestoreControllerFactory::new(client)),
        )
        .with_probe_port(SERVICE_PORT_FOR_MYSELF)
    }

    /// Serve probes on `port` between registration and election
    pub fn with_probe_port(mut self, port: u16) -> Self {
        self.probe_port = Some(port);
        self
    }

    /// Run the replica until shutdown or a fatal outcome
    pub async fn run(
        self,
        settings: OperatorSettings,
        shutdown: CancellationToken,
    ) -> Result<(), BootstrapError> {
        let identity = &settings.identity;
        let self_service = register_self(self.registry.as_ref(), identity)
            .await
            .map_err(restore_common::Error::from)?;

        let elector = Arc::new(
            LeaderElector::new(self.lock, &identity.host_identity, settings.election)
                .map_err(restore_common::Error::from)?,
        );

        if let Some(port) = self.probe_port {
            let listener = bind_probe_listener(port)
                .await
                .map_err(|source| BootstrapError::ProbeBind { port, source })?;
            let state = ProbeState::new(elector.identity(), elector.leader_flag());
            tokio::spawn(serve_probes(listener, probe_routes(state), shutdown.clone()));
        }

        info!(
            identity = %identity.host_identity,
            namespace = %identity.namespace,
            service_addr = %self_service.address(),
            "Registered, entering leader election"
        );

        // The election outlives the controller: the lease is only released
        // once the runner has stopped the controller.
        let election_stop = CancellationToken::new();
        let (events, election) = Arc::clone(&elector).spawn(election_stop.clone());
        let runner = LifecycleRunner::new(self.factory, settings.clone(), self_service);
        let result = runner.run(events, shutdown).await;

        election_stop.cancel();
        if tokio::time::timeout(RELEASE_TIMEOUT, election).await.is_err() {
            warn!("Leader election did not stop within timeout");
        }

        result.map_err(BootstrapError::from)
    }
}

/// Resolve settings, then connect and run
///
/// `connect` is only invoked once settings are valid; a configuration error
/// returns before any backend exists.
pub async fn run_operator<E, H, C, Fut>(
    args: &OperatorArgs,
    env: E,
    hostname: H,
    connect: C,
    shutdown: CancellationToken,
) -> Result<(), BootstrapError>
where
    E: Fn(&str) -> Option<String>,
    H: FnOnce() -> io::Result<OsString>,
    C: FnOnce(&OperatorSettings) -> Fut,
    Fut: Future<Output = Result<Bootstrap, BootstrapError>>,
{
    let settings = OperatorSettings::resolve(args, env, hostname)?;
    let bootstrap = connect(&settings).await?;
    bootstrap.run(settings, shutdown).await
}
