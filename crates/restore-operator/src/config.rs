//! Operator configuration
//!
//! Command-line flags and the replica identity are combined once at startup
//! into an immutable [`OperatorSettings`]. Every component receives what it
//! needs from that value; nothing reads process-wide state later.

use std::ffi::OsString;
use std::io;
use std::time::Duration;

use clap::{ArgAction, Parser};

use restore_common::identity::resolve_identity;
use restore_common::{ElectionConfig, Identity, SelfService};

/// etcd restore operator
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "etcd-restore-operator", version, about, long_about = None)]
pub struct OperatorArgs {
    /// Install the EtcdRestore CRD before running the controller
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    pub create_crd: bool,

    /// Watch EtcdRestore resources in all namespaces instead of only our own
    #[arg(
        long,
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    pub cluster_wide: bool,

    /// Seconds a lease stays valid without renewal
    #[arg(long, env = "RESTORE_LEASE_DURATION_SECS", default_value_t = 15)]
    pub lease_duration_secs: u64,

    /// Seconds a leader may go without renewing before it steps down
    #[arg(long, env = "RESTORE_RENEW_DEADLINE_SECS", default_value_t = 10)]
    pub renew_deadline_secs: u64,

    /// Seconds between acquire or renew attempts
    #[arg(long, env = "RESTORE_RETRY_PERIOD_SECS", default_value_t = 2)]
    pub retry_period_secs: u64,

    /// Print the EtcdRestore CRD manifest and exit
    #[arg(long)]
    pub crd: bool,
}

impl OperatorArgs {
    /// Election timing from the flags (not yet validated)
    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            renew_deadline: Duration::from_secs(self.renew_deadline_secs),
            retry_period: Duration::from_secs(self.retry_period_secs),
        }
    }
}

/// Process-wide settings, resolved once at startup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorSettings {
    /// Who this replica is
    pub identity: Identity,
    /// Watch all namespaces
    pub cluster_wide: bool,
    /// Install the CRD on leadership
    pub create_crd: bool,
    /// Election timing
    pub election: ElectionConfig,
}

impl OperatorSettings {
    /// Build settings from flags and a resolved identity
    pub fn new(args: &OperatorArgs, identity: Identity) -> Result<Self, restore_common::Error> {
        let election = args.election_config();
        election
            .validate()
            .map_err(|e| restore_common::Error::config(e.to_string()))?;

        Ok(Self {
            identity,
            cluster_wide: args.cluster_wide,
            create_crd: args.create_crd,
            election,
        })
    }

    /// Resolve identity from `env` and `hostname`, then build settings
    ///
    /// Performs no network access; every error here is a configuration error.
    pub fn resolve<E, H>(
        args: &OperatorArgs,
        env: E,
        hostname: H,
    ) -> Result<Self, restore_common::Error>
    where
        E: Fn(&str) -> Option<String>,
        H: FnOnce() -> io::Result<OsString>,
    {
        let identity = resolve_identity(env, hostname)?;
        Self::new(args, identity)
    }

    /// Controller configuration for one leadership term
    pub fn controller_config(&self, self_service: &SelfService) -> ControllerConfig {
        ControllerConfig {
            namespace: self.identity.namespace.clone(),
            cluster_wide: self.cluster_wide,
            create_crd: self.create_crd,
            self_service_address: self_service.address(),
        }
    }
}

/// Configuration handed to the controller each time leadership is acquired
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Operator namespace
    pub namespace: String,
    /// Watch all namespaces
    pub cluster_wide: bool,
    /// Install the CRD before watching
    pub create_crd: bool,
    /// In-cluster address of the self-registered Service
    pub self_service_address: String,
}
