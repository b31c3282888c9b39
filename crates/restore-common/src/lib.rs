//! Common building blocks for the etcd restore operator: replica identity,
//! self-registration, and lease-based leader election.

#![deny(missing_docs)]

pub mod error;
pub mod identity;
pub mod leader_election;
pub mod registration;
pub mod telemetry;

pub use error::Error;
pub use identity::Identity;
pub use leader_election::{ElectionConfig, LeaderElector, LeadershipEvent};
pub use registration::SelfService;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable carrying the namespace the operator pod runs in
pub const ENV_OPERATOR_POD_NAMESPACE: &str = "MY_POD_NAMESPACE";

/// Environment variable carrying the operator pod's own name
pub const ENV_OPERATOR_POD_NAME: &str = "MY_POD_NAME";

/// Name of the Service each replica registers for itself
pub const SERVICE_NAME_FOR_MYSELF: &str = "etcd-restore-operator";

/// Port exposed by the self-registered Service
pub const SERVICE_PORT_FOR_MYSELF: u16 = 19999;

/// Name of the Lease used for leader election
pub const LEADER_LEASE_NAME: &str = "etcd-restore-operator";

/// Field manager for server-side apply and patches
pub const FIELD_MANAGER: &str = "etcd-restore-operator";
