//! Lease lock backends
//!
//! A [`LeaseLock`] reads and writes a single leader record. Writes are
//! compare-and-swap on the record's resource version: an update based on a
//! stale read fails with [`WriteOutcome::Conflict`] instead of overwriting a
//! concurrent change.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

use super::LeaderElectionError;

/// Leader record stored in the lock
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Current holder; `None` or empty means released
    pub holder_identity: Option<String>,
    /// How long the holder may go without renewing
    pub lease_duration: Duration,
    /// When the current holder acquired the lease
    pub acquire_time: Option<DateTime<Utc>>,
    /// When the current holder last renewed
    pub renew_time: Option<DateTime<Utc>>,
    /// Number of holder changes
    pub lease_transitions: i32,
    /// Backend version used for compare-and-swap
    pub resource_version: Option<String>,
}

impl LeaseRecord {
    /// Holder identity, treating an empty string as no holder
    pub fn holder(&self) -> Option<&str> {
        self.holder_identity.as_deref().filter(|h| !h.is_empty())
    }

    /// Whether the record has been released by its last holder
    pub fn is_released(&self) -> bool {
        self.holder().is_none()
    }
}

/// Result of a create or update against the lock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied
    Written,
    /// Another writer got there first; re-read before retrying
    Conflict,
}

/// Trait abstracting the coordination backend holding the leader record
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Read the current record, `None` if the lock does not exist yet
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaderElectionError>;

    /// Create the lock with the given record
    async fn create(&self, record: &LeaseRecord) -> Result<WriteOutcome, LeaderElectionError>;

    /// Replace the record, conditional on its `resource_version`
    async fn update(&self, record: &LeaseRecord) -> Result<WriteOutcome, LeaderElectionError>;

    /// Human-readable lock location, e.g. `namespace/name`
    fn describe(&self) -> String;
}

/// [`LeaseLock`] backed by a coordination.k8s.io/v1 Lease
pub struct KubeLeaseLock {
    api: Api<Lease>,
    name: String,
    namespace: String,
}

impl KubeLeaseLock {
    /// Create a lock on the named Lease in `namespace`
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: record.resource_version.clone(),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder_identity.clone(),
                lease_duration_seconds: Some(record.lease_duration.as_secs() as i32),
                acquire_time: record.acquire_time.map(MicroTime),
                renew_time: record.renew_time.map(MicroTime),
                lease_transitions: Some(record.lease_transitions),
                ..Default::default()
            }),
        }
    }
}

/// Convert a Lease into a leader record
pub fn record_from_lease(lease: &Lease) -> LeaseRecord {
    let spec = lease.spec.clone().unwrap_or_default();
    LeaseRecord {
        holder_identity: spec.holder_identity,
        lease_duration: Duration::from_secs(
            spec.lease_duration_seconds.unwrap_or(0).max(0) as u64,
        ),
        acquire_time: spec.acquire_time.map(|t| t.0),
        renew_time: spec.renew_time.map(|t| t.0),
        lease_transitions: spec.lease_transitions.unwrap_or(0),
        resource_version: lease.metadata.resource_version.clone(),
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaderElectionError> {
        match self.api.get(&self.name).await {
            Ok(lease) => Ok(Some(record_from_lease(&lease))),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, record: &LeaseRecord) -> Result<WriteOutcome, LeaderElectionError> {
        let mut lease = self.to_lease(record);
        lease.metadata.resource_version = None;

        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(WriteOutcome::Written),
            // Someone else created it first
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(WriteOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, record: &LeaseRecord) -> Result<WriteOutcome, LeaderElectionError> {
        if record.resource_version.is_none() {
            return Err(LeaderElectionError::MissingResourceVersion {
                lock: self.describe(),
            });
        }

        match self
            .api
            .replace(&self.name, &PostParams::default(), &self.to_lease(record))
            .await
        {
            Ok(_) => Ok(WriteOutcome::Written),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(WriteOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_holder_is_released() {
        let record = LeaseRecord {
            holder_identity: Some(String::new()),
            ..Default::default()
        };
        assert!(record.is_released());
        assert_eq!(record.holder(), None);

        let held = LeaseRecord {
            holder_identity: Some("op-0".to_string()),
            ..Default::default()
        };
        assert!(!held.is_released());
        assert_eq!(held.holder(), Some("op-0"));
    }

    #[test]
    fn lease_conversion_keeps_spec_fields() {
        let now = Utc::now();
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some("etcd-restore-operator".to_string()),
                namespace: Some("etcd".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some("op-1".to_string()),
                lease_duration_seconds: Some(15),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(3),
                ..Default::default()
            }),
        };

        let record = record_from_lease(&lease);
        assert_eq!(record.holder(), Some("op-1"));
        assert_eq!(record.lease_duration, Duration::from_secs(15));
        assert_eq!(record.acquire_time, Some(now));
        assert_eq!(record.renew_time, Some(now));
        assert_eq!(record.lease_transitions, 3);
        assert_eq!(record.resource_version.as_deref(), Some("42"));
    }

    #[test]
    fn lease_without_spec_is_released() {
        let record = record_from_lease(&Lease::default());
        assert!(record.is_released());
        assert_eq!(record.lease_duration, Duration::ZERO);
        assert_eq!(record.lease_transitions, 0);
    }
}
