//! EtcdRestore Custom Resource Definition
//!
//! An EtcdRestore asks the operator to rebuild an etcd cluster from a backup.
//! Only the shape needed to watch and report on restores lives here.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Fully qualified CRD name
pub const ETCD_RESTORE_CRD_NAME: &str = "etcdrestores.etcd.database.coreos.com";

/// Where the backup to restore from is stored
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BackupStorageType {
    /// Amazon S3 or S3-compatible storage
    #[default]
    S3,
    /// Azure Blob Storage
    ABS,
    /// Google Cloud Storage
    GCS,
}

/// Reference to the etcd cluster being restored
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EtcdClusterRef {
    /// Name of the EtcdCluster in the restore's namespace
    pub name: String,
}

/// S3 backup location
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct S3RestoreSource {
    /// Full path of the backup, `<bucket>/<key>`
    pub path: String,

    /// Secret holding AWS credentials and config
    pub aws_secret: String,

    /// Custom endpoint for S3-compatible storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Use path-style addressing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_path_style: Option<bool>,
}

/// EtcdRestore specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "etcd.database.coreos.com",
    version = "v1beta2",
    kind = "EtcdRestore",
    plural = "etcdrestores",
    shortname = "etcdrestore",
    namespaced,
    status = "EtcdRestoreStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdRestoreSpec {
    /// Cluster to restore into
    pub etcd_cluster: EtcdClusterRef,

    /// Storage backend holding the backup
    #[serde(default)]
    pub backup_storage_type: BackupStorageType,

    /// S3 source (when backupStorageType is S3)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3RestoreSource>,
}

/// EtcdRestore status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdRestoreStatus {
    /// Whether the restore completed
    #[serde(default)]
    pub succeeded: bool,

    /// Failure reason, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
