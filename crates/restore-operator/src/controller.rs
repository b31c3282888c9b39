//! Controller body run while this replica leads
//!
//! The lifecycle runner only knows the [`Controller`] and
//! [`ControllerFactory`] traits. [`RestoreController`] is the production body:
//! it installs the EtcdRestore CRD when asked to, then watches EtcdRestore
//! objects until its scope is cancelled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller as KubeController;
use kube::{Client, CustomResourceExt, ResourceExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use restore_common::FIELD_MANAGER;

use crate::config::ControllerConfig;
use crate::crd::{EtcdRestore, ETCD_RESTORE_CRD_NAME};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Requeue delay after a failed reconcile
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Controller errors
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// CRD could not be installed
    #[error("failed to install {crd} CRD: {message}")]
    CrdInstall {
        /// CRD name
        crd: String,
        /// Underlying cause
        message: String,
    },

    /// The watch ended although nobody cancelled it
    #[error("{0} watch ended unexpectedly")]
    WatchEnded(String),
}

/// A controller body started once per leadership term
#[async_trait]
pub trait Controller: Send {
    /// Run until `cancel` fires or a fatal error occurs
    ///
    /// Must return promptly once `cancel` is cancelled.
    async fn start(self: Box<Self>, cancel: CancellationToken) -> Result<(), ControllerError>;
}

/// Builds a fresh controller for each leadership term
pub trait ControllerFactory: Send + Sync {
    /// Create a controller for the given configuration
    fn create(&self, config: ControllerConfig) -> Box<dyn Controller>;
}

/// Factory for [`RestoreController`]
pub struct RestoreControllerFactory {
    client: Client,
}

impl RestoreControllerFactory {
    /// Create a factory using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ControllerFactory for RestoreControllerFactory {
    fn create(&self, config: ControllerConfig) -> Box<dyn Controller> {
        Box::new(RestoreController {
            client: self.client.clone(),
            config,
        })
    }
}

/// Watches EtcdRestore resources
pub struct RestoreController {
    client: Client,
    config: ControllerConfig,
}

/// Shared state for reconciles
pub struct ReconcileContext {
    /// Configuration of the current leadership term
    pub config: ControllerConfig,
}

impl RestoreController {
    fn restores_api(&self) -> Api<EtcdRestore> {
        if self.config.cluster_wide {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.config.namespace)
        }
    }
}

#[async_trait]
impl Controller for RestoreController {
    async fn start(self: Box<Self>, cancel: CancellationToken) -> Result<(), ControllerError> {
        if self.config.create_crd {
            ensure_crd_installed(&self.client).await?;
        }

        info!(
            namespace = %self.config.namespace,
            cluster_wide = self.config.cluster_wide,
            service_addr = %self.config.self_service_address,
            "Starting EtcdRestore controller"
        );

        let ctx = Arc::new(ReconcileContext {
            config: self.config.clone(),
        });
        let watch = KubeController::new(
            self.restores_api(),
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            match result {
                Ok((obj, action)) => debug!(restore = %obj.name, ?action, "Restore reconciliation completed"),
                Err(e) => error!(error = ?e, "Restore reconciliation error"),
            }
            std::future::ready(())
        });

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("EtcdRestore controller cancelled");
                Ok(())
            }
            _ = watch => Err(ControllerError::WatchEnded("EtcdRestore".to_string())),
        }
    }
}

/// Install the EtcdRestore CRD using server-side apply
pub async fn ensure_crd_installed(client: &Client) -> Result<(), ControllerError> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    info!("Installing {} CRD...", ETCD_RESTORE_CRD_NAME);
    crds.patch(ETCD_RESTORE_CRD_NAME, &params, &Patch::Apply(&EtcdRestore::crd()))
        .await
        .map_err(|e| ControllerError::CrdInstall {
            crd: ETCD_RESTORE_CRD_NAME.to_string(),
            message: e.to_string(),
        })?;
    info!("{} CRD installed/updated", ETCD_RESTORE_CRD_NAME);
    Ok(())
}

/// Record an observed EtcdRestore
///
/// Performing the restore is not part of this operator's bootstrap.
pub async fn reconcile(
    restore: Arc<EtcdRestore>,
    ctx: Arc<ReconcileContext>,
) -> Result<Action, ControllerError> {
    let done = restore.status.as_ref().is_some_and(|s| s.succeeded);
    info!(
        restore = %restore.name_any(),
        namespace = %restore.namespace().unwrap_or_default(),
        cluster = %restore.spec.etcd_cluster.name,
        storage = ?restore.spec.backup_storage_type,
        succeeded = done,
        service_addr = %ctx.config.self_service_address,
        "Observed EtcdRestore"
    );
    Ok(Action::await_change())
}

/// Requeue failed reconciles after a fixed delay
pub fn error_policy(
    restore: Arc<EtcdRestore>,
    error: &ControllerError,
    _ctx: Arc<ReconcileContext>,
) -> Action {
    warn!(restore = %restore.name_any(), error = %error, "Reconcile failed, requeueing");
    Action::requeue(ERROR_REQUEUE)
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;

    use super::*;
    use crate::crd::{EtcdClusterRef, EtcdRestoreSpec};

    fn context() -> Arc<ReconcileContext> {
        Arc::new(ReconcileContext {
            config: ControllerConfig {
                namespace: "etcd".to_string(),
                cluster_wide: false,
                create_crd: true,
                self_service_address: "etcd-restore-operator.etcd:19999".to_string(),
            },
        })
    }

    fn restore() -> Arc<EtcdRestore> {
        Arc::new(EtcdRestore {
            metadata: ObjectMeta {
                name: Some("restore-1".to_string()),
                namespace: Some("etcd".to_string()),
                ..Default::default()
            },
            spec: EtcdRestoreSpec {
                etcd_cluster: EtcdClusterRef {
                    name: "example".to_string(),
                },
                backup_storage_type: Default::default(),
                s3: None,
            },
            status: None,
        })
    }

    #[tokio::test]
    async fn reconcile_waits_for_changes() {
        let action = reconcile(restore(), context()).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn error_policy_requeues() {
        let err = ControllerError::WatchEnded("EtcdRestore".to_string());
        let action = error_policy(restore(), &err, context());
        assert_eq!(action, Action::requeue(ERROR_REQUEUE));
    }

    #[test]
    fn crd_install_error_names_the_crd() {
        let err = ControllerError::CrdInstall {
            crd: ETCD_RESTORE_CRD_NAME.to_string(),
            message: "forbidden".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to install etcdrestores.etcd.database.coreos.com CRD: forbidden"
        );
    }
}
