//! Self-registration Service
//!
//! Publishes a fixed-name, fixed-port Service in the operator namespace that
//! selects this deployment's pods by the labels of the current pod. Monitoring
//! and dependent components can then reach *a* replica without knowing which
//! one is leading.
//!
//! Registration runs once before election. Creating a Service that survived a
//! previous run is not an error.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, PostParams};
use kube::Client;
use thiserror::Error;
use tracing::{debug, info};

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

use crate::identity::Identity;
use crate::{SERVICE_NAME_FOR_MYSELF, SERVICE_PORT_FOR_MYSELF};

/// Self-registration errors
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Could not read this replica's own Pod
    #[error("failed to get pod {namespace}/{pod}: {message}")]
    PodLookup {
        /// Pod name
        pod: String,
        /// Pod namespace
        namespace: String,
        /// Underlying cause
        message: String,
    },

    /// Could not create the Service
    #[error("failed to create service {namespace}/{service}: {message}")]
    CreateService {
        /// Service name
        service: String,
        /// Service namespace
        namespace: String,
        /// Underlying cause
        message: String,
    },
}

/// Result of a Service create call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The Service was created by this call
    Created,
    /// A Service with the same name already existed
    AlreadyExists,
}

/// Trait abstracting the Core API calls needed for self-registration
///
/// Production code uses [`KubeServiceRegistry`]; tests substitute a mock.
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Labels on the named pod (empty map if the pod has none)
    async fn pod_labels(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<BTreeMap<String, String>, RegistrationError>;

    /// Create the Service, reporting whether it already existed
    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<CreateOutcome, RegistrationError>;
}

/// [`ServiceRegistry`] backed by the Kubernetes API
pub struct KubeServiceRegistry {
    client: Client,
}

impl KubeServiceRegistry {
    /// Create a registry using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceRegistry for KubeServiceRegistry {
    async fn pod_labels(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<BTreeMap<String, String>, RegistrationError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = api
            .get(pod_name)
            .await
            .map_err(|e| RegistrationError::PodLookup {
                pod: pod_name.to_string(),
                namespace: namespace.to_string(),
                message: e.to_string(),
            })?;
        Ok(pod.metadata.labels.unwrap_or_default())
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<CreateOutcome, RegistrationError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), service).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(RegistrationError::CreateService {
                service: service.metadata.name.clone().unwrap_or_default(),
                namespace: namespace.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

/// The Service this replica published for itself
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelfService {
    /// Service name
    pub name: String,
    /// Service namespace
    pub namespace: String,
    /// Service port
    pub port: u16,
}

impl SelfService {
    /// In-cluster address in `name.namespace:port` form
    pub fn address(&self) -> String {
        format!("{}.{}:{}", self.name, self.namespace, self.port)
    }
}

/// Build the self-registration Service for the given selector labels
pub fn build_self_service(namespace: &str, labels: BTreeMap<String, String>) -> Service {
    let port = SERVICE_PORT_FOR_MYSELF as i32;
    Service {
        metadata: ObjectMeta {
            name: Some(SERVICE_NAME_FOR_MYSELF.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some(format!("http-{}", SERVICE_NAME_FOR_MYSELF)),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Publish the self-registration Service for this replica
///
/// Idempotent: an existing Service from a previous run is accepted.
pub async fn register_self(
    registry: &dyn ServiceRegistry,
    identity: &Identity,
) -> Result<SelfService, RegistrationError> {
    let labels = registry
        .pod_labels(&identity.namespace, &identity.instance_name)
        .await?;
    let service = build_self_service(&identity.namespace, labels);

    match registry.create_service(&identity.namespace, &service).await? {
        CreateOutcome::Created => info!(
            service = SERVICE_NAME_FOR_MYSELF,
            namespace = %identity.namespace,
            port = SERVICE_PORT_FOR_MYSELF,
            "Created self-registration Service"
        ),
        CreateOutcome::AlreadyExists => debug!(
            service = SERVICE_NAME_FOR_MYSELF,
            namespace = %identity.namespace,
            "Self-registration Service already exists"
        ),
    }

    Ok(SelfService {
        name: SERVICE_NAME_FOR_MYSELF.to_string(),
        namespace: identity.namespace.clone(),
        port: SERVICE_PORT_FOR_MYSELF,
    })
}
