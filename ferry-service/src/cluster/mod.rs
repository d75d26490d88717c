// Cluster Access
// The orchestrator operations the worker depends on, with a live and an in-memory implementation

pub mod kubernetes;
pub mod memory;

pub use kubernetes::{project_from_secret, KubeCluster, KubeProjectLoader};
pub use memory::{MemoryCluster, StreamItem};

use crate::error::ClusterError;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Resource operations used to submit execution units and manage volumes
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn create_secret(&self, secret: &Secret) -> Result<(), ClusterError>;

    async fn create_pod(&self, pod: &Pod) -> Result<(), ClusterError>;

    /// Fetch a claim. A missing claim is reported as [`ClusterError::NotFound`].
    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, ClusterError>;

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<(), ClusterError>;

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}

/// Namespace recorded on a resource's metadata
pub(crate) fn namespace_of(metadata: &ObjectMeta) -> &str {
    metadata.namespace.as_deref().unwrap_or("default")
}

/// Name recorded on a resource's metadata
pub(crate) fn name_of(metadata: &ObjectMeta) -> &str {
    metadata.name.as_deref().unwrap_or_default()
}
