// Cache and Build Volumes
// Check-then-create for per-job cache claims, create/destroy for the run-wide build claim

use crate::cluster::Cluster;
use crate::error::{CacheError, ClusterError};
use crate::models::{Event, Project};

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default size of the run-wide build volume
pub const DEFAULT_BUILD_STORAGE_SIZE: &str = "50Mi";

/// Cache claim name: project name with `/` and `.` replaced by `-`, then the job name, lower-cased
pub fn cache_volume_name(project_name: &str, job_name: &str) -> String {
    let project = project_name.replace(['/', '.'], "-");
    format!("{}-{}", project, job_name).to_lowercase()
}

/// Build claim name for a run
pub fn build_volume_name(run_id: &str) -> String {
    format!("build-{}", run_id).to_lowercase()
}

/// Resolve a storage class: override, then configured default, then unset
pub fn resolve_storage_class(candidates: &[Option<&str>]) -> Option<String> {
    candidates
        .iter()
        .flatten()
        .find(|class| !class.trim().is_empty())
        .map(|class| class.to_string())
}

/// A read-write-many claim of the given size
pub fn claim_spec(
    name: &str,
    namespace: &str,
    size: &str,
    storage_class: Option<String>,
    labels: BTreeMap<String, String>,
) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(size.to_string()));

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            storage_class_name: storage_class,
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Outcome of ensuring a cache claim exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// An existing claim was found and left untouched
    Reused,
    /// No claim existed and one was created
    Created,
}

/// Ensures job cache claims exist before the job's unit is submitted
#[derive(Clone)]
pub struct CacheVolumeManager {
    cluster: Arc<dyn Cluster>,
}

impl CacheVolumeManager {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster }
    }

    /// Reuse the claim if it exists, create it on not-found; any other read error is fatal
    pub async fn ensure(&self, claim: &PersistentVolumeClaim) -> Result<CacheStatus, CacheError> {
        let name = claim.metadata.name.clone().unwrap_or_default();
        let namespace = claim.metadata.namespace.as_deref().unwrap_or("default");

        match self.cluster.get_claim(namespace, &name).await {
            Ok(_) => {
                tracing::debug!(claim = %name, "reusing cache volume");
                Ok(CacheStatus::Reused)
            }
            Err(err) if err.is_not_found() => {
                self.cluster
                    .create_claim(claim)
                    .await
                    .map_err(|source| CacheError::Create {
                        claim: name.clone(),
                        source,
                    })?;
                tracing::info!(claim = %name, "created cache volume");
                Ok(CacheStatus::Created)
            }
            Err(source) => Err(CacheError::Check { claim: name, source }),
        }
    }
}

/// Run-scoped storage shared by every job of one run
#[async_trait::async_trait]
pub trait BuildStorage: Send + Sync {
    /// Create the run's volume; always a fresh claim
    async fn provision(&self, event: &Event, project: &Project) -> Result<(), ClusterError>;

    /// Destroy the run's volume
    async fn destroy(&self, event: &Event, project: &Project) -> Result<(), ClusterError>;
}

/// Build storage backed by a persistent volume claim
pub struct ClaimBuildStorage {
    cluster: Arc<dyn Cluster>,
    size: String,
    default_storage_class: Option<String>,
}

impl ClaimBuildStorage {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self {
            cluster,
            size: DEFAULT_BUILD_STORAGE_SIZE.to_string(),
            default_storage_class: None,
        }
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = size.into();
        self
    }

    pub fn with_default_storage_class(mut self, class: Option<String>) -> Self {
        self.default_storage_class = class;
        self
    }
}

#[async_trait::async_trait]
impl BuildStorage for ClaimBuildStorage {
    async fn provision(&self, event: &Event, project: &Project) -> Result<(), ClusterError> {
        let name = build_volume_name(event.run_id());
        let storage_class = resolve_storage_class(&[
            project.build_storage_class.as_deref(),
            self.default_storage_class.as_deref(),
        ]);

        let mut labels = BTreeMap::new();
        labels.insert("heritage".to_string(), "ferry".to_string());
        labels.insert("component".to_string(), "build-storage".to_string());
        labels.insert("project".to_string(), project.id.clone());
        labels.insert("worker".to_string(), event.run_id().to_lowercase());

        let claim = claim_spec(&name, &project.namespace, &self.size, storage_class, labels);
        self.cluster.create_claim(&claim).await?;
        tracing::info!(claim = %name, size = %self.size, "provisioned build volume");
        Ok(())
    }

    async fn destroy(&self, event: &Event, project: &Project) -> Result<(), ClusterError> {
        let name = build_volume_name(event.run_id());
        self.cluster.delete_claim(&project.namespace, &name).await?;
        tracing::info!(claim = %name, "destroyed build volume");
        Ok(())
    }
}

/// Build storage for backends that manage no cluster volumes
pub struct NoBuildStorage;

#[async_trait::async_trait]
impl BuildStorage for NoBuildStorage {
    async fn provision(&self, _event: &Event, _project: &Project) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn destroy(&self, _event: &Event, _project: &Project) -> Result<(), ClusterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;

    fn cache_claim(name: &str) -> PersistentVolumeClaim {
        claim_spec(name, "ci", "5Mi", None, BTreeMap::new())
    }

    #[test]
    fn test_cache_volume_name() {
        assert_eq!(cache_volume_name("a/b.c", "Build"), "a-b-c-build");
        assert_eq!(cache_volume_name("org/repo", "test"), "org-repo-test");
    }

    #[test]
    fn test_build_volume_name_is_lowercase() {
        assert_eq!(build_volume_name("01HXYZ"), "build-01hxyz");
    }

    #[test]
    fn test_storage_class_precedence() {
        assert_eq!(
            resolve_storage_class(&[Some("fast"), Some("project"), Some("default")]),
            Some("fast".to_string())
        );
        assert_eq!(
            resolve_storage_class(&[None, Some("project"), Some("default")]),
            Some("project".to_string())
        );
        assert_eq!(
            resolve_storage_class(&[None, None, Some("default")]),
            Some("default".to_string())
        );
        assert_eq!(resolve_storage_class(&[None, Some(""), None]), None);
    }

    #[test]
    fn test_claim_spec_shape() {
        let claim = claim_spec("c", "ci", "1Gi", Some("nfs".to_string()), BTreeMap::new());
        let spec = claim.spec.unwrap();

        assert_eq!(spec.access_modes.unwrap(), vec!["ReadWriteMany".to_string()]);
        assert_eq!(spec.storage_class_name.as_deref(), Some("nfs"));
        assert_eq!(
            spec.resources.unwrap().requests.unwrap()["storage"],
            Quantity("1Gi".to_string())
        );
    }

    #[tokio::test]
    async fn test_ensure_creates_then_reuses() {
        let cluster = Arc::new(MemoryCluster::new());
        let manager = CacheVolumeManager::new(cluster.clone());
        let claim = cache_claim("proj-build");

        assert_eq!(manager.ensure(&claim).await.unwrap(), CacheStatus::Created);
        assert_eq!(manager.ensure(&claim).await.unwrap(), CacheStatus::Reused);
        assert!(cluster.claim("proj-build").is_some());
    }

    #[tokio::test]
    async fn test_ensure_fails_on_non_not_found_error() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.fail_claim_reads("etcd unavailable");
        let manager = CacheVolumeManager::new(cluster.clone());

        let err = manager.ensure(&cache_claim("proj-build")).await.unwrap_err();
        assert!(matches!(err, CacheError::Check { .. }));
        assert!(cluster.claim("proj-build").is_none());
    }

    #[tokio::test]
    async fn test_build_storage_create_and_destroy() {
        let cluster = Arc::new(MemoryCluster::new());
        let storage = ClaimBuildStorage::new(cluster.clone())
            .with_default_storage_class(Some("standard".to_string()));
        let event = Event::new("RUN1", "github", "push");
        let project = Project::new("p1", "org/repo").with_namespace("ci");

        storage.provision(&event, &project).await.unwrap();
        let claim = cluster.claim("build-run1").unwrap();
        assert_eq!(
            claim.spec.unwrap().storage_class_name.as_deref(),
            Some("standard")
        );

        storage.destroy(&event, &project).await.unwrap();
        assert!(cluster.claim("build-run1").is_none());
        assert_eq!(cluster.claim_deletes(), 1);
    }
}
