// Kubernetes Cluster
// Live cluster access through the kube client: resource submission, phases, logs and projects

use super::{name_of, namespace_of, Cluster};
use crate::error::ClusterError;
use crate::lifecycle::ProjectLoader;
use crate::models::{Phase, Project, ResourceSpec, UnitRef};
use crate::watcher::{LogReader, PhaseReader, PhaseStream, PhaseSubscriber};

use async_trait::async_trait;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, LogParams, PostParams, WatchEvent, WatchParams};
use kube::Client;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

fn cluster_error(kind: &'static str, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) if response.code == 404 => ClusterError::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(response) if (400..500).contains(&response.code) => {
            ClusterError::Rejected(format!("{} '{}': {}", kind, name, response.message))
        }
        other => ClusterError::Request(other.to_string()),
    }
}

/// Phase of a pod as reported by its status; a pod without status is pending
fn pod_phase(pod: &Pod) -> Phase {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .map(Phase::from_pod_phase)
        .unwrap_or(Phase::Pending)
}

/// Cluster backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the in-cluster or local kubeconfig
    pub async fn connect() -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Request(e.to_string()))?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn create_secret(&self, secret: &Secret) -> Result<(), ClusterError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace_of(&secret.metadata));
        api.create(&PostParams::default(), secret)
            .await
            .map(|_| ())
            .map_err(|e| cluster_error("Secret", name_of(&secret.metadata), e))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<(), ClusterError> {
        self.pods(namespace_of(&pod.metadata))
            .create(&PostParams::default(), pod)
            .await
            .map(|_| ())
            .map_err(|e| cluster_error("Pod", name_of(&pod.metadata), e))
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, ClusterError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| cluster_error("PersistentVolumeClaim", name, e))
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<(), ClusterError> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), namespace_of(&claim.metadata));
        api.create(&PostParams::default(), claim)
            .await
            .map(|_| ())
            .map_err(|e| cluster_error("PersistentVolumeClaim", name_of(&claim.metadata), e))
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| cluster_error("PersistentVolumeClaim", name, e))
    }
}

#[async_trait]
impl PhaseReader for KubeCluster {
    async fn read_phase(&self, unit: &UnitRef) -> Result<Option<Phase>, ClusterError> {
        let pod = self
            .pods(&unit.namespace)
            .get_opt(&unit.name)
            .await
            .map_err(|e| cluster_error("Pod", &unit.name, e))?;
        Ok(pod.as_ref().map(pod_phase))
    }
}

#[async_trait]
impl PhaseSubscriber for KubeCluster {
    async fn subscribe(&self, unit: &UnitRef) -> Result<PhaseStream, ClusterError> {
        let api = self.pods(&unit.namespace);
        let params = WatchParams::default().fields(&format!("metadata.name={}", unit.name));
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let events = match api.watch(&params, "0").await {
                Ok(events) => events,
                Err(e) => {
                    let _ = tx.send(Err(ClusterError::Stream(e.to_string())));
                    return;
                }
            };
            futures_util::pin_mut!(events);

            while let Some(event) = events.next().await {
                let item = match event {
                    Ok(WatchEvent::Added(pod)) | Ok(WatchEvent::Modified(pod)) => {
                        Some(Ok(pod_phase(&pod)))
                    }
                    Ok(WatchEvent::Deleted(_)) => {
                        Some(Err(ClusterError::Stream("pod was deleted".to_string())))
                    }
                    Ok(WatchEvent::Bookmark(_)) => None,
                    Ok(WatchEvent::Error(response)) => {
                        Some(Err(ClusterError::Stream(response.message)))
                    }
                    Err(e) => Some(Err(ClusterError::Stream(e.to_string()))),
                };
                if let Some(item) = item {
                    if tx.send(item).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[async_trait]
impl LogReader for KubeCluster {
    async fn read_logs(&self, unit: &UnitRef) -> Result<String, ClusterError> {
        let params = LogParams {
            container: Some(unit.job.clone()),
            ..Default::default()
        };
        self.pods(&unit.namespace)
            .logs(&unit.name, &params)
            .await
            .map_err(|e| cluster_error("Pod", &unit.name, e))
    }
}

/// Loads projects from the Secret named after the project id
#[derive(Clone)]
pub struct KubeProjectLoader {
    client: Client,
    namespace: String,
}

impl KubeProjectLoader {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl ProjectLoader for KubeProjectLoader {
    async fn load(&self, project_id: &str) -> Result<Project, ClusterError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = api
            .get(project_id)
            .await
            .map_err(|e| cluster_error("Project", project_id, e))?;

        let project = project_from_secret(
            project_id,
            &secret.data.unwrap_or_default(),
            &self.namespace,
        )?;
        tracing::debug!(project = %project_id, namespace = %project.namespace, "loaded project");
        Ok(project)
    }
}

/// Decode a project from its Secret data. Jobs run in `default_namespace` unless the secret names one.
pub fn project_from_secret(
    id: &str,
    data: &BTreeMap<String, ByteString>,
    default_namespace: &str,
) -> Result<Project, ClusterError> {
    let get = |key: &str| {
        data.get(key)
            .map(|value| String::from_utf8_lossy(&value.0).trim().to_string())
            .filter(|value| !value.is_empty())
    };
    let flag = |key: &str| get(key).map(|v| v == "true").unwrap_or(false);

    let mut project = Project::new(id, get("name").unwrap_or_else(|| id.to_string()));
    project.namespace = get("namespace").unwrap_or_else(|| default_namespace.to_string());
    project.repo.clone_url = get("cloneURL");
    project.repo.ssh_key = get("sshKey");
    project.repo.token = get("token");
    project.cache_storage_class = get("kubernetes.cacheStorageClass");
    project.build_storage_class = get("kubernetes.buildStorageClass");
    project.allow_privileged_jobs = flag("allowPrivilegedJobs");
    project.allow_host_mounts = flag("allowHostMounts");

    if let Some(image) = get("vcsSidecar") {
        project.sidecar.image = image;
    }
    project.sidecar.requests = ResourceSpec {
        cpu: get("vcsSidecarResources.requests.cpu"),
        memory: get("vcsSidecarResources.requests.memory"),
    };
    project.sidecar.limits = ResourceSpec {
        cpu: get("vcsSidecarResources.limits.cpu"),
        memory: get("vcsSidecarResources.limits.memory"),
    };

    if let Some(secrets) = get("secrets") {
        project.secrets = serde_json::from_str::<HashMap<String, String>>(&secrets).map_err(
            |e| ClusterError::Rejected(format!("project '{}' has invalid secrets: {}", id, e)),
        )?;
    }

    Ok(project)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::project::DEFAULT_SIDECAR_IMAGE;
    use k8s_openapi::api::core::v1::PodStatus;

    fn data(entries: &[(&str, &str)]) -> BTreeMap<String, ByteString> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
            .collect()
    }

    #[test]
    fn test_project_from_secret() {
        let project = project_from_secret(
            "p1",
            &data(&[
                ("name", "org/repo"),
                ("cloneURL", "https://git.example/org/repo.git"),
                ("namespace", "ci"),
                ("secrets", r#"{"API_KEY":"abc"}"#),
                ("allowPrivilegedJobs", "true"),
                ("kubernetes.cacheStorageClass", "nfs"),
            ]),
            "ferry",
        )
        .unwrap();

        assert_eq!(project.name, "org/repo");
        assert_eq!(project.namespace, "ci");
        assert_eq!(project.clone_url(), Some("https://git.example/org/repo.git"));
        assert_eq!(project.secrets["API_KEY"], "abc");
        assert!(project.allow_privileged_jobs);
        assert!(!project.allow_host_mounts);
        assert_eq!(project.cache_storage_class.as_deref(), Some("nfs"));
        assert_eq!(project.sidecar.image, DEFAULT_SIDECAR_IMAGE);
    }

    #[test]
    fn test_project_with_bad_secrets_json() {
        let err =
            project_from_secret("p1", &data(&[("secrets", "{not json")]), "ferry").unwrap_err();
        assert!(matches!(err, ClusterError::Rejected(_)));
    }

    #[test]
    fn test_project_namespace_falls_back() {
        let project = project_from_secret("p1", &data(&[]), "ferry").unwrap();
        assert_eq!(project.namespace, "ferry");
        assert_eq!(project.name, "p1");
    }

    #[test]
    fn test_pod_phase_defaults_to_pending() {
        assert_eq!(pod_phase(&Pod::default()), Phase::Pending);

        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Failed".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(pod_phase(&pod), Phase::Failed);
    }
}
