// Project Model
// Per-project settings loaded once per run and read-only thereafter

use crate::models::job::ResourceSpec;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default image for the source-retrieval init container
pub const DEFAULT_SIDECAR_IMAGE: &str = "ferry/git-sidecar:latest";

/// A project owns the secrets, repository and policy flags its jobs run under
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Project {
    pub id: String,

    /// Human name, usually "org/repo"
    pub name: String,

    /// Cluster namespace jobs are submitted to
    pub namespace: String,

    pub secrets: HashMap<String, String>,

    pub repo: Repository,

    pub sidecar: SidecarConfig,

    /// Storage class override for job cache volumes
    pub cache_storage_class: Option<String>,

    /// Storage class override for the run-wide build volume
    pub build_storage_class: Option<String>,

    pub allow_privileged_jobs: bool,

    pub allow_host_mounts: bool,
}

impl Default for Project {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            namespace: "default".to_string(),
            secrets: HashMap::new(),
            repo: Repository::default(),
            sidecar: SidecarConfig::default(),
            cache_storage_class: None,
            build_storage_class: None,
            allow_privileged_jobs: false,
            allow_host_mounts: false,
        }
    }
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Clone URL if one is configured and non-empty
    pub fn clone_url(&self) -> Option<&str> {
        self.repo
            .clone_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
    }
}

/// Repository the project's jobs may fetch source from
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Repository {
    pub clone_url: Option<String>,
    pub ssh_key: Option<String>,
    pub token: Option<String>,
}

/// Source-retrieval sidecar settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SidecarConfig {
    pub image: String,
    pub requests: ResourceSpec,
    pub limits: ResourceSpec,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_SIDECAR_IMAGE.to_string(),
            requests: ResourceSpec::default(),
            limits: ResourceSpec::default(),
        }
    }
}
