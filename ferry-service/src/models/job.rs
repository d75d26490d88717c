// Job Declaration Models
// Jobs, containers and environment values as authored by handler scripts

use crate::error::BuildError;

use k8s_openapi::api::core::v1::{Volume, VolumeMount};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Longest accepted job name (DNS label limit)
pub const MAX_JOB_NAME_LEN: usize = 63;

/// Shell used to run generated task scripts
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Timeout applied when a job does not declare one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Validate a job name: lowercase alphanumerics and hyphens, starting and
/// ending with an alphanumeric, at most [`MAX_JOB_NAME_LEN`] characters.
pub fn validate_job_name(name: &str) -> Result<(), BuildError> {
    let invalid = |reason: &str| BuildError::InvalidJobName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_JOB_NAME_LEN {
        return Err(invalid(&format!(
            "name is longer than {} characters",
            MAX_JOB_NAME_LEN
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(invalid(&format!("character '{}' is not allowed", c)));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("name must start and end with a letter or digit"));
    }
    Ok(())
}

/// Image pull policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ImagePullPolicy {
    /// Always pull the image
    Always,
    /// Pull only if not present on the node
    #[default]
    IfNotPresent,
    /// Never pull (must be present on the node)
    Never,
}

impl ImagePullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImagePullPolicy::Always => "Always",
            ImagePullPolicy::IfNotPresent => "IfNotPresent",
            ImagePullPolicy::Never => "Never",
        }
    }
}

/// An environment value: a literal string or a reference resolved by the cluster.
///
/// In YAML a literal is a plain string; references use the Kubernetes shape
/// `{secretKeyRef: {name, key}}` or `{configMapKeyRef: {name, key}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "EnvValueRepr", into = "EnvValueRepr")]
pub enum EnvValue {
    Literal(String),
    SecretRef { name: String, key: String },
    ConfigMapRef { name: String, key: String },
}

impl EnvValue {
    pub fn literal(value: impl Into<String>) -> Self {
        EnvValue::Literal(value.into())
    }

    pub fn secret(name: impl Into<String>, key: impl Into<String>) -> Self {
        EnvValue::SecretRef {
            name: name.into(),
            key: key.into(),
        }
    }

    pub fn config_map(name: impl Into<String>, key: impl Into<String>) -> Self {
        EnvValue::ConfigMapRef {
            name: name.into(),
            key: key.into(),
        }
    }
}

impl From<&str> for EnvValue {
    fn from(value: &str) -> Self {
        EnvValue::Literal(value.to_string())
    }
}

impl From<String> for EnvValue {
    fn from(value: String) -> Self {
        EnvValue::Literal(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyRef {
    name: String,
    key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum EnvValueRepr {
    Literal(String),
    Secret {
        #[serde(rename = "secretKeyRef")]
        secret_key_ref: KeyRef,
    },
    ConfigMap {
        #[serde(rename = "configMapKeyRef")]
        config_map_key_ref: KeyRef,
    },
}

impl From<EnvValueRepr> for EnvValue {
    fn from(repr: EnvValueRepr) -> Self {
        match repr {
            EnvValueRepr::Literal(value) => EnvValue::Literal(value),
            EnvValueRepr::Secret { secret_key_ref: r } => EnvValue::SecretRef {
                name: r.name,
                key: r.key,
            },
            EnvValueRepr::ConfigMap {
                config_map_key_ref: r,
            } => EnvValue::ConfigMapRef {
                name: r.name,
                key: r.key,
            },
        }
    }
}

impl From<EnvValue> for EnvValueRepr {
    fn from(value: EnvValue) -> Self {
        match value {
            EnvValue::Literal(value) => EnvValueRepr::Literal(value),
            EnvValue::SecretRef { name, key } => EnvValueRepr::Secret {
                secret_key_ref: KeyRef { name, key },
            },
            EnvValue::ConfigMapRef { name, key } => EnvValueRepr::ConfigMap {
                config_map_key_ref: KeyRef { name, key },
            },
        }
    }
}

/// A container inside a job's execution unit
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Container {
    pub image: String,
    pub image_pull_policy: ImagePullPolicy,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, EnvValue>,
    pub working_directory: Option<String>,
    /// Where the shared source volume is mounted (defaults to /src)
    pub source_mount_path: Option<String>,
    pub privileged: bool,
}

impl Container {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }
}

/// CPU and memory quantities (e.g. "500m", "256Mi")
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ResourceSpec {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

impl ResourceSpec {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }
}

/// Resource requests and limits for the primary container
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Resources {
    pub requests: ResourceSpec,
    pub limits: ResourceSpec,
}

/// Host placement constraints
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HostSpec {
    /// Required node OS ("linux", "windows")
    pub os: Option<String>,
    /// Run on this specific node
    pub node_name: Option<String>,
    pub node_selector: BTreeMap<String, String>,
}

/// Persistent cache reused across runs of the same job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub size: String,
    pub path: String,
    pub storage_class: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size: "5Mi".to_string(),
            path: "/mnt/ferry/cache".to_string(),
            storage_class: None,
        }
    }
}

/// Participation in the run-wide shared build volume
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/mnt/ferry/share".to_string(),
        }
    }
}

/// A unit of work declared by a handler script
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Job {
    pub name: String,

    /// Primary container
    pub container: Container,

    /// Sidecar containers keyed by container name
    pub sidecars: BTreeMap<String, Container>,

    /// Shell commands turned into a generated script
    pub tasks: Vec<String>,

    pub shell: String,

    #[serde(with = "duration_secs", rename = "timeoutSeconds")]
    pub timeout: Duration,

    pub host: HostSpec,

    pub cache: CacheConfig,

    pub storage: StorageConfig,

    /// Mount the host docker socket (requires a project allowing host mounts)
    pub docker: bool,

    pub volumes: Vec<Volume>,

    pub volume_mounts: Vec<VolumeMount>,

    pub resources: Resources,

    pub service_account: Option<String>,

    pub image_pull_secrets: Vec<String>,

    /// Fetch the project repository into the unit before it runs
    pub use_source: bool,

    pub privileged: bool,

    /// Treat status-stream disruptions as best-effort success
    pub fallible: bool,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            name: String::new(),
            container: Container::default(),
            sidecars: BTreeMap::new(),
            tasks: Vec::new(),
            shell: DEFAULT_SHELL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            host: HostSpec::default(),
            cache: CacheConfig::default(),
            storage: StorageConfig::default(),
            docker: false,
            volumes: Vec::new(),
            volume_mounts: Vec::new(),
            resources: Resources::default(),
            service_account: None,
            image_pull_secrets: Vec::new(),
            use_source: true,
            privileged: false,
            fallible: false,
        }
    }
}

impl Job {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            container: Container::new(image),
            ..Default::default()
        }
    }

    pub fn with_tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tasks = tasks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.container.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<EnvValue>) -> Self {
        self.container.env.insert(key.into(), value.into());
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sidecar(mut self, name: impl Into<String>, container: Container) -> Self {
        self.sidecars.insert(name.into(), container);
        self
    }

    pub fn fallible(mut self) -> Self {
        self.fallible = true;
        self
    }

    pub fn validate(&self) -> Result<(), BuildError> {
        validate_job_name(&self.name)?;
        for name in self.sidecars.keys() {
            validate_job_name(name)?;
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_job_names() {
        let longest = "a".repeat(MAX_JOB_NAME_LEN);
        for name in ["build", "unit-tests", "a", "job1", longest.as_str()] {
            assert!(validate_job_name(name).is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn test_invalid_job_names() {
        let too_long = "a".repeat(MAX_JOB_NAME_LEN + 1);
        for name in ["", "-build", "build-", "Build", "unit_tests", "a b", too_long.as_str()] {
            assert!(
                matches!(
                    validate_job_name(name),
                    Err(BuildError::InvalidJobName { .. })
                ),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_job_defaults() {
        let job = Job::new("build", "alpine:3.19");
        assert_eq!(job.shell, DEFAULT_SHELL);
        assert_eq!(job.timeout, DEFAULT_TIMEOUT);
        assert!(job.use_source);
        assert!(!job.cache.enabled);
        assert_eq!(job.cache.size, "5Mi");
    }

    #[test]
    fn test_env_value_yaml_forms() {
        let yaml = r#"
PLAIN: hello
TOKEN:
  secretKeyRef:
    name: creds
    key: token
LEVEL:
  configMapKeyRef:
    name: settings
    key: level
"#;
        let env: BTreeMap<String, EnvValue> = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(env["PLAIN"], EnvValue::literal("hello"));
        assert_eq!(env["TOKEN"], EnvValue::secret("creds", "token"));
        assert_eq!(env["LEVEL"], EnvValue::config_map("settings", "level"));
    }

    #[test]
    fn test_job_yaml_defaults_and_timeout() {
        let yaml = r#"
name: test
container:
  image: rust:1.79
tasks: ["cargo test"]
timeoutSeconds: 120
"#;
        let job: Job = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(job.timeout, Duration::from_secs(120));
        assert_eq!(job.container.image_pull_policy, ImagePullPolicy::IfNotPresent);
        assert!(job.use_source);
    }
}
