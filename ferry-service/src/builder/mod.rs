// Execution Unit Builder
// Pure translation of a job declaration into a Pod, its credential carrier and cache claim

pub mod env;
pub mod script;

pub use env::{EnvPartitioner, LiteralMode};
pub use script::generate_script;

use crate::cache::{build_volume_name, cache_volume_name, claim_spec, resolve_storage_class};
use crate::error::BuildError;
use crate::models::{Container, EnvValue, Event, Job, Project, ResourceSpec, Resources, UnitRef};

use k8s_openapi::api::core::v1::{
    Container as PodContainer, EmptyDirVolumeSource, EnvVar, HostPathVolumeSource, LocalObjectReference,
    PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod, PodSpec, ResourceRequirements,
    Secret, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};

/// Carrier volume name and mount point
pub const HOOK_VOLUME: &str = "hook";
pub const HOOK_MOUNT_PATH: &str = "/hook";

/// Carrier key holding the generated task script
pub const SCRIPT_KEY: &str = "main.sh";

/// Shared source volume, also the name of the init container that fills it
pub const SOURCE_VOLUME: &str = "vcs-sidecar";
pub const DEFAULT_SOURCE_PATH: &str = "/src";

pub const CACHE_VOLUME: &str = "build-cache";
pub const BUILD_VOLUME: &str = "build-storage";
pub const DOCKER_VOLUME: &str = "docker-socket";
pub const DOCKER_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Service account used when neither the job nor the worker names one
pub const DEFAULT_SERVICE_ACCOUNT: &str = "ferry-worker";

/// How execution unit names are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamingMode {
    /// `{job}-{run id}`
    #[default]
    RunId,
    /// `{job}-{unix millis}-{first 8 chars of commit}`
    Legacy,
}

/// Worker-wide settings that shape every unit
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub naming: NamingMode,
    /// Route literal env values through the carrier
    pub secret_key_ref: bool,
    pub service_account: Option<String>,
    pub service_account_pattern: Option<Regex>,
    pub default_cache_storage_class: Option<String>,
    pub default_build_storage_class: Option<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            naming: NamingMode::RunId,
            secret_key_ref: true,
            service_account: None,
            service_account_pattern: None,
            default_cache_storage_class: None,
            default_build_storage_class: None,
        }
    }
}

/// Everything submitted for one job
#[derive(Debug, Clone)]
pub struct ExecutionUnit {
    /// Shared name of the pod and its carrier
    pub name: String,
    pub namespace: String,
    pub job: String,
    pub event_id: String,
    /// Credential and script carrier
    pub secret: Secret,
    pub pod: Pod,
    /// Present when the job asked for a cache volume
    pub cache_claim: Option<PersistentVolumeClaim>,
}

impl ExecutionUnit {
    pub fn unit_ref(&self) -> UnitRef {
        UnitRef {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            job: self.job.clone(),
            event_id: self.event_id.clone(),
        }
    }
}

/// Resource name for a job's unit
pub fn unit_name(job: &str, event: &Event, naming: NamingMode, now_millis: i64) -> String {
    let name = match naming {
        NamingMode::RunId => format!("{}-{}", job, event.run_id()),
        NamingMode::Legacy => match event.commit() {
            Some(commit) => {
                let short: String = commit.chars().take(8).collect();
                format!("{}-{}-{}", job, now_millis, short)
            }
            None => format!("{}-{}", job, now_millis),
        },
    };
    name.to_lowercase()
}

/// Labels carried by every resource of a unit
pub fn unit_labels(job: &str, event: &Event, project: &Project) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("heritage".to_string(), "ferry".to_string());
    labels.insert("component".to_string(), "job".to_string());
    labels.insert("jobname".to_string(), job.to_string());
    labels.insert("project".to_string(), project.id.clone());
    labels.insert("worker".to_string(), event.run_id().to_lowercase());
    labels
}

/// Builds execution units. Performs no I/O.
#[derive(Debug, Clone, Default)]
pub struct ExecutionUnitBuilder {
    options: BuildOptions,
}

impl ExecutionUnitBuilder {
    pub fn new(options: BuildOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn build(
        &self,
        job: &Job,
        event: &Event,
        project: &Project,
    ) -> Result<ExecutionUnit, BuildError> {
        self.build_at(job, event, project, chrono::Utc::now().timestamp_millis())
    }

    /// Build with an explicit clock for legacy naming
    pub fn build_at(
        &self,
        job: &Job,
        event: &Event,
        project: &Project,
        now_millis: i64,
    ) -> Result<ExecutionUnit, BuildError> {
        job.validate()?;

        let name = unit_name(&job.name, event, self.options.naming, now_millis);
        let labels = unit_labels(&job.name, event, project);
        let service_account = self.service_account(job)?;

        let mode = if self.options.secret_key_ref {
            LiteralMode::Carrier
        } else {
            LiteralMode::Inline
        };
        let mut partitioner = EnvPartitioner::new(name.clone(), mode);

        let mut volumes = vec![Volume {
            name: HOOK_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let mut mounts = vec![mount(HOOK_VOLUME, HOOK_MOUNT_PATH, true)];

        let mut primary = self.primary_container(job, project, &mut partitioner);

        // Source retrieval
        let source_path = job
            .container
            .source_mount_path
            .clone()
            .unwrap_or_else(|| DEFAULT_SOURCE_PATH.to_string());
        let mut init_containers = Vec::new();
        let fetch_source = job.use_source && project.clone_url().is_some();
        if fetch_source {
            volumes.push(Volume {
                name: SOURCE_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
            mounts.push(mount(SOURCE_VOLUME, &source_path, false));
            init_containers.push(source_container(event, project, &source_path, &mut partitioner));
        }

        // Cache
        let cache_claim = if job.cache.enabled {
            let claim_name = cache_volume_name(&project.name, &job.name);
            let storage_class = resolve_storage_class(&[
                job.cache.storage_class.as_deref(),
                project.cache_storage_class.as_deref(),
                self.options.default_cache_storage_class.as_deref(),
            ]);
            volumes.push(claim_volume(CACHE_VOLUME, &claim_name));
            mounts.push(mount(CACHE_VOLUME, &job.cache.path, false));
            Some(claim_spec(
                &claim_name,
                &project.namespace,
                &job.cache.size,
                storage_class,
                labels.clone(),
            ))
        } else {
            None
        };

        // Run-wide build volume
        if job.storage.enabled {
            volumes.push(claim_volume(BUILD_VOLUME, &build_volume_name(event.run_id())));
            mounts.push(mount(BUILD_VOLUME, &job.storage.path, false));
        }

        if job.docker {
            if !project.allow_host_mounts {
                return Err(BuildError::HostMountDisallowed {
                    job: job.name.clone(),
                    volume: DOCKER_VOLUME.to_string(),
                });
            }
            volumes.push(Volume {
                name: DOCKER_VOLUME.to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: DOCKER_SOCKET_PATH.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(mount(DOCKER_VOLUME, DOCKER_SOCKET_PATH, false));
        }

        self.user_volumes(job, project, &mut volumes, &mut mounts)?;

        let sidecar_source_mount = fetch_source.then(|| mount(SOURCE_VOLUME, &source_path, false));
        let mut containers = Vec::with_capacity(job.sidecars.len() + 1);
        primary.volume_mounts = Some(mounts);
        containers.push(primary);
        for (sidecar_name, sidecar) in &job.sidecars {
            let mut container =
                self.sidecar_container(sidecar_name, sidecar, job, project, &mut partitioner);
            if let Some(source) = &sidecar_source_mount {
                container.volume_mounts = Some(vec![source.clone()]);
            }
            containers.push(container);
        }

        let pod = Pod {
            metadata: metadata(&name, &project.namespace, &labels),
            spec: Some(PodSpec {
                containers,
                init_containers: (!init_containers.is_empty()).then_some(init_containers),
                volumes: Some(volumes),
                restart_policy: Some("Never".to_string()),
                service_account_name: Some(service_account),
                node_name: job.host.node_name.clone(),
                node_selector: node_selector(job),
                image_pull_secrets: image_pull_secrets(&job.image_pull_secrets),
                ..Default::default()
            }),
            ..Default::default()
        };

        let secret = Secret {
            metadata: metadata(&name, &project.namespace, &labels),
            type_: Some("Opaque".to_string()),
            data: Some(partitioner.into_data()),
            ..Default::default()
        };

        tracing::debug!(job = %job.name, unit = %name, "built execution unit");

        Ok(ExecutionUnit {
            name,
            namespace: project.namespace.clone(),
            job: job.name.clone(),
            event_id: event.id.clone(),
            secret,
            pod,
            cache_claim,
        })
    }

    fn service_account(&self, job: &Job) -> Result<String, BuildError> {
        let account = job
            .service_account
            .clone()
            .or_else(|| self.options.service_account.clone())
            .unwrap_or_else(|| DEFAULT_SERVICE_ACCOUNT.to_string());

        if let Some(pattern) = &self.options.service_account_pattern {
            if !pattern.is_match(&account) {
                return Err(BuildError::ServiceAccountRejected {
                    job: job.name.clone(),
                    account,
                    pattern: pattern.as_str().to_string(),
                });
            }
        }
        Ok(account)
    }

    fn primary_container(
        &self,
        job: &Job,
        project: &Project,
        partitioner: &mut EnvPartitioner,
    ) -> PodContainer {
        let declared = &job.container;

        let (command, args) = if !job.tasks.is_empty() {
            partitioner.store(SCRIPT_KEY, generate_script(&job.shell, &job.tasks));
            let script_path = format!("{}/{}", HOOK_MOUNT_PATH, SCRIPT_KEY);
            (Some(vec![job.shell.clone(), script_path]), None)
        } else {
            (non_empty(&declared.command), non_empty(&declared.args))
        };

        let requested = job.privileged || declared.privileged;
        let security_context = privilege(&job.name, requested, job, project);

        PodContainer {
            name: job.name.clone(),
            image: Some(declared.image.clone()),
            image_pull_policy: Some(declared.image_pull_policy.as_str().to_string()),
            command,
            args,
            env: env_list(partitioner.container_env(None, &declared.env)),
            working_dir: declared.working_directory.clone(),
            security_context,
            resources: resource_requirements(&job.resources),
            ..Default::default()
        }
    }

    fn sidecar_container(
        &self,
        name: &str,
        sidecar: &Container,
        job: &Job,
        project: &Project,
        partitioner: &mut EnvPartitioner,
    ) -> PodContainer {
        PodContainer {
            name: name.to_string(),
            image: Some(sidecar.image.clone()),
            image_pull_policy: Some(sidecar.image_pull_policy.as_str().to_string()),
            command: non_empty(&sidecar.command),
            args: non_empty(&sidecar.args),
            env: env_list(partitioner.container_env(Some(name), &sidecar.env)),
            working_dir: sidecar.working_directory.clone(),
            security_context: privilege(name, sidecar.privileged, job, project),
            ..Default::default()
        }
    }

    /// Mount user volumes; each mount must name a system volume or a declared one
    fn user_volumes(
        &self,
        job: &Job,
        project: &Project,
        volumes: &mut Vec<Volume>,
        mounts: &mut Vec<VolumeMount>,
    ) -> Result<(), BuildError> {
        let system: HashSet<String> = volumes.iter().map(|v| v.name.clone()).collect();
        let mut attached = HashSet::new();

        for user_mount in &job.volume_mounts {
            if system.contains(&user_mount.name) {
                mounts.push(user_mount.clone());
                continue;
            }

            let volume = job
                .volumes
                .iter()
                .find(|v| v.name == user_mount.name)
                .ok_or_else(|| BuildError::UnmatchedVolumeMount {
                    job: job.name.clone(),
                    mount: user_mount.name.clone(),
                })?;

            if volume.host_path.is_some() && !project.allow_host_mounts {
                return Err(BuildError::HostMountDisallowed {
                    job: job.name.clone(),
                    volume: volume.name.clone(),
                });
            }

            if attached.insert(volume.name.clone()) {
                volumes.push(volume.clone());
            }
            mounts.push(user_mount.clone());
        }
        Ok(())
    }
}

/// Init container that fetches the project repository into the source volume
fn source_container(
    event: &Event,
    project: &Project,
    source_path: &str,
    partitioner: &mut EnvPartitioner,
) -> PodContainer {
    let mut env = BTreeMap::new();
    if let Some(url) = project.clone_url() {
        env.insert("FERRY_REPO_URL".to_string(), EnvValue::literal(url));
    }
    if let Some(commit) = event.commit() {
        env.insert("FERRY_COMMIT".to_string(), EnvValue::literal(commit));
    }
    if let Some(git_ref) = event.revision.as_ref().and_then(|r| r.git_ref.as_deref()) {
        env.insert("FERRY_REF".to_string(), EnvValue::literal(git_ref));
    }
    env.insert(
        "FERRY_SOURCE_PATH".to_string(),
        EnvValue::literal(source_path),
    );
    if let Some(key) = &project.repo.ssh_key {
        env.insert("FERRY_SSH_KEY".to_string(), EnvValue::literal(key.as_str()));
    }
    if let Some(token) = &project.repo.token {
        env.insert("FERRY_REPO_TOKEN".to_string(), EnvValue::literal(token.as_str()));
    }

    PodContainer {
        name: SOURCE_VOLUME.to_string(),
        image: Some(project.sidecar.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: env_list(partitioner.container_env(Some(SOURCE_VOLUME), &env)),
        volume_mounts: Some(vec![mount(SOURCE_VOLUME, source_path, false)]),
        resources: resource_requirements(&Resources {
            requests: project.sidecar.requests.clone(),
            limits: project.sidecar.limits.clone(),
        }),
        ..Default::default()
    }
}

/// Security context for a container that asked for privileged mode.
///
/// Realized only when the job itself is privileged and the project allows it.
fn privilege(
    container: &str,
    requested: bool,
    job: &Job,
    project: &Project,
) -> Option<SecurityContext> {
    if !requested {
        return None;
    }
    let realized = job.privileged && project.allow_privileged_jobs;
    if !realized {
        tracing::warn!(
            container = %container,
            job = %job.name,
            project = %project.id,
            job_privileged = job.privileged,
            "privileged mode requested but not authorized, forcing unprivileged"
        );
    }
    Some(SecurityContext {
        privileged: Some(realized),
        ..Default::default()
    })
}

fn node_selector(job: &Job) -> Option<BTreeMap<String, String>> {
    let mut selector = job.host.node_selector.clone();
    if let Some(os) = &job.host.os {
        selector.insert("kubernetes.io/os".to_string(), os.clone());
    }
    (!selector.is_empty()).then_some(selector)
}

fn image_pull_secrets(names: &[String]) -> Option<Vec<LocalObjectReference>> {
    if names.is_empty() {
        return None;
    }
    Some(
        names
            .iter()
            .map(|name| LocalObjectReference {
                name: Some(name.clone()),
            })
            .collect(),
    )
}

fn resource_requirements(resources: &Resources) -> Option<ResourceRequirements> {
    if resources.requests.is_empty() && resources.limits.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        requests: quantities(&resources.requests),
        limits: quantities(&resources.limits),
        ..Default::default()
    })
}

fn quantities(spec: &ResourceSpec) -> Option<BTreeMap<String, Quantity>> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &spec.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &spec.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    (!map.is_empty()).then_some(map)
}

fn claim_volume(name: &str, claim: &str) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn metadata(name: &str, namespace: &str, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels.clone()),
        ..Default::default()
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}

fn env_list(vars: Vec<EnvVar>) -> Option<Vec<EnvVar>> {
    (!vars.is_empty()).then_some(vars)
}
