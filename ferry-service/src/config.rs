// Worker Configuration
// Startup settings from FERRY_* environment keys or a JSON event descriptor

use crate::builder::{BuildOptions, NamingMode};
use crate::cache::DEFAULT_BUILD_STORAGE_SIZE;
use crate::error::ConfigError;
use crate::lifecycle::ControllerConfig;
use crate::models::{Event, LogLevel, Project};
use crate::watcher::poll::DEFAULT_POLL_INTERVAL;
use crate::watcher::StreamConfig;

use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Prefix shared by every environment key
pub const ENV_PREFIX: &str = "FERRY_";

/// Event descriptor: the event itself plus the project it belongs to
#[derive(Debug, Clone, Deserialize)]
pub struct Descriptor {
    #[serde(flatten)]
    pub event: Event,
    pub project: Project,
}

/// How job status is observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchMode {
    #[default]
    Poll,
    Stream,
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub mode: WatchMode,
    pub poll_interval: Duration,
    pub stream: StreamConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            mode: WatchMode::Poll,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stream: StreamConfig::default(),
        }
    }
}

/// Everything a worker needs to know before the event fires
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub project_id: String,
    /// Overrides the namespace of the loaded project
    pub project_namespace: Option<String>,
    /// Project carried inline by a descriptor
    pub project: Option<Project>,
    pub event: Event,
    pub service_account: Option<String>,
    pub service_account_pattern: Option<Regex>,
    pub default_cache_storage_class: Option<String>,
    pub default_build_storage_class: Option<String>,
    pub build_storage_size: String,
    pub log_level: LogLevel,
    pub legacy_naming: bool,
    /// Exit the process with the run's code once a failed run is torn down
    pub exit_on_error: bool,
}

impl WorkerConfig {
    /// Read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, which receives fully prefixed keys
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = Settings::new(&lookup);

        let event = Event::new(
            settings.required("EVENT_ID")?,
            settings.required("EVENT_SOURCE")?,
            settings.required("EVENT_TYPE")?,
        );
        let mut event = match settings.get("PAYLOAD") {
            Some(payload) => event.with_payload(payload),
            None => event,
        };
        let commit = settings.get("COMMIT_ID");
        let git_ref = settings.get("COMMIT_REF");
        if commit.is_some() || git_ref.is_some() {
            event = event.with_revision(commit, git_ref);
        }

        let mut config = Self::worker_defaults(settings.required("PROJECT_ID")?, event);
        config.apply(&settings)?;
        Ok(config)
    }

    /// Read a JSON descriptor; worker-wide settings still come from the environment
    pub fn from_descriptor(path: &Path) -> Result<Self, ConfigError> {
        Self::from_descriptor_with(path, |key| std::env::var(key).ok())
    }

    pub fn from_descriptor_with<F>(path: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let content = std::fs::read_to_string(path)?;
        let descriptor: Descriptor = serde_json::from_str(&content)?;
        if descriptor.project.id.trim().is_empty() {
            return Err(ConfigError::Missing("project.id".to_string()));
        }
        if descriptor.event.id.trim().is_empty() {
            return Err(ConfigError::Missing("id".to_string()));
        }

        let log_level = descriptor.event.worker.log_level;
        let mut config = Self::worker_defaults(descriptor.project.id.clone(), descriptor.event);
        config.log_level = log_level;
        config.project = Some(descriptor.project);
        config.apply(&Settings::new(&lookup))?;
        Ok(config)
    }

    fn worker_defaults(project_id: String, event: Event) -> Self {
        Self {
            project_id,
            project_namespace: None,
            project: None,
            event,
            service_account: None,
            service_account_pattern: None,
            default_cache_storage_class: None,
            default_build_storage_class: None,
            build_storage_size: DEFAULT_BUILD_STORAGE_SIZE.to_string(),
            log_level: LogLevel::Info,
            legacy_naming: false,
            exit_on_error: false,
        }
    }

    fn apply(&mut self, settings: &Settings<'_>) -> Result<(), ConfigError> {
        if let Some(namespace) = settings.get("PROJECT_NAMESPACE") {
            self.project_namespace = Some(namespace);
        }
        self.service_account = settings.get("SERVICE_ACCOUNT");
        if let Some(pattern) = settings.get("SERVICE_ACCOUNT_REGEX") {
            let regex = Regex::new(&pattern).map_err(|err| ConfigError::Invalid {
                key: settings.key("SERVICE_ACCOUNT_REGEX"),
                reason: err.to_string(),
            })?;
            self.service_account_pattern = Some(regex);
        }
        self.default_cache_storage_class = settings.get("DEFAULT_CACHE_STORAGE_CLASS");
        self.default_build_storage_class = settings.get("DEFAULT_BUILD_STORAGE_CLASS");
        if let Some(size) = settings.get("BUILD_STORAGE_SIZE") {
            self.build_storage_size = size;
        }
        if let Some(level) = settings.get("LOG_LEVEL") {
            self.log_level = LogLevel::parse(&level).ok_or_else(|| ConfigError::Invalid {
                key: settings.key("LOG_LEVEL"),
                reason: format!("unknown level '{}'", level),
            })?;
        }
        if let Some(flag) = settings.get("LEGACY_NAMING") {
            self.legacy_naming = settings.flag("LEGACY_NAMING", &flag)?;
        }
        if let Some(flag) = settings.get("EXIT_ON_ERROR") {
            self.exit_on_error = settings.flag("EXIT_ON_ERROR", &flag)?;
        }
        Ok(())
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            naming: if self.legacy_naming {
                NamingMode::Legacy
            } else {
                NamingMode::RunId
            },
            secret_key_ref: true,
            service_account: self.service_account.clone(),
            service_account_pattern: self.service_account_pattern.clone(),
            default_cache_storage_class: self.default_cache_storage_class.clone(),
            default_build_storage_class: self.default_build_storage_class.clone(),
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            exit_on_error: self.exit_on_error,
        }
    }

    pub fn event(&self) -> Event {
        self.event.clone()
    }

    /// Apply the namespace override to a loaded project
    pub fn scope_project(&self, mut project: Project) -> Project {
        if let Some(namespace) = &self.project_namespace {
            project.namespace = namespace.clone();
        }
        project
    }
}

/// Prefixed view over a lookup; blank values count as unset
struct Settings<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl<'a> Settings<'a> {
    fn new(lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self { lookup }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", ENV_PREFIX, name)
    }

    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&self.key(name))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, name: &str) -> Result<String, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::Missing(self.key(name)))
    }

    fn flag(&self, name: &str, value: &str) -> Result<bool, ConfigError> {
        parse_bool(value).ok_or_else(|| ConfigError::Invalid {
            key: self.key(name),
            reason: format!("expected a boolean, got '{}'", value),
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
