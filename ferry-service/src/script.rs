// Handler Files
// Declarative YAML handlers: which jobs and groups run for which events

use crate::error::ConfigError;
use crate::execution::{BatchedGroup, ConcurrentGroup, Runnable, SerialGroup};
use crate::lifecycle::{EventBus, RunContext};
use crate::models::Job;

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// A step of handler work
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "StepDecl")]
pub enum Step {
    Job(Job),
    Serial(Vec<Step>),
    Concurrent(Vec<Step>),
    Batched { max_concurrent: usize, steps: Vec<Step> },
}

/// Wire form of a step: exactly one key must be set
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StepDecl {
    job: Option<Job>,
    serial: Option<Vec<Step>>,
    concurrent: Option<Vec<Step>>,
    batched: Option<BatchDecl>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchDecl {
    #[serde(default = "default_batch_size")]
    max_concurrent: usize,
    steps: Vec<Step>,
}

fn default_batch_size() -> usize {
    1
}

impl TryFrom<StepDecl> for Step {
    type Error = String;

    fn try_from(decl: StepDecl) -> Result<Self, Self::Error> {
        match (decl.job, decl.serial, decl.concurrent, decl.batched) {
            (Some(job), None, None, None) => Ok(Step::Job(job)),
            (None, Some(steps), None, None) => Ok(Step::Serial(steps)),
            (None, None, Some(steps), None) => Ok(Step::Concurrent(steps)),
            (None, None, None, Some(batch)) => Ok(Step::Batched {
                max_concurrent: batch.max_concurrent,
                steps: batch.steps,
            }),
            (None, None, None, None) => {
                Err("step must be one of job, serial, concurrent or batched".to_string())
            }
            _ => Err("step declares more than one of job, serial, concurrent, batched".to_string()),
        }
    }
}

impl Step {
    /// Every job in the step, depth first
    pub fn jobs(&self) -> Vec<&Job> {
        match self {
            Step::Job(job) => vec![job],
            Step::Serial(steps) | Step::Concurrent(steps) | Step::Batched { steps, .. } => {
                steps.iter().flat_map(Step::jobs).collect()
            }
        }
    }

    /// Bind the step to a run
    pub fn instantiate(&self, ctx: &RunContext) -> Arc<dyn Runnable> {
        let runnable: Arc<dyn Runnable> = match self {
            Step::Job(job) => ctx.job(job.clone()),
            Step::Serial(steps) => {
                let group = steps
                    .iter()
                    .fold(SerialGroup::new(), |group, step| group.add(step.instantiate(ctx)));
                Arc::new(group)
            }
            Step::Concurrent(steps) => {
                let group = steps
                    .iter()
                    .fold(ConcurrentGroup::new(), |group, step| group.add(step.instantiate(ctx)));
                Arc::new(group)
            }
            Step::Batched {
                max_concurrent,
                steps,
            } => {
                let group = steps
                    .iter()
                    .fold(BatchedGroup::new(*max_concurrent), |group, step| {
                        group.add(step.instantiate(ctx))
                    });
                Arc::new(group)
            }
        };
        runnable
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HandlerDecl {
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub run: Step,
}

/// A parsed and validated handler file
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HandlerFile {
    pub handlers: Vec<HandlerDecl>,
}

impl HandlerFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse YAML and validate every job name and handler key up front
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: HandlerFile = serde_yaml::from_str(content)?;

        let mut seen = HashSet::new();
        for handler in &file.handlers {
            if !seen.insert((handler.source.as_str(), handler.event_type.as_str())) {
                return Err(ConfigError::Invalid {
                    key: format!("{}/{}", handler.source, handler.event_type),
                    reason: "handler declared twice".to_string(),
                });
            }
            for job in handler.run.jobs() {
                job.validate()?;
            }
        }
        Ok(file)
    }

    pub fn job_count(&self) -> usize {
        self.handlers.iter().map(|h| h.run.jobs().len()).sum()
    }

    /// Register one bus handler per declaration
    pub fn register(&self, bus: &mut EventBus) {
        for handler in &self.handlers {
            let step = Arc::new(handler.run.clone());
            tracing::debug!(
                source = %handler.source,
                event_type = %handler.event_type,
                jobs = step.jobs().len(),
                "registering handler"
            );
            bus.on(
                handler.source.clone(),
                handler.event_type.clone(),
                move |_event, ctx: RunContext| {
                    let step = step.clone();
                    async move {
                        step.instantiate(&ctx).run().await?;
                        Ok(())
                    }
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{NoopBackend, RunScope};
    use crate::models::{Event, Project};
    use std::io::Write;

    const HANDLERS: &str = r#"
handlers:
  - source: github
    type: push
    run:
      serial:
        - job:
            name: lint
            container:
              image: rust:1.78
            tasks:
              - cargo fmt --check
        - concurrent:
            - job:
                name: test
                container:
                  image: rust:1.78
                tasks:
                  - cargo test
            - job:
                name: docs
                container:
                  image: rust:1.78
        - batched:
            maxConcurrent: 2
            steps:
              - job:
                  name: deploy-a
                  container:
                    image: alpine
              - job:
                  name: deploy-b
                  container:
                    image: alpine
  - source: cron
    type: nightly
    run:
      job:
        name: report
        container:
          image: alpine
        timeoutSeconds: 60
"#;

    #[test]
    fn test_parse_handlers() {
        let file = HandlerFile::parse(HANDLERS).unwrap();

        assert_eq!(file.handlers.len(), 2);
        assert_eq!(file.job_count(), 6);

        let names: Vec<_> = file.handlers[0]
            .run
            .jobs()
            .iter()
            .map(|job| job.name.as_str())
            .collect();
        assert_eq!(names, vec!["lint", "test", "docs", "deploy-a", "deploy-b"]);

        match &file.handlers[0].run {
            Step::Serial(steps) => match &steps[2] {
                Step::Batched { max_concurrent, steps } => {
                    assert_eq!(*max_concurrent, 2);
                    assert_eq!(steps.len(), 2);
                }
                other => panic!("expected batched step, got {:?}", other),
            },
            other => panic!("expected serial step, got {:?}", other),
        }

        match &file.handlers[1].run {
            Step::Job(job) => assert_eq!(job.timeout.as_secs(), 60),
            other => panic!("expected job step, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_job_name_rejected_at_load() {
        let yaml = r#"
handlers:
  - source: github
    type: push
    run:
      job:
        name: Build_Step
        container:
          image: alpine
"#;
        let err = HandlerFile::parse(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidJob(_)));
    }

    #[test]
    fn test_step_needs_exactly_one_kind() {
        let both = r#"
handlers:
  - source: github
    type: push
    run:
      job:
        name: a
      serial: []
"#;
        assert!(matches!(
            HandlerFile::parse(both).unwrap_err(),
            ConfigError::Handlers(_)
        ));

        let none = r#"
handlers:
  - source: github
    type: push
    run: {}
"#;
        assert!(matches!(
            HandlerFile::parse(none).unwrap_err(),
            ConfigError::Handlers(_)
        ));
    }

    #[test]
    fn test_duplicate_handler_rejected() {
        let yaml = r#"
handlers:
  - source: github
    type: push
    run:
      job: {name: a}
  - source: github
    type: push
    run:
      job: {name: b}
"#;
        assert!(matches!(
            HandlerFile::parse(yaml).unwrap_err(),
            ConfigError::Invalid { .. }
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", HANDLERS).unwrap();

        let handlers = HandlerFile::load(file.path()).unwrap();
        assert_eq!(handlers.handlers.len(), 2);
    }

    #[tokio::test]
    async fn test_registered_handler_runs_steps() {
        let file = HandlerFile::parse(HANDLERS).unwrap();
        let mut bus = EventBus::new();
        file.register(&mut bus);

        assert!(bus.has_handler("github", "push"));
        assert!(bus.has_handler("cron", "nightly"));

        let event = Event::new("run1", "github", "push");
        let ctx = RunContext::new(
            Arc::new(RunScope::new(event.clone(), Project::new("p1", "org/repo"))),
            Arc::new(NoopBackend),
            None,
        );
        let handler = bus.handler("github", "push").unwrap();
        handler(event, ctx).await.unwrap();
    }
}
