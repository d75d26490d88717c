// Worker API Client
// Job submission, status streaming and log retrieval against the worker HTTP API

use crate::builder::generate_script;
use crate::error::ClusterError;
use crate::models::{Container, EnvValue, Job, Phase, UnitRef};
use crate::watcher::{LogReader, PhaseStream, PhaseSubscriber};

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// HTTP client for the worker endpoints of the API server
#[derive(Clone)]
pub struct WorkerApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl WorkerApiClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, ClusterError> {
        let http = Client::builder()
            .build()
            .map_err(|e| ClusterError::Request(format!("failed to create HTTP client: {}", e)))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Submit a job for an event
    pub async fn create_job(&self, event_id: &str, job: &Job) -> Result<(), ClusterError> {
        let url = format!("{}/v2/events/{}/worker/jobs", self.base_url, event_id);
        let body = JobRequest::from_job(job);

        let response = self
            .authorized(self.http.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| ClusterError::Request(e.to_string()))?;
        check(response, "Job", &job.name).await?;

        tracing::debug!(job = %job.name, event = %event_id, "submitted job to worker API");
        Ok(())
    }
}

/// Map an unsuccessful response to a cluster error
async fn check(response: Response, kind: &'static str, name: &str) -> Result<Response, ClusterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => ClusterError::NotFound {
            kind,
            name: name.to_string(),
        },
        s if s.is_client_error() => ClusterError::Rejected(format!("API error ({}): {}", s, body)),
        s => ClusterError::Request(format!("API error ({}): {}", s, body)),
    })
}

#[async_trait]
impl PhaseSubscriber for WorkerApiClient {
    async fn subscribe(&self, unit: &UnitRef) -> Result<PhaseStream, ClusterError> {
        let url = format!(
            "{}/v2/events/{}/worker/jobs/{}/status?watch=true",
            self.base_url, unit.event_id, unit.job
        );

        let response = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .map_err(|e| ClusterError::Stream(e.to_string()))?;
        let response = check(response, "Job", &unit.job).await?;

        Ok(decode_phase_stream(response.bytes_stream()))
    }
}

#[async_trait]
impl LogReader for WorkerApiClient {
    async fn read_logs(&self, unit: &UnitRef) -> Result<String, ClusterError> {
        let url = format!(
            "{}/v2/events/{}/logs?job={}&container={}&follow=false",
            self.base_url, unit.event_id, unit.job, unit.job
        );

        let response = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .map_err(|e| ClusterError::Request(e.to_string()))?;
        let body = check(response, "Job", &unit.job)
            .await?
            .text()
            .await
            .map_err(|e| ClusterError::Request(e.to_string()))?;

        Ok(parse_log_lines(&body))
    }
}

#[derive(Debug, Deserialize)]
struct StatusMessage {
    phase: Phase,
}

#[derive(Debug, Deserialize)]
struct LogMessage {
    #[serde(default)]
    time: Option<String>,
    message: String,
}

fn parse_phase_line(line: &[u8]) -> Option<Result<Phase, ClusterError>> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(
        serde_json::from_str::<StatusMessage>(line)
            .map(|message| message.phase)
            .map_err(|e| ClusterError::Stream(format!("invalid status message: {}", e))),
    )
}

/// Decode a newline-delimited JSON body of `{"phase": ...}` messages
pub fn decode_phase_stream<S, B, E>(chunks: S) -> PhaseStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = (Box::pin(chunks), Vec::<u8>::new(), false);

    stream::unfold(state, |(mut chunks, mut buffer, mut done)| async move {
        loop {
            if let Some(end) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=end).collect();
                if let Some(item) = parse_phase_line(&line) {
                    return Some((item, (chunks, buffer, done)));
                }
                continue;
            }

            if done {
                let rest = std::mem::take(&mut buffer);
                return parse_phase_line(&rest).map(|item| (item, (chunks, buffer, done)));
            }

            match chunks.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    buffer.clear();
                    let item = Err(ClusterError::Stream(e.to_string()));
                    return Some((item, (chunks, buffer, true)));
                }
                None => done = true,
            }
        }
    })
    .boxed()
}

/// Join the messages of a newline-delimited JSON log body
pub fn parse_log_lines(body: &str) -> String {
    let mut out = String::new();
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<LogMessage>(line) {
            Ok(entry) => {
                if let Some(time) = &entry.time {
                    tracing::trace!(time = %time, "log line");
                }
                out.push_str(&entry.message);
                out.push('\n');
            }
            Err(e) => tracing::debug!(error = %e, "skipping malformed log line"),
        }
    }
    out
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobRequest {
    name: String,
    spec: JobSpecWire,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobSpecWire {
    primary_container: ContainerWire,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    sidecar_containers: BTreeMap<String, ContainerWire>,
    timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<HostWire>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContainerWire {
    image: String,
    image_pull_policy: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    command: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    arguments: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    working_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_mount_path: Option<String>,
    use_source: bool,
    privileged: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HostWire {
    #[serde(skip_serializing_if = "Option::is_none")]
    os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_name: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    node_selector: BTreeMap<String, String>,
}

impl JobRequest {
    fn from_job(job: &Job) -> Self {
        let mut primary = ContainerWire::from_container(&job.name, &job.container, job.use_source);
        primary.privileged |= job.privileged;
        if !job.tasks.is_empty() {
            primary.command = vec![
                job.shell.clone(),
                "-c".to_string(),
                generate_script(&job.shell, &job.tasks),
            ];
            primary.arguments.clear();
        }

        let host = &job.host;
        let host = (host.os.is_some() || host.node_name.is_some() || !host.node_selector.is_empty())
            .then(|| HostWire {
                os: host.os.clone(),
                node_name: host.node_name.clone(),
                node_selector: host.node_selector.clone(),
            });

        Self {
            name: job.name.clone(),
            spec: JobSpecWire {
                primary_container: primary,
                sidecar_containers: job
                    .sidecars
                    .iter()
                    .map(|(name, c)| (name.clone(), ContainerWire::from_container(name, c, job.use_source)))
                    .collect(),
                timeout_seconds: job.timeout.as_secs(),
                host,
            },
        }
    }
}

impl ContainerWire {
    fn from_container(name: &str, container: &Container, use_source: bool) -> Self {
        let environment = container
            .env
            .iter()
            .filter_map(|(key, value)| match value {
                EnvValue::Literal(literal) => Some((key.clone(), literal.clone())),
                _ => {
                    tracing::warn!(
                        container = %name,
                        variable = %key,
                        "worker API does not resolve env references, dropping variable"
                    );
                    None
                }
            })
            .collect();

        Self {
            image: container.image.clone(),
            image_pull_policy: container.image_pull_policy.as_str().to_string(),
            command: container.command.clone(),
            arguments: container.args.clone(),
            environment,
            working_directory: container.working_directory.clone(),
            source_mount_path: container.source_mount_path.clone(),
            use_source,
            privileged: container.privileged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&str]) -> Vec<Result<Vec<u8>, String>> {
        parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect()
    }

    #[tokio::test]
    async fn test_decode_phases_across_chunk_boundaries() {
        let body = chunks(&["{\"phase\":\"RUN", "NING\"}\n\n{\"phase\":", "\"SUCCEEDED\"}"]);
        let phases: Vec<_> = decode_phase_stream(stream::iter(body)).collect().await;

        assert_eq!(phases.len(), 2);
        assert!(matches!(phases[0], Ok(Phase::Running)));
        assert!(matches!(phases[1], Ok(Phase::Succeeded)));
    }

    #[tokio::test]
    async fn test_decode_surfaces_transport_error() {
        let body: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"{\"phase\":\"STARTING\"}\n".to_vec()),
            Err("connection reset".to_string()),
        ];
        let phases: Vec<_> = decode_phase_stream(stream::iter(body)).collect().await;

        assert!(matches!(phases[0], Ok(Phase::Pending)));
        assert!(matches!(phases[1], Err(ClusterError::Stream(_))));
        assert_eq!(phases.len(), 2);
    }

    #[test]
    fn test_parse_log_lines() {
        let body = "{\"time\":\"2024-01-01T00:00:00Z\",\"message\":\"compiling\"}\nnot json\n{\"message\":\"done\"}\n";
        assert_eq!(parse_log_lines(body), "compiling\ndone\n");
    }

    #[test]
    fn test_job_request_wire_shape() {
        let job = Job::new("build", "rust:1.79")
            .with_tasks(["cargo build"])
            .with_env("MODE", "release")
            .with_env("TOKEN", EnvValue::secret("creds", "token"));

        let json = serde_json::to_value(JobRequest::from_job(&job)).unwrap();
        let primary = &json["spec"]["primaryContainer"];

        assert_eq!(json["name"], "build");
        assert_eq!(json["spec"]["timeoutSeconds"], 900);
        assert_eq!(primary["image"], "rust:1.79");
        assert_eq!(primary["command"][0], "/bin/sh");
        assert_eq!(primary["environment"]["MODE"], "release");
        assert!(primary["environment"].get("TOKEN").is_none());
        assert!(json["spec"].get("host").is_none());
    }

    #[test]
    fn test_job_request_carries_node_name() {
        let mut job = Job::new("deploy", "alpine:3");
        job.host.node_name = Some("gpu-node-1".to_string());

        let json = serde_json::to_value(JobRequest::from_job(&job)).unwrap();
        let host = &json["spec"]["host"];

        assert_eq!(host["nodeName"], "gpu-node-1");
        assert!(host.get("os").is_none());
        assert!(host.get("nodeSelector").is_none());
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client = WorkerApiClient::new("https://api.example/", None).unwrap();
        assert_eq!(client.base_url, "https://api.example");
    }
}
