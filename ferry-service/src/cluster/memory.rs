// In-Memory Cluster
// Scriptable cluster used by tests and dry runs; records every submitted resource

use super::{name_of, Cluster};
use crate::error::ClusterError;
use crate::lifecycle::ProjectLoader;
use crate::models::{Phase, Project, UnitRef};
use crate::watcher::{LogReader, PhaseReader, PhaseStream, PhaseSubscriber};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

/// One scripted item of a phase subscription
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Phase(Phase),
    Error(String),
    /// Keep the stream open without yielding anything further
    Hold,
}

#[derive(Default)]
struct State {
    secrets: BTreeMap<String, Secret>,
    pods: BTreeMap<String, Pod>,
    claims: BTreeMap<String, PersistentVolumeClaim>,
    projects: HashMap<String, Project>,

    phases: HashMap<String, VecDeque<Phase>>,
    default_phase: Option<Phase>,
    streams: HashMap<String, VecDeque<Vec<StreamItem>>>,
    logs: HashMap<String, String>,

    operations: Vec<String>,
    phase_reads: usize,
    subscriptions: usize,
    claim_deletes: usize,

    claim_read_failure: Option<String>,
    pod_rejection: Option<String>,
    claim_delete_failure: Option<String>,
}

/// A cluster that lives in process memory.
///
/// Phases and subscription streams are scripted per unit name. When a unit has
/// scripted phases, each read pops the next one and the last phase sticks.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster where every unit succeeds immediately
    pub fn succeeding() -> Self {
        let cluster = Self::new();
        cluster.set_default_phase(Phase::Succeeded);
        cluster
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    pub fn set_default_phase(&self, phase: Phase) {
        self.with_state(|s| s.default_phase = Some(phase));
    }

    /// Phases returned by successive reads of `unit`
    pub fn script_phases(&self, unit: &str, phases: impl IntoIterator<Item = Phase>) {
        self.with_state(|s| {
            s.phases
                .insert(unit.to_string(), phases.into_iter().collect());
        });
    }

    /// Queue the items of the next subscription to `unit`
    pub fn script_stream(&self, unit: &str, items: impl IntoIterator<Item = StreamItem>) {
        self.with_state(|s| {
            s.streams
                .entry(unit.to_string())
                .or_default()
                .push_back(items.into_iter().collect());
        });
    }

    pub fn set_logs(&self, unit: &str, logs: impl Into<String>) {
        self.with_state(|s| {
            s.logs.insert(unit.to_string(), logs.into());
        });
    }

    pub fn add_project(&self, project: Project) {
        self.with_state(|s| {
            s.projects.insert(project.id.clone(), project);
        });
    }

    pub fn add_claim(&self, claim: PersistentVolumeClaim) {
        self.with_state(|s| {
            s.claims.insert(name_of(&claim.metadata).to_string(), claim);
        });
    }

    /// Make claim reads fail with a non-not-found error
    pub fn fail_claim_reads(&self, reason: &str) {
        self.with_state(|s| s.claim_read_failure = Some(reason.to_string()));
    }

    /// Make pod creation fail as if the orchestrator rejected it
    pub fn reject_pods(&self, reason: &str) {
        self.with_state(|s| s.pod_rejection = Some(reason.to_string()));
    }

    pub fn fail_claim_deletes(&self, reason: &str) {
        self.with_state(|s| s.claim_delete_failure = Some(reason.to_string()));
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.with_state(|s| s.secrets.get(name).cloned())
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.with_state(|s| s.pods.get(name).cloned())
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.with_state(|s| s.pods.values().cloned().collect())
    }

    pub fn claim(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.with_state(|s| s.claims.get(name).cloned())
    }

    /// Mutating operations in the order they happened, as `kind:name`
    pub fn operations(&self) -> Vec<String> {
        self.with_state(|s| s.operations.clone())
    }

    pub fn phase_reads(&self) -> usize {
        self.with_state(|s| s.phase_reads)
    }

    pub fn subscriptions(&self) -> usize {
        self.with_state(|s| s.subscriptions)
    }

    pub fn claim_deletes(&self) -> usize {
        self.with_state(|s| s.claim_deletes)
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn create_secret(&self, secret: &Secret) -> Result<(), ClusterError> {
        let name = name_of(&secret.metadata).to_string();
        self.with_state(|s| {
            s.operations.push(format!("secret:{}", name));
            s.secrets.insert(name, secret.clone());
        });
        Ok(())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<(), ClusterError> {
        let name = name_of(&pod.metadata).to_string();
        self.with_state(|s| {
            if let Some(reason) = &s.pod_rejection {
                return Err(ClusterError::Rejected(reason.clone()));
            }
            s.operations.push(format!("pod:{}", name));
            s.pods.insert(name, pod.clone());
            Ok(())
        })
    }

    async fn get_claim(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, ClusterError> {
        self.with_state(|s| {
            if let Some(reason) = &s.claim_read_failure {
                return Err(ClusterError::Request(reason.clone()));
            }
            s.claims
                .get(name)
                .cloned()
                .ok_or_else(|| ClusterError::NotFound {
                    kind: "PersistentVolumeClaim",
                    name: name.to_string(),
                })
        })
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<(), ClusterError> {
        let name = name_of(&claim.metadata).to_string();
        self.with_state(|s| {
            if s.claims.contains_key(&name) {
                return Err(ClusterError::Rejected(format!(
                    "claim '{}' already exists",
                    name
                )));
            }
            s.operations.push(format!("claim:{}", name));
            s.claims.insert(name, claim.clone());
            Ok(())
        })
    }

    async fn delete_claim(&self, _namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.with_state(|s| {
            s.claim_deletes += 1;
            if let Some(reason) = &s.claim_delete_failure {
                return Err(ClusterError::Request(reason.clone()));
            }
            s.operations.push(format!("delete-claim:{}", name));
            s.claims
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| ClusterError::NotFound {
                    kind: "PersistentVolumeClaim",
                    name: name.to_string(),
                })
        })
    }
}

#[async_trait]
impl PhaseReader for MemoryCluster {
    async fn read_phase(&self, unit: &UnitRef) -> Result<Option<Phase>, ClusterError> {
        Ok(self.with_state(|s| {
            s.phase_reads += 1;
            if let Some(queue) = s.phases.get_mut(&unit.name) {
                if queue.len() > 1 {
                    return queue.pop_front();
                }
                return queue.front().copied();
            }
            if s.pods.contains_key(&unit.name) {
                return Some(s.default_phase.unwrap_or(Phase::Pending));
            }
            None
        }))
    }
}

#[async_trait]
impl PhaseSubscriber for MemoryCluster {
    async fn subscribe(&self, unit: &UnitRef) -> Result<PhaseStream, ClusterError> {
        let items = self.with_state(|s| {
            s.subscriptions += 1;
            let fallback = StreamItem::Phase(s.default_phase.unwrap_or(Phase::Pending));
            s.streams
                .get_mut(&unit.name)
                .and_then(|queue| queue.pop_front())
                .unwrap_or_else(|| vec![fallback])
        });

        let mut yielded = Vec::new();
        let mut hold = false;
        for item in items {
            match item {
                StreamItem::Phase(phase) => yielded.push(Ok(phase)),
                StreamItem::Error(reason) => yielded.push(Err(ClusterError::Stream(reason))),
                StreamItem::Hold => {
                    hold = true;
                    break;
                }
            }
        }

        let phases = stream::iter(yielded);
        if hold {
            Ok(phases.chain(stream::pending()).boxed())
        } else {
            Ok(phases.boxed())
        }
    }
}

#[async_trait]
impl LogReader for MemoryCluster {
    async fn read_logs(&self, unit: &UnitRef) -> Result<String, ClusterError> {
        Ok(self.with_state(|s| s.logs.get(&unit.name).cloned().unwrap_or_default()))
    }
}

#[async_trait]
impl ProjectLoader for MemoryCluster {
    async fn load(&self, project_id: &str) -> Result<Project, ClusterError> {
        self.with_state(|s| {
            s.projects
                .get(project_id)
                .cloned()
                .ok_or_else(|| ClusterError::NotFound {
                    kind: "Project",
                    name: project_id.to_string(),
                })
        })
    }
}
