// Project Loading
// Resolves the project a run belongs to

use crate::error::ClusterError;
use crate::models::Project;

use async_trait::async_trait;

/// Loads a project once per run
#[async_trait]
pub trait ProjectLoader: Send + Sync {
    async fn load(&self, project_id: &str) -> Result<Project, ClusterError>;
}

/// Serves a project that is already known, e.g. from an event descriptor
#[derive(Debug, Clone)]
pub struct StaticProjectLoader {
    project: Project,
}

impl StaticProjectLoader {
    pub fn new(project: Project) -> Self {
        Self { project }
    }
}

#[async_trait]
impl ProjectLoader for StaticProjectLoader {
    async fn load(&self, project_id: &str) -> Result<Project, ClusterError> {
        if project_id != self.project.id {
            return Err(ClusterError::NotFound {
                kind: "Project",
                name: project_id.to_string(),
            });
        }
        Ok(self.project.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_loader() {
        let loader = StaticProjectLoader::new(Project::new("p1", "org/repo"));

        assert_eq!(loader.load("p1").await.unwrap().name, "org/repo");
        assert!(loader.load("p2").await.unwrap_err().is_not_found());
    }
}
