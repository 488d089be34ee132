//! Container lifecycle management.
//!
//! Containers are created with a generated `fnbox-<uuid>` name and an open,
//! single-use stdin. They are identified by engine ID only; nothing here
//! keeps state about them between calls.

use std::sync::Arc;

use bollard::container::Config;
use bollard::models::{ContainerSummary, HostConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::ProvisionError;
use crate::execution::docker_client::ContainerEngine;
use crate::execution::NAME_PREFIX;

/// How a container should be created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    /// Image to instantiate.
    pub image: String,
    /// Command override; the image default when empty.
    pub cmd: Vec<String>,
    /// Environment variables (`KEY=value`).
    pub env: Vec<String>,
    /// Bind mounts (`host:container[:mode]`).
    pub volumes: Vec<String>,
    /// OCI runtime name, e.g. "runsc".
    pub runtime: Option<String>,
}

impl ContainerSpec {
    /// Creates a spec for `image` with the image's default command.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Sets the command.
    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    /// Sets environment variables.
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// Sets bind mounts.
    pub fn with_volumes(mut self, volumes: Vec<String>) -> Self {
        self.volumes = volumes;
        self
    }

    /// Sets the runtime.
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }

    /// Engine configuration for this spec.
    pub(crate) fn to_config(&self) -> Config<String> {
        let host_config = HostConfig {
            binds: (!self.volumes.is_empty()).then(|| self.volumes.clone()),
            runtime: self.runtime.clone().filter(|r| !r.is_empty()),
            ..Default::default()
        };

        Config {
            image: Some(self.image.clone()),
            cmd: (!self.cmd.is_empty()).then(|| self.cmd.clone()),
            env: (!self.env.is_empty()).then(|| self.env.clone()),
            host_config: Some(host_config),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            ..Default::default()
        }
    }
}

/// Engine-reported container state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown(String),
}

impl From<&str> for ContainerState {
    fn from(state: &str) -> Self {
        match state {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            other => ContainerState::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Restarting => write!(f, "restarting"),
            ContainerState::Removing => write!(f, "removing"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Dead => write!(f, "dead"),
            ContainerState::Unknown(s) => write!(f, "{}", s),
        }
    }
}

/// Snapshot of a container, keyed by its engine ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    /// Human readable status from the engine ("Exited (0) 3 seconds ago").
    pub status: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<ContainerSummary> for Container {
    fn from(summary: ContainerSummary) -> Self {
        let name = summary
            .names
            .and_then(|names| names.into_iter().next())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();

        Self {
            id: summary.id.unwrap_or_default(),
            name,
            image: summary.image.unwrap_or_default(),
            state: summary
                .state
                .as_deref()
                .map(ContainerState::from)
                .unwrap_or_else(|| ContainerState::Unknown(String::new())),
            status: summary.status,
            created_at: summary
                .created
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        }
    }
}

/// Generates a unique container name carrying the fnbox prefix.
pub fn generate_container_name() -> String {
    format!("{NAME_PREFIX}-{}", Uuid::new_v4())
}

/// Adds the fnbox namespace to an image name that lacks it.
fn normalize_image_name(image: &str) -> String {
    let prefix = format!("{NAME_PREFIX}/");
    if image.starts_with(&prefix) {
        image.to_string()
    } else {
        format!("{prefix}{image}")
    }
}

/// Creates, finds, lists, kills and removes fnbox containers.
#[derive(Clone)]
pub struct ContainerManager {
    engine: Arc<dyn ContainerEngine>,
}

impl ContainerManager {
    /// Creates a manager on top of `engine`.
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Creates (but does not start) a container for `spec`.
    pub async fn create_container(&self, spec: &ContainerSpec) -> Result<Container, ProvisionError> {
        let name = generate_container_name();
        let id = self.engine.create_container(&name, spec.to_config()).await?;
        info!(container = %id, name = %name, image = %spec.image, "Created container");

        Ok(Container {
            id,
            name,
            image: spec.image.clone(),
            state: ContainerState::Created,
            status: None,
            created_at: Some(Utc::now()),
        })
    }

    /// Removes a container whether or not it is running.
    pub async fn remove_container(&self, id: &str) -> Result<(), ProvisionError> {
        self.engine.remove_container(id, true).await?;
        info!(container = %id, "Removed container");
        Ok(())
    }

    /// Kills a running container without removing it.
    pub async fn kill_container(&self, id: &str) -> Result<(), ProvisionError> {
        self.engine.kill_container(id).await?;
        info!(container = %id, "Killed container");
        Ok(())
    }

    /// Finds a container (running or stopped) by engine ID.
    pub async fn find_container_by_id(&self, id: &str) -> Result<Container, ProvisionError> {
        self.engine
            .list_containers(true)
            .await?
            .into_iter()
            .find(|c| c.id.as_deref() == Some(id))
            .map(Container::from)
            .ok_or_else(|| ProvisionError::ContainerNotFound(id.to_string()))
    }

    /// Finds the first container created from `image`.
    ///
    /// Bare names are compared as `fnbox/<image>`.
    pub async fn find_container_by_image(&self, image: &str) -> Result<Container, ProvisionError> {
        let image = normalize_image_name(image);
        self.engine
            .list_containers(true)
            .await?
            .into_iter()
            .find(|c| c.image.as_deref() == Some(image.as_str()))
            .map(Container::from)
            .ok_or(ProvisionError::ContainerNotFound(image))
    }

    /// Lists every container whose image lives in the fnbox namespace.
    pub async fn list_containers(&self) -> Result<Vec<Container>, ProvisionError> {
        let prefix = format!("{NAME_PREFIX}/");
        Ok(self
            .engine
            .list_containers(true)
            .await?
            .into_iter()
            .filter(|c| c.image.as_deref().is_some_and(|i| i.starts_with(&prefix)))
            .map(Container::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::{EngineCall, RecordingEngine};

    fn summary(id: &str, image: &str, state: &str) -> ContainerSummary {
        ContainerSummary {
            id: Some(id.to_string()),
            names: Some(vec![format!("/fnbox-{id}")]),
            image: Some(image.to_string()),
            state: Some(state.to_string()),
            created: Some(1_700_000_000),
            ..Default::default()
        }
    }

    fn engine_with(containers: Vec<ContainerSummary>) -> Arc<RecordingEngine> {
        Arc::new(RecordingEngine {
            containers,
            ..Default::default()
        })
    }

    #[test]
    fn test_container_spec_config() {
        let spec = ContainerSpec::new("fnbox/app")
            .with_cmd(vec!["python".to_string(), "main.py".to_string()])
            .with_env(vec!["FOO=bar".to_string()])
            .with_volumes(vec!["/data:/data:ro".to_string()])
            .with_runtime("runsc");

        let config = spec.to_config();
        assert_eq!(config.image.as_deref(), Some("fnbox/app"));
        assert_eq!(config.cmd.as_ref().map(Vec::len), Some(2));
        assert_eq!(config.open_stdin, Some(true));
        assert_eq!(config.stdin_once, Some(true));
        assert_eq!(config.attach_stdout, Some(true));
        let host = config.host_config.expect("host config");
        assert_eq!(host.binds, Some(vec!["/data:/data:ro".to_string()]));
        assert_eq!(host.runtime.as_deref(), Some("runsc"));
    }

    #[test]
    fn test_container_spec_defaults_leave_image_command() {
        let config = ContainerSpec::new("alpine").to_config();
        assert_eq!(config.cmd, None);
        assert_eq!(config.env, None);
        assert_eq!(config.host_config.and_then(|h| h.binds), None);
    }

    #[test]
    fn test_container_state_parsing() {
        assert_eq!(ContainerState::from("running"), ContainerState::Running);
        assert_eq!(ContainerState::from("exited"), ContainerState::Exited);
        assert_eq!(
            ContainerState::from("weird"),
            ContainerState::Unknown("weird".to_string())
        );
        assert_eq!(ContainerState::Dead.to_string(), "dead");
    }

    #[test]
    fn test_container_from_summary() {
        let container = Container::from(summary("abc", "fnbox/app", "exited"));
        assert_eq!(container.id, "abc");
        assert_eq!(container.name, "fnbox-abc");
        assert_eq!(container.state, ContainerState::Exited);
        assert_eq!(
            container.created_at.map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn test_generated_names_are_unique_and_prefixed() {
        let a = generate_container_name();
        let b = generate_container_name();
        assert!(a.starts_with("fnbox-"));
        assert_eq!(a.len(), "fnbox-".len() + 36);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_create_container() {
        let engine = Arc::new(RecordingEngine::new());
        let manager = ContainerManager::new(engine.clone());

        let container = manager
            .create_container(&ContainerSpec::new("fnbox/app"))
            .await
            .unwrap();

        assert_eq!(container.id, "id-1");
        assert_eq!(container.state, ContainerState::Created);
        assert!(container.name.starts_with("fnbox-"));
        assert_eq!(engine.calls(), vec![EngineCall::Create(container.name.clone())]);
        // created only, never started
        assert!(!engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::Start(_))));
    }

    #[tokio::test]
    async fn test_remove_is_forced_and_kill_does_not_remove() {
        let engine = Arc::new(RecordingEngine::new());
        let manager = ContainerManager::new(engine.clone());

        manager.kill_container("abc").await.unwrap();
        manager.remove_container("abc").await.unwrap();

        assert_eq!(
            engine.calls(),
            vec![
                EngineCall::Kill("abc".to_string()),
                EngineCall::Remove {
                    id: "abc".to_string(),
                    force: true
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_find_container_by_id() {
        let engine = engine_with(vec![
            summary("one", "fnbox/a", "running"),
            summary("two", "redis", "exited"),
        ]);
        let manager = ContainerManager::new(engine.clone());

        let found = manager.find_container_by_id("two").await.unwrap();
        assert_eq!(found.image, "redis");
        assert_eq!(engine.calls()[0], EngineCall::ListContainers { all: true });

        let err = manager.find_container_by_id("three").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_find_container_by_image_normalizes_prefix() {
        let engine = engine_with(vec![
            summary("one", "app", "running"),
            summary("two", "fnbox/app", "running"),
        ]);
        let manager = ContainerManager::new(engine);

        assert_eq!(manager.find_container_by_image("app").await.unwrap().id, "two");
        assert_eq!(
            manager.find_container_by_image("fnbox/app").await.unwrap().id,
            "two"
        );
        assert!(matches!(
            manager.find_container_by_image("other").await,
            Err(ProvisionError::ContainerNotFound(ref name)) if name == "fnbox/other"
        ));
    }

    #[tokio::test]
    async fn test_list_containers_filters_by_prefix() {
        let engine = engine_with(vec![
            summary("one", "fnbox/a", "running"),
            summary("two", "postgres:16", "running"),
            summary("three", "fnbox/b:v1", "exited"),
            summary("four", "fnboxish/c", "exited"),
            ContainerSummary::default(),
        ]);
        let manager = ContainerManager::new(engine);

        let ids: Vec<String> = manager
            .list_containers()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();

        assert_eq!(ids, vec!["one".to_string(), "three".to_string()]);
    }
}
