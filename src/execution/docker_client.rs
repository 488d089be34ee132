//! Container engine API wrapper using the bollard crate.
//!
//! [`ContainerEngine`] is the narrow set of engine calls the execution layer
//! needs. [`DockerEngine`] implements it against a live daemon; tests swap in
//! an in-memory engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions, ListImagesOptions};
use bollard::models::{ContainerSummary, ImageSummary};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::{Stream, StreamExt};
use tokio::io::AsyncWrite;
use tracing::debug;

use crate::error::ProvisionError;
use crate::execution::endpoint::EngineEndpoint;
use crate::execution::registry::{self, DEFAULT_REGISTRY};

/// Stream of demultiplexed container output frames.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogOutput, ProvisionError>> + Send>>;

/// Both halves of an attached container stream.
pub struct AttachStreams {
    /// Output frames (stdout/stderr) produced while attached.
    pub output: LogStream,
    /// Writer connected to the container's standard input.
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

/// Where an image build reads its context from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildContext {
    /// Local directory, archived and uploaded with the request.
    Directory(PathBuf),
    /// Remote URI (git repository or tarball URL) fetched by the engine.
    Remote(String),
}

/// A fully resolved image build request.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Name (tag) given to the built image.
    pub image_name: String,
    /// Dockerfile path relative to the context.
    pub dockerfile: String,
    /// Build context.
    pub context: BuildContext,
    /// Registry credentials for base image pulls.
    pub credentials: Option<DockerCredentials>,
}

/// Engine calls used by the image resolver, lifecycle manager and executor.
///
/// Implementations must be safe to share across concurrent executions.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Validates registry credentials, returning an identity token when the
    /// registry issues one.
    async fn check_auth(
        &self,
        credentials: &DockerCredentials,
    ) -> Result<Option<String>, ProvisionError>;

    /// Builds an image quietly and returns the captured build log.
    async fn build_image(&self, request: BuildRequest) -> Result<String, ProvisionError>;

    /// Pulls `repository` at `tag` (empty tag for digest references).
    async fn pull_image(
        &self,
        repository: &str,
        tag: &str,
        credentials: Option<DockerCredentials>,
    ) -> Result<(), ProvisionError>;

    /// Lists local images matching a reference filter, in engine order.
    async fn list_images(&self, filter: &str) -> Result<Vec<ImageSummary>, ProvisionError>;

    /// Creates a container named `name` and returns its engine-assigned ID.
    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> Result<String, ProvisionError>;

    /// Starts a created container.
    async fn start_container(&self, id: &str) -> Result<(), ProvisionError>;

    /// Sends the engine's default kill signal to a running container.
    async fn kill_container(&self, id: &str) -> Result<(), ProvisionError>;

    /// Removes a container, optionally even when it is running.
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), ProvisionError>;

    /// Lists containers; `all` includes stopped ones.
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, ProvisionError>;

    /// Opens a bidirectional stream to a container's stdio.
    async fn attach_container(&self, id: &str) -> Result<AttachStreams, ProvisionError>;

    /// Blocks until the container stops and returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, ProvisionError>;

    /// Streams the complete stdout/stderr history of a container.
    fn logs(&self, id: &str) -> LogStream;
}

/// bollard-backed engine client.
///
/// The underlying connection is stateless and cheap to clone.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
    http: reqwest::Client,
}

impl DockerEngine {
    /// Creates a client connected to the local engine (socket or `DOCKER_HOST`).
    ///
    /// # Errors
    ///
    /// Returns `ProvisionError::Engine` if the connection cannot be set up.
    pub fn new() -> Result<Self, ProvisionError> {
        Ok(Self::from_docker(Docker::connect_with_local_defaults()?))
    }

    /// Wraps an existing bollard client.
    pub fn from_docker(docker: Docker) -> Self {
        Self {
            docker,
            http: reqwest::Client::new(),
        }
    }

    /// Connects to the engine described by `endpoint`.
    ///
    /// `timeout_secs` bounds each request to the engine.
    pub fn connect(endpoint: &EngineEndpoint, timeout_secs: u64) -> Result<Self, ProvisionError> {
        let docker = match endpoint {
            EngineEndpoint::Local => Docker::connect_with_local_defaults()?,
            #[cfg(unix)]
            EngineEndpoint::Socket { path } => {
                Docker::connect_with_unix(path, timeout_secs, API_DEFAULT_VERSION)?
            }
            #[cfg(not(unix))]
            EngineEndpoint::Socket { path } => {
                return Err(ProvisionError::Config(format!(
                    "unix socket endpoint '{path}' is not supported on this platform"
                )))
            }
            EngineEndpoint::Http { address } => {
                Docker::connect_with_http(address, timeout_secs, API_DEFAULT_VERSION)?
            }
            EngineEndpoint::Tls {
                address,
                ca,
                cert,
                key,
            } => Docker::connect_with_ssl(address, key, cert, ca, timeout_secs, API_DEFAULT_VERSION)?,
        };
        debug!(endpoint = ?endpoint, "Connected to container engine");
        Ok(Self::from_docker(docker))
    }
}

/// Archives a build context directory into an in-memory tarball.
fn archive_context(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", dir)?;
    builder.into_inner()
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn check_auth(
        &self,
        credentials: &DockerCredentials,
    ) -> Result<Option<String>, ProvisionError> {
        registry::login(&self.http, credentials).await
    }

    async fn build_image(&self, request: BuildRequest) -> Result<String, ProvisionError> {
        let (remote, context) = match request.context {
            BuildContext::Directory(dir) => {
                let tarball = tokio::task::spawn_blocking(move || archive_context(&dir))
                    .await
                    .map_err(std::io::Error::other)??;
                (String::new(), Some(tarball))
            }
            BuildContext::Remote(uri) => (uri, None),
        };

        let options = BuildImageOptions {
            dockerfile: request.dockerfile,
            t: request.image_name,
            remote,
            q: true,
            rm: true,
            ..Default::default()
        };

        let credentials = request.credentials.map(|creds| {
            let server = creds
                .serveraddress
                .clone()
                .unwrap_or_else(|| DEFAULT_REGISTRY.to_string());
            HashMap::from([(server, creds)])
        });

        let mut stream = self
            .docker
            .build_image(options, credentials, context.map(Into::into));
        let mut log = String::new();

        while let Some(item) = stream.next().await {
            let info = item?;
            if let Some(error) = info.error {
                return Err(ProvisionError::BuildFailed(error));
            }
            if let Some(line) = info.stream {
                log.push_str(&line);
            }
        }

        Ok(log)
    }

    async fn pull_image(
        &self,
        repository: &str,
        tag: &str,
        credentials: Option<DockerCredentials>,
    ) -> Result<(), ProvisionError> {
        let options = CreateImageOptions {
            from_image: repository.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, credentials);

        while let Some(result) = stream.next().await {
            result?;
        }

        Ok(())
    }

    async fn list_images(&self, filter: &str) -> Result<Vec<ImageSummary>, ProvisionError> {
        let options = ListImagesOptions {
            filters: HashMap::from([("reference".to_string(), vec![filter.to_string()])]),
            ..Default::default()
        };

        Ok(self.docker.list_images(Some(options)).await?)
    }

    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> Result<String, ProvisionError> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let response = self.docker.create_container(Some(options), config).await?;
        for warning in &response.warnings {
            debug!(container = %response.id, warning = %warning, "Engine warning on create");
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), ProvisionError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), ProvisionError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), ProvisionError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };

        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, ProvisionError> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };

        Ok(self.docker.list_containers(Some(options)).await?)
    }

    async fn attach_container(&self, id: &str) -> Result<AttachStreams, ProvisionError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            detach_keys: None,
        };

        let AttachContainerResults { output, input } =
            self.docker.attach_container(id, Some(options)).await?;

        Ok(AttachStreams {
            output: output.map(|item| item.map_err(ProvisionError::from)).boxed(),
            input,
        })
    }

    async fn wait_container(&self, id: &str) -> Result<i64, ProvisionError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => return Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                return Ok(code)
            }
            Some(Err(e)) => return Err(e.into()),
            None => {}
        }

        // Empty wait stream: fall back to the recorded container state
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        info.state
            .and_then(|state| state.exit_code)
            .ok_or_else(|| ProvisionError::ContainerNotFound(id.to_string()))
    }

    fn logs(&self, id: &str) -> LogStream {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            ..Default::default()
        };

        self.docker
            .logs(id, Some(options))
            .map(|item| item.map_err(ProvisionError::from))
            .boxed()
    }
}
