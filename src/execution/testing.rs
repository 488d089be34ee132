//! In-memory engine for unit tests.
//!
//! Responses are scripted through public fields and every call is recorded
//! so tests can assert on ordering and arguments.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{Config, LogOutput};
use bollard::models::{ContainerSummary, ImageSummary};
use futures::StreamExt;
use tokio::io::AsyncWrite;
use tokio::sync::Notify;

use crate::error::ProvisionError;
use crate::execution::docker_client::{
    AttachStreams, BuildContext, BuildRequest, ContainerEngine, LogStream,
};

/// A recorded engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CheckAuth { server: Option<String> },
    Build { image: String, dockerfile: String, context: BuildContext },
    Pull { repository: String, tag: String, identity_token: Option<String> },
    ListImages(String),
    Create(String),
    Start(String),
    Kill(String),
    Remove { id: String, force: bool },
    ListContainers { all: bool },
    Attach(String),
    Wait(String),
    Logs(String),
}

/// Engine double with scripted responses.
#[derive(Default)]
pub struct RecordingEngine {
    pub calls: Mutex<Vec<EngineCall>>,
    pub created: Mutex<Vec<(String, Config<String>)>>,
    pub auth_token: Option<String>,
    pub auth_error: Option<String>,
    pub build_error: Option<String>,
    pub build_log: String,
    pub pull_error: Option<String>,
    pub start_error: Option<String>,
    pub images: Vec<ImageSummary>,
    pub containers: Vec<ContainerSummary>,
    /// Exit code, or an engine error message.
    pub wait_result: Option<Result<i64, String>>,
    /// When set, the wait call blocks until notified.
    pub wait_gate: Option<Arc<Notify>>,
    pub attach_output: Vec<LogOutput>,
    pub log_output: Vec<LogOutput>,
    pub logs_error: Option<String>,
    /// Bytes written to the attached stdin.
    pub stdin: Arc<Mutex<Vec<u8>>>,
    /// When set, the wait call blocks until the attached stdin is closed.
    pub wait_for_stdin: bool,
    pub stdin_closed: Arc<Notify>,
}

/// Engine-side error carrying `message`, as the daemon would report it.
pub fn engine_error(message: &str) -> ProvisionError {
    ProvisionError::Engine(bollard::errors::Error::DockerResponseServerError {
        status_code: 500,
        message: message.to_string(),
    })
}

pub fn stdout_frame(text: &str) -> LogOutput {
    LogOutput::StdOut {
        message: text.as_bytes().to_vec().into(),
    }
}

pub fn stderr_frame(text: &str) -> LogOutput {
    LogOutput::StdErr {
        message: text.as_bytes().to_vec().into(),
    }
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stdin_bytes(&self) -> Vec<u8> {
        self.stdin.lock().unwrap().clone()
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().unwrap().push(call);
    }
}

/// AsyncWrite that appends into a shared buffer.
struct CaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
    closed: Arc<Notify>,
}

impl AsyncWrite for CaptureWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.closed.notify_one();
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl ContainerEngine for RecordingEngine {
    async fn check_auth(
        &self,
        credentials: &DockerCredentials,
    ) -> Result<Option<String>, ProvisionError> {
        self.record(EngineCall::CheckAuth {
            server: credentials.serveraddress.clone(),
        });
        match &self.auth_error {
            Some(message) => Err(ProvisionError::Registry(message.clone())),
            None => Ok(self.auth_token.clone()),
        }
    }

    async fn build_image(&self, request: BuildRequest) -> Result<String, ProvisionError> {
        self.record(EngineCall::Build {
            image: request.image_name,
            dockerfile: request.dockerfile,
            context: request.context,
        });
        match &self.build_error {
            Some(message) => Err(engine_error(message)),
            None => Ok(self.build_log.clone()),
        }
    }

    async fn pull_image(
        &self,
        repository: &str,
        tag: &str,
        credentials: Option<DockerCredentials>,
    ) -> Result<(), ProvisionError> {
        self.record(EngineCall::Pull {
            repository: repository.to_string(),
            tag: tag.to_string(),
            identity_token: credentials.and_then(|c| c.identitytoken),
        });
        match &self.pull_error {
            Some(message) => Err(engine_error(message)),
            None => Ok(()),
        }
    }

    async fn list_images(&self, filter: &str) -> Result<Vec<ImageSummary>, ProvisionError> {
        self.record(EngineCall::ListImages(filter.to_string()));
        Ok(self.images.clone())
    }

    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> Result<String, ProvisionError> {
        self.record(EngineCall::Create(name.to_string()));
        let id = format!("id-{}", self.created.lock().unwrap().len() + 1);
        self.created.lock().unwrap().push((name.to_string(), config));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), ProvisionError> {
        self.record(EngineCall::Start(id.to_string()));
        match &self.start_error {
            Some(message) => Err(engine_error(message)),
            None => Ok(()),
        }
    }

    async fn kill_container(&self, id: &str) -> Result<(), ProvisionError> {
        self.record(EngineCall::Kill(id.to_string()));
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), ProvisionError> {
        self.record(EngineCall::Remove {
            id: id.to_string(),
            force,
        });
        Ok(())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, ProvisionError> {
        self.record(EngineCall::ListContainers { all });
        Ok(self.containers.clone())
    }

    async fn attach_container(&self, id: &str) -> Result<AttachStreams, ProvisionError> {
        self.record(EngineCall::Attach(id.to_string()));
        let frames: Vec<Result<LogOutput, ProvisionError>> =
            self.attach_output.iter().cloned().map(Ok).collect();
        Ok(AttachStreams {
            output: futures::stream::iter(frames).boxed(),
            input: Box::pin(CaptureWriter {
                buffer: Arc::clone(&self.stdin),
                closed: Arc::clone(&self.stdin_closed),
            }),
        })
    }

    async fn wait_container(&self, id: &str) -> Result<i64, ProvisionError> {
        self.record(EngineCall::Wait(id.to_string()));
        if let Some(gate) = &self.wait_gate {
            gate.notified().await;
        }
        if self.wait_for_stdin {
            self.stdin_closed.notified().await;
        }
        match &self.wait_result {
            Some(Ok(code)) => Ok(*code),
            Some(Err(message)) => Err(engine_error(message)),
            None => Ok(0),
        }
    }

    fn logs(&self, id: &str) -> LogStream {
        self.record(EngineCall::Logs(id.to_string()));
        let mut frames: Vec<Result<LogOutput, ProvisionError>> =
            self.log_output.iter().cloned().map(Ok).collect();
        if let Some(message) = &self.logs_error {
            frames.push(Err(engine_error(message)));
        }
        futures::stream::iter(frames).boxed()
    }
}
