//! Function execution: start, attach, wait, collect logs.
//!
//! The attach stream and the wait call run as independent background tasks.
//! The wait task delivers exactly one outcome through a oneshot channel,
//! exposed as a [`WaitHandle`] future. Neither task kills the container; a
//! caller that wants a deadline races the handle against its own timer and
//! kills the container by ID on expiry.

use std::borrow::Cow;
use std::future::Future;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bollard::container::LogOutput;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::ProvisionError;
use crate::execution::docker_client::{AttachStreams, ContainerEngine};

/// Input fed to an attached container.
pub type InputSource = Box<dyn AsyncRead + Send + Unpin>;

/// Destination for live container output.
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClassification {
    /// Exit code 0.
    Success,
    /// The container ran and exited with a non-zero code.
    NonZeroExit(i64),
    /// The engine could not report an exit code.
    EngineError,
}

/// Captured output and outcome of a run.
///
/// Output is kept even when the run failed.
#[derive(Debug)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub outcome: Result<(), ProvisionError>,
}

impl ExecutionResult {
    /// True when the container exited with code 0.
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn classification(&self) -> ExitClassification {
        match &self.outcome {
            Ok(()) => ExitClassification::Success,
            Err(ProvisionError::ExecutionFailed { exit_code }) => {
                ExitClassification::NonZeroExit(*exit_code)
            }
            Err(_) => ExitClassification::EngineError,
        }
    }

    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    /// Splits into `(stdout, stderr, outcome)`.
    pub fn into_parts(self) -> (Vec<u8>, Vec<u8>, Result<(), ProvisionError>) {
        (self.stdout, self.stderr, self.outcome)
    }
}

/// Handle on a background attach stream.
#[derive(Debug)]
pub struct AttachHandle {
    task: JoinHandle<Result<(), ProvisionError>>,
}

impl AttachHandle {
    /// Waits until input is written and output is drained.
    pub async fn wait(self) -> Result<(), ProvisionError> {
        self.task.await.map_err(|_| ProvisionError::Interrupted)?
    }

    /// Stops streaming. The container is not affected.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Pending outcome of a container wait.
///
/// Resolves to `Ok(())` on exit code 0, `ExecutionFailed` on any other exit
/// code, or the engine error if the wait call itself failed.
#[derive(Debug)]
pub struct WaitHandle {
    receiver: oneshot::Receiver<Result<(), ProvisionError>>,
    task: JoinHandle<()>,
}

impl WaitHandle {
    /// Stops waiting locally. The container keeps running; awaiting the
    /// handle afterwards yields `ProvisionError::Interrupted`.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Future for WaitHandle {
    type Output = Result<(), ProvisionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ProvisionError::Interrupted)))
    }
}

/// Maps a wait result to the execution outcome.
fn classify_exit(waited: Result<i64, ProvisionError>) -> Result<(), ProvisionError> {
    match waited {
        Ok(0) => Ok(()),
        Ok(exit_code) => Err(ProvisionError::ExecutionFailed { exit_code }),
        Err(e) => Err(e),
    }
}

async fn write_frame<W>(sink: Option<&mut W>, message: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match sink {
        Some(sink) => sink.write_all(message).await,
        None => Ok(()),
    }
}

/// Runs created containers to completion.
#[derive(Clone)]
pub struct Executor {
    engine: Arc<dyn ContainerEngine>,
}

impl Executor {
    /// Creates an executor on top of `engine`.
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Starts a created container.
    pub async fn start(&self, id: &str) -> Result<(), ProvisionError> {
        self.engine.start_container(id).await?;
        info!(container = %id, "Started container");
        Ok(())
    }

    /// Attaches to a running container without blocking on it.
    ///
    /// `stdin` is copied into the container and then closed. Output frames
    /// are forwarded to `stdout`/`stderr` when given and dropped otherwise.
    pub async fn attach(
        &self,
        id: &str,
        stdin: Option<InputSource>,
        stdout: Option<OutputSink>,
        stderr: Option<OutputSink>,
    ) -> Result<AttachHandle, ProvisionError> {
        let AttachStreams { mut output, mut input } = self.engine.attach_container(id).await?;
        debug!(container = %id, "Attached to container");

        let mut stdin = stdin;
        let mut stdout = stdout;
        let mut stderr = stderr;
        let task = tokio::spawn(async move {
            let feed = async {
                if let Some(reader) = stdin.as_mut() {
                    tokio::io::copy(reader, &mut input).await?;
                }
                input.shutdown().await?;
                Ok::<(), ProvisionError>(())
            };

            let drain = async {
                while let Some(frame) = output.next().await {
                    match frame? {
                        LogOutput::StdErr { message } => {
                            write_frame(stderr.as_deref_mut(), &message).await?
                        }
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            write_frame(stdout.as_deref_mut(), &message).await?
                        }
                        LogOutput::StdIn { .. } => {}
                    }
                }
                for sink in [stdout.as_deref_mut(), stderr.as_deref_mut()].into_iter().flatten() {
                    sink.flush().await?;
                }
                Ok::<(), ProvisionError>(())
            };

            let (fed, drained) = tokio::join!(feed, drain);
            fed?;
            drained
        });

        Ok(AttachHandle { task })
    }

    /// Waits for the container to stop in a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn wait_container(&self, id: &str) -> WaitHandle {
        let (sender, receiver) = oneshot::channel();
        let engine = Arc::clone(&self.engine);
        let container = id.to_string();

        let task = tokio::spawn(async move {
            let outcome = classify_exit(engine.wait_container(&container).await);
            match &outcome {
                Ok(()) => info!(container = %container, "Container exited successfully"),
                Err(e) => info!(container = %container, error = %e, "Container did not succeed"),
            }
            // The receiver may already be gone; the outcome is then unobserved.
            let _ = sender.send(outcome);
        });

        WaitHandle { receiver, task }
    }

    /// Copies the full stdout/stderr history of a container into the sinks.
    pub async fn logs<O, E>(
        &self,
        id: &str,
        stdout: &mut O,
        stderr: &mut E,
    ) -> Result<(), ProvisionError>
    where
        O: AsyncWrite + Unpin + ?Sized,
        E: AsyncWrite + Unpin + ?Sized,
    {
        let mut frames = self.engine.logs(id);

        while let Some(frame) = frames.next().await {
            match frame? {
                LogOutput::StdErr { message } => stderr.write_all(&message).await?,
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.write_all(&message).await?
                }
                LogOutput::StdIn { .. } => {}
            }
        }

        stdout.flush().await?;
        stderr.flush().await?;
        Ok(())
    }

    /// Runs a created container with `input` on its stdin.
    ///
    /// Start and attach failures are returned as errors. Once the container
    /// is running, the result always carries whatever output the engine
    /// kept, alongside the exit outcome. A failed log fetch never replaces
    /// that outcome.
    pub async fn run(&self, id: &str, input: &[u8]) -> Result<ExecutionResult, ProvisionError> {
        self.start(id).await?;

        let reader: InputSource = Box::new(Cursor::new(input.to_vec()));
        let attach = self.attach(id, Some(reader), None, None).await?;

        let outcome = self.wait_container(id).await;
        attach.abort();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Err(e) = self.logs(id, &mut stdout, &mut stderr).await {
            debug!(container = %id, error = %e, "Log retrieval failed, keeping execution outcome");
        }

        Ok(ExecutionResult {
            stdout,
            stderr,
            outcome,
        })
    }
}
