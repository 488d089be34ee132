//! Container execution layer for fnbox functions.
//!
//! All engine traffic goes through the [`ContainerEngine`] trait; the
//! production implementation is [`DockerEngine`], backed by the bollard crate.
//!
//! # Architecture
//!
//! ```text
//! ImageResolver ──image name──▶ ContainerManager ──container id──▶ Executor
//!  (build / pull / auth)         (create / find / kill / remove)    (start, attach, wait, logs)
//! ```
//!
//! An execution moves through a linear state machine:
//! ```text
//! CREATED → STARTED → ATTACHED → WAITING → TERMINATED
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fnbox::execution::{ContainerManager, ContainerSpec, DockerEngine, Executor, ImageResolver, ImageSpec};
//!
//! let engine = Arc::new(DockerEngine::new()?);
//! let image = ImageResolver::new(engine.clone())
//!     .resolve(&ImageSpec::new("python:3.12-slim").without_prefix().force_pull())
//!     .await?;
//! let container = ContainerManager::new(engine.clone())
//!     .create_container(&ContainerSpec::new(&image.name).with_cmd(vec!["cat".into()]))
//!     .await?;
//! let result = Executor::new(engine.clone()).run(&container.id, b"hello").await?;
//! ```

pub mod container;
pub mod docker_client;
pub mod endpoint;
pub mod image;
pub mod registry;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

pub use container::{Container, ContainerManager, ContainerSpec, ContainerState};
pub use docker_client::{AttachStreams, BuildContext, BuildRequest, ContainerEngine, DockerEngine};
pub use endpoint::{EngineEndpoint, Machine, Provisioner};
pub use image::{ImageRecord, ImageResolver, ImageSpec, RegistryAuth, ResolvedImage};
pub use runner::{AttachHandle, ExecutionResult, ExitClassification, Executor, WaitHandle};

/// Prefix carried by every container, image namespace and host fnbox creates.
pub const NAME_PREFIX: &str = "fnbox";
