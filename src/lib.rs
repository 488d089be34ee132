//! fnbox: run a function inside an ephemeral container.
//!
//! The library resolves an image (build from a context, or pull from a
//! registry), creates a uniquely named container from it, streams input into
//! the container, waits for it to terminate, and hands back the captured
//! output together with a classified outcome.

pub mod cli;
pub mod config;
pub mod error;
pub mod execution;

pub use config::{EngineConfig, FunctionManifest};
pub use error::ProvisionError;
pub use execution::{
    ContainerEngine, ContainerManager, ContainerSpec, DockerEngine, ExecutionResult, Executor,
    ImageResolver, ImageSpec,
};
