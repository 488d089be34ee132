//! Engine endpoints and the provisioning seam.
//!
//! fnbox never provisions hosts itself. A [`Provisioner`] (for example a
//! cloud VM driver) hands back a ready [`Machine`]; the only thing read from
//! it is how to reach its container engine.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProvisionError;
use crate::execution::NAME_PREFIX;

/// TLS port exposed by engines on provisioned hosts.
pub const ENGINE_TLS_PORT: u16 = 2376;

/// How to reach a container engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEndpoint {
    /// Platform default (local socket, honouring `DOCKER_HOST`).
    Local,
    /// Explicit unix socket path.
    Socket { path: String },
    /// Plain TCP endpoint (`tcp://host:2375`).
    Http { address: String },
    /// TLS endpoint with client certificates.
    Tls {
        address: String,
        ca: PathBuf,
        cert: PathBuf,
        key: PathBuf,
    },
}

impl EngineEndpoint {
    /// Builds an endpoint from a `DOCKER_HOST`-style address.
    ///
    /// TCP addresses use TLS when `cert_dir` is given, expecting the usual
    /// `ca.pem`, `cert.pem` and `key.pem` inside it.
    pub fn from_host(host: &str, cert_dir: Option<&Path>) -> Result<Self, ProvisionError> {
        let host = host.trim();
        if host.is_empty() {
            return Ok(EngineEndpoint::Local);
        }

        if let Some(path) = host.strip_prefix("unix://") {
            return Ok(EngineEndpoint::Socket {
                path: path.to_string(),
            });
        }

        if host.starts_with("tcp://") || host.starts_with("http://") || host.starts_with("https://") {
            return Ok(match cert_dir {
                Some(dir) => EngineEndpoint::tls(host, dir),
                None => EngineEndpoint::Http {
                    address: host.to_string(),
                },
            });
        }

        Err(ProvisionError::Config(format!(
            "unsupported engine address '{host}' (expected unix://, tcp://, http:// or https://)"
        )))
    }

    /// TLS endpoint using the certificate layout of `cert_dir`.
    pub fn tls(address: impl Into<String>, cert_dir: &Path) -> Self {
        EngineEndpoint::Tls {
            address: address.into(),
            ca: cert_dir.join("ca.pem"),
            cert: cert_dir.join("cert.pem"),
            key: cert_dir.join("key.pem"),
        }
    }

    /// Endpoint of the engine running on a provisioned machine.
    ///
    /// # Errors
    ///
    /// Returns `ProvisionError::Config` if the machine has no address.
    pub fn from_machine(machine: &Machine) -> Result<Self, ProvisionError> {
        if machine.ip.is_empty() {
            return Err(ProvisionError::Config(format!(
                "machine '{}' has no IP address",
                machine.name
            )));
        }

        let address = format!("tcp://{}:{ENGINE_TLS_PORT}", machine.ip);
        Ok(match &machine.certs_dir {
            Some(dir) => EngineEndpoint::tls(address, dir),
            None => EngineEndpoint::Http { address },
        })
    }
}

/// A host created by a provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub ip: String,
    /// Provider image (distribution) the host was created from.
    pub image: String,
    /// Provider kind, e.g. "digitalocean".
    pub kind: String,
    /// Directory holding the engine's client TLS certificates.
    pub certs_dir: Option<PathBuf>,
}

/// External collaborator that creates and destroys engine hosts.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Creates a host and returns it once its engine accepts connections.
    async fn create_machine(&self) -> Result<Machine, ProvisionError>;

    /// Destroys a host created by `create_machine`.
    async fn delete_machine(&self, machine: &Machine) -> Result<(), ProvisionError>;
}

/// Generates a unique host name carrying the fnbox prefix.
pub fn generate_host_name() -> String {
    format!("{NAME_PREFIX}-{}", Uuid::new_v4())
}

/// Creates a host through `provisioner` and returns it with its engine endpoint.
pub async fn provision_endpoint(
    provisioner: &dyn Provisioner,
) -> Result<(Machine, EngineEndpoint), ProvisionError> {
    let machine = provisioner.create_machine().await?;
    let endpoint = EngineEndpoint::from_machine(&machine)?;
    tracing::info!(machine = %machine.name, ip = %machine.ip, "Provisioned engine host");
    Ok((machine, endpoint))
}
