//! Configuration for fnbox.
//!
//! Two pieces of configuration exist:
//! - [`EngineConfig`]: how to reach the container engine, read from the
//!   environment
//! - [`FunctionManifest`]: a YAML description of one function (image source,
//!   container options and default input)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;
use crate::execution::{ContainerSpec, EngineEndpoint, ImageSpec};

/// Default per-request engine timeout.
pub const DEFAULT_ENGINE_TIMEOUT_SECS: u64 = 120;

/// How to connect to the container engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Engine address (`unix://`, `tcp://`); the platform default when unset.
    pub host: Option<String>,
    /// Directory with `ca.pem`, `cert.pem` and `key.pem` for TLS endpoints.
    pub cert_path: Option<PathBuf>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: None,
            cert_path: None,
            timeout_secs: DEFAULT_ENGINE_TIMEOUT_SECS,
        }
    }
}

impl EngineConfig {
    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FNBOX_DOCKER_HOST` (falls back to `DOCKER_HOST`): engine address
    /// - `FNBOX_CERT_PATH` (falls back to `DOCKER_CERT_PATH`): TLS certificate directory
    /// - `FNBOX_DOCKER_TIMEOUT_SECS`: request timeout (default: 120)
    ///
    /// # Errors
    ///
    /// Returns `ProvisionError::Config` for unparsable or invalid values.
    pub fn from_env() -> Result<Self, ProvisionError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ProvisionError> {
        let mut config = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        config.host = non_empty("FNBOX_DOCKER_HOST").or_else(|| non_empty("DOCKER_HOST"));
        config.cert_path = non_empty("FNBOX_CERT_PATH")
            .or_else(|| non_empty("DOCKER_CERT_PATH"))
            .map(PathBuf::from);

        if let Some(val) = non_empty("FNBOX_DOCKER_TIMEOUT_SECS") {
            config.timeout_secs = val.trim().parse().map_err(|_| {
                ProvisionError::Config(format!(
                    "FNBOX_DOCKER_TIMEOUT_SECS: cannot parse '{val}' as seconds"
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.timeout_secs == 0 {
            return Err(ProvisionError::Config(
                "engine timeout must be greater than 0".to_string(),
            ));
        }
        self.endpoint().map(|_| ())
    }

    /// The endpoint described by this configuration.
    pub fn endpoint(&self) -> Result<EngineEndpoint, ProvisionError> {
        match &self.host {
            Some(host) => EngineEndpoint::from_host(host, self.cert_path.as_deref()),
            None => Ok(EngineEndpoint::Local),
        }
    }
}

/// A function described in YAML.
///
/// ```yaml
/// image:
///   image_name: hello
///   context_dir: ./functions/hello
/// container:
///   cmd: ["python", "main.py"]
///   env: ["GREETING=hi"]
/// input: "world"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionManifest {
    pub image: ImageSpec,
    /// Container options; `image` is filled in from the resolved image.
    pub container: ContainerSpec,
    /// Default stdin for the function.
    pub input: Option<String>,
}

impl FunctionManifest {
    /// Loads a manifest from a YAML file.
    ///
    /// A relative `context_dir` is resolved against the manifest's directory.
    pub fn from_file(path: &Path) -> Result<Self, ProvisionError> {
        let content = std::fs::read_to_string(path)?;
        let mut manifest = Self::from_yaml(&content)?;

        if let (Some(dir), Some(base)) = (manifest.image.context_dir.as_mut(), path.parent()) {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        Ok(manifest)
    }

    /// Parses a manifest from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ProvisionError> {
        let manifest: Self = serde_yaml::from_str(content)
            .map_err(|e| ProvisionError::Config(format!("invalid function manifest: {e}")))?;

        if manifest.image.image_name.trim().is_empty() {
            return Err(ProvisionError::Config(
                "function manifest must set image.image_name".to_string(),
            ));
        }
        Ok(manifest)
    }
}
