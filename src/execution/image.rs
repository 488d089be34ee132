//! Image resolution: build from a context, or pull from a registry.
//!
//! Resolution never fails just because a context has no Dockerfile: in that
//! case the resolved name is pulled instead. Any other build error is final.

use std::path::PathBuf;
use std::sync::Arc;

use bollard::auth::DockerCredentials;
use bollard::models::ImageSummary;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::execution::docker_client::{BuildContext, BuildRequest, ContainerEngine};
use crate::execution::registry::DEFAULT_REGISTRY;
use crate::execution::NAME_PREFIX;

/// Dockerfile used when none is named.
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Build context used when neither a directory nor a remote URI is given.
pub const DEFAULT_CONTEXT_DIR: &str = "./";

/// Tag pulled when a reference has neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// Engine message for a build whose context lacks the Dockerfile.
///
/// The engine exposes no structured code for this case, so the message is
/// matched verbatim. Other engines or versions may word it differently.
pub const MISSING_DOCKERFILE_MESSAGE: &str = "Cannot locate specified Dockerfile";

/// Registry credentials for builds and pulls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryAuth {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    /// Registry address; the public registry when unset.
    pub server_address: Option<String>,
}

impl RegistryAuth {
    /// Creates credentials for `username` on the public registry.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..Default::default()
        }
    }

    /// Sets the registry server address.
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server_address = Some(server.into());
        self
    }

    /// True when an identity (username or email) and a password are present.
    pub fn has_credentials(&self) -> bool {
        let identity = [&self.username, &self.email]
            .into_iter()
            .any(|field| field.as_deref().is_some_and(|v| !v.is_empty()));
        identity && self.password.as_deref().is_some_and(|p| !p.is_empty())
    }

    fn to_credentials(&self) -> DockerCredentials {
        DockerCredentials {
            username: self.username.clone(),
            password: self.password.clone(),
            email: self.email.clone(),
            serveraddress: Some(
                self.server_address
                    .clone()
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| DEFAULT_REGISTRY.to_string()),
            ),
            ..Default::default()
        }
    }
}

/// What image to produce and where it comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSpec {
    /// Target image name, namespaced under the fnbox prefix unless `no_prefix`.
    pub image_name: String,
    /// Local build context directory.
    pub context_dir: Option<PathBuf>,
    /// Remote build context (git URL or tarball URL); wins over `context_dir`.
    pub remote_uri: Option<String>,
    /// Dockerfile path within the context.
    pub dockerfile: String,
    /// Use `image_name` verbatim.
    pub no_prefix: bool,
    /// Skip the build and pull directly.
    pub force_pull: bool,
    /// Optional registry credentials.
    pub auth: Option<RegistryAuth>,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            image_name: String::new(),
            context_dir: None,
            remote_uri: None,
            dockerfile: DEFAULT_DOCKERFILE.to_string(),
            no_prefix: false,
            force_pull: false,
            auth: None,
        }
    }
}

impl ImageSpec {
    /// Creates a spec for `image_name` built from the current directory.
    pub fn new(image_name: impl Into<String>) -> Self {
        Self {
            image_name: image_name.into(),
            ..Default::default()
        }
    }

    /// Sets the local build context.
    pub fn with_context_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.context_dir = Some(dir.into());
        self
    }

    /// Sets a remote build context.
    pub fn with_remote_uri(mut self, uri: impl Into<String>) -> Self {
        self.remote_uri = Some(uri.into());
        self
    }

    /// Sets the Dockerfile name.
    pub fn with_dockerfile(mut self, dockerfile: impl Into<String>) -> Self {
        self.dockerfile = dockerfile.into();
        self
    }

    /// Sets registry credentials.
    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Keeps the image name free of the fnbox prefix.
    pub fn without_prefix(mut self) -> Self {
        self.no_prefix = true;
        self
    }

    /// Pulls instead of building.
    pub fn force_pull(mut self) -> Self {
        self.force_pull = true;
        self
    }

    /// The name the image is built or pulled under.
    pub fn image_name(&self) -> String {
        if self.no_prefix {
            self.image_name.clone()
        } else {
            prefixed_image_name(&self.image_name)
        }
    }

    /// Fills in the Dockerfile and context defaults.
    pub fn normalize(&mut self) {
        if self.dockerfile.is_empty() {
            self.dockerfile = DEFAULT_DOCKERFILE.to_string();
        }
        let has_remote = self.remote_uri.as_deref().is_some_and(|u| !u.is_empty());
        let has_context = self
            .context_dir
            .as_ref()
            .is_some_and(|d| !d.as_os_str().is_empty());
        if !has_remote && !has_context {
            self.context_dir = Some(PathBuf::from(DEFAULT_CONTEXT_DIR));
        }
    }

    /// Build context of a normalized spec.
    pub fn build_context(&self) -> BuildContext {
        match self.remote_uri.as_deref().filter(|u| !u.is_empty()) {
            Some(uri) => BuildContext::Remote(uri.to_string()),
            None => BuildContext::Directory(
                self.context_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTEXT_DIR)),
            ),
        }
    }
}

/// Namespaces `name` under the fnbox prefix.
pub fn prefixed_image_name(name: &str) -> String {
    format!("{NAME_PREFIX}/{}", name.trim_start_matches('/'))
}

/// Splits an image reference into repository and tag.
///
/// A tag after the last `:` is honoured unless it contains `/` (a registry
/// port). Without a tag the result is `latest`, except for digest references
/// (`name@sha256:...`) which keep the whole reference as the repository and
/// an empty tag.
pub fn parse_image_reference(image: &str) -> (String, String) {
    let without_digest = image.split('@').next().unwrap_or(image);
    let mut repository = without_digest;

    if let Some(index) = without_digest.rfind(':') {
        let tag = &without_digest[index + 1..];
        if !tag.contains('/') {
            if !tag.is_empty() {
                return (without_digest[..index].to_string(), tag.to_string());
            }
            // "app:" carries no tag; an empty tag would pull every tag
            repository = &without_digest[..index];
        }
    }

    if image.contains('@') {
        (image.to_string(), String::new())
    } else {
        (repository.to_string(), DEFAULT_TAG.to_string())
    }
}

/// True for build errors caused by a context that lacks the Dockerfile.
pub fn is_missing_dockerfile(error: &ProvisionError) -> bool {
    match error {
        ProvisionError::Engine(e) => e.to_string().contains(MISSING_DOCKERFILE_MESSAGE),
        ProvisionError::BuildFailed(message) => message.contains(MISSING_DOCKERFILE_MESSAGE),
        _ => false,
    }
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// Name the image is available under.
    pub name: String,
    /// Quiet build output; empty when the image was pulled.
    pub build_log: String,
    /// True when the image came from a registry rather than a build.
    pub pulled: bool,
}

/// A local image as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRecord {
    pub id: String,
    pub name: String,
    pub tag: String,
    pub digest: Option<String>,
}

impl From<ImageSummary> for ImageRecord {
    fn from(summary: ImageSummary) -> Self {
        let (name, tag) = summary
            .repo_tags
            .first()
            .map(|reference| parse_image_reference(reference))
            .unwrap_or_default();
        let digest = summary
            .repo_digests
            .first()
            .and_then(|d| d.split_once('@'))
            .map(|(_, digest)| digest.to_string());

        Self {
            id: summary.id,
            name,
            tag,
            digest,
        }
    }
}

/// Ensures images exist on the engine.
#[derive(Clone)]
pub struct ImageResolver {
    engine: Arc<dyn ContainerEngine>,
}

impl ImageResolver {
    /// Creates a resolver on top of `engine`.
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Builds (or pulls) the image described by `spec`.
    ///
    /// # Errors
    ///
    /// Returns the engine error of a failed build, unless the failure was a
    /// missing Dockerfile, in which case the pull result decides.
    pub async fn resolve(&self, spec: &ImageSpec) -> Result<ResolvedImage, ProvisionError> {
        let mut spec = spec.clone();
        spec.normalize();

        let credentials = self.authenticate(&spec).await?;
        let name = spec.image_name();

        if spec.force_pull {
            info!(image = %name, "Pulling image (build skipped)");
            self.pull_named(&name, credentials).await?;
            return Ok(ResolvedImage {
                name,
                build_log: String::new(),
                pulled: true,
            });
        }

        let request = BuildRequest {
            image_name: name.clone(),
            dockerfile: spec.dockerfile.clone(),
            context: spec.build_context(),
            credentials: credentials.clone(),
        };
        info!(image = %name, context = ?request.context, "Building image");

        match self.engine.build_image(request).await {
            Ok(build_log) => Ok(ResolvedImage {
                name,
                build_log,
                pulled: false,
            }),
            Err(e) if is_missing_dockerfile(&e) => {
                warn!(image = %name, "No Dockerfile in build context, pulling instead");
                self.pull_named(&name, credentials).await?;
                Ok(ResolvedImage {
                    name,
                    build_log: String::new(),
                    pulled: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Checks the spec's registry credentials.
    ///
    /// Returns `None` when the spec carries no usable credentials. On success
    /// the returned credentials include the identity token, if one was issued.
    pub async fn authenticate(
        &self,
        spec: &ImageSpec,
    ) -> Result<Option<DockerCredentials>, ProvisionError> {
        let Some(auth) = spec.auth.as_ref().filter(|a| a.has_credentials()) else {
            return Ok(None);
        };

        let mut credentials = auth.to_credentials();
        debug!(registry = ?credentials.serveraddress, "Checking registry credentials");
        credentials.identitytoken = self.engine.check_auth(&credentials).await?;
        Ok(Some(credentials))
    }

    /// Pulls the image named by `spec`.
    pub async fn pull(&self, spec: &ImageSpec) -> Result<(), ProvisionError> {
        let credentials = self.authenticate(spec).await?;
        self.pull_named(&spec.image_name(), credentials).await
    }

    async fn pull_named(
        &self,
        name: &str,
        credentials: Option<DockerCredentials>,
    ) -> Result<(), ProvisionError> {
        let (repository, tag) = parse_image_reference(name);
        debug!(repository = %repository, tag = %tag, "Pulling image");
        self.engine.pull_image(&repository, &tag, credentials).await
    }

    /// Returns the first local image matching `name`.
    ///
    /// # Errors
    ///
    /// Returns `ProvisionError::ImageNotFound` when nothing matches.
    pub async fn find_image(&self, name: &str) -> Result<ImageRecord, ProvisionError> {
        self.engine
            .list_images(name)
            .await?
            .into_iter()
            .next()
            .map(ImageRecord::from)
            .ok_or_else(|| ProvisionError::ImageNotFound(name.to_string()))
    }
}
