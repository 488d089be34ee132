//! CLI command definitions for fnbox.
//!
//! The CLI is the caller of the execution layer: it resolves the image,
//! creates the container, runs it, enforces an optional deadline, and cleans
//! up afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use crate::config::{EngineConfig, FunctionManifest};
use crate::execution::{
    ContainerEngine, ContainerManager, DockerEngine, ExecutionResult, Executor, ImageResolver,
    ImageSpec, RegistryAuth,
};

/// Run functions inside ephemeral containers.
#[derive(Parser)]
#[command(name = "fnbox")]
#[command(about = "Run functions inside ephemeral containers")]
#[command(version)]
#[command(
    long_about = "fnbox builds (or pulls) an image, runs it as a throwaway container with the given input on stdin, and prints what the container wrote.\n\nExample usage:\n  fnbox run --image hello --context ./hello --input world -- python main.py"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Engine address (unix:///path or tcp://host:port). Overrides FNBOX_DOCKER_HOST.
    #[arg(long, global = true)]
    pub docker_host: Option<String>,

    /// Directory holding ca.pem, cert.pem and key.pem for TLS engines.
    #[arg(long, global = true)]
    pub cert_path: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Resolve an image, run it once with input, print its output.
    Run(Box<RunArgs>),

    /// Build (or pull) an image without running it.
    Build(BuildArgs),

    /// List containers created by fnbox.
    #[command(alias = "ls")]
    Ps(PsArgs),

    /// Kill a running container.
    Kill {
        /// Container ID.
        id: String,
    },

    /// Force-remove a container.
    #[command(alias = "remove")]
    Rm {
        /// Container ID.
        id: String,
    },

    /// Show the first local image matching a name.
    FindImage {
        /// Image name or reference filter.
        name: String,
    },

    /// Find a container by ID or by image.
    FindContainer(FindContainerArgs),
}

/// Image source options shared by `run` and `build`.
#[derive(clap::Args, Debug, Default)]
pub struct ImageArgs {
    /// Image name (namespaced as fnbox/<name> unless --no-prefix).
    #[arg(short = 'i', long)]
    pub image: Option<String>,

    /// Local build context directory (default: current directory).
    #[arg(short = 'c', long)]
    pub context: Option<PathBuf>,

    /// Remote build context (git or tarball URL).
    #[arg(long)]
    pub remote: Option<String>,

    /// Dockerfile name within the context.
    #[arg(short = 'f', long)]
    pub dockerfile: Option<String>,

    /// Use the image name exactly as given.
    #[arg(long)]
    pub no_prefix: bool,

    /// Pull the image instead of building it.
    #[arg(long)]
    pub force_pull: bool,

    /// Registry username.
    #[arg(long, env = "FNBOX_REGISTRY_USER")]
    pub registry_user: Option<String>,

    /// Registry password.
    #[arg(long, env = "FNBOX_REGISTRY_PASSWORD", hide_env_values = true)]
    pub registry_password: Option<String>,

    /// Registry server address (default: the public registry).
    #[arg(long, env = "FNBOX_REGISTRY_SERVER")]
    pub registry_server: Option<String>,
}

impl ImageArgs {
    /// Overlays the flags that were given onto `spec`.
    pub fn apply(&self, spec: &mut ImageSpec) {
        if let Some(image) = &self.image {
            spec.image_name = image.clone();
        }
        if let Some(context) = &self.context {
            spec.context_dir = Some(context.clone());
        }
        if let Some(remote) = &self.remote {
            spec.remote_uri = Some(remote.clone());
        }
        if let Some(dockerfile) = &self.dockerfile {
            spec.dockerfile = dockerfile.clone();
        }
        spec.no_prefix |= self.no_prefix;
        spec.force_pull |= self.force_pull;

        if self.registry_user.is_some() || self.registry_password.is_some() {
            let auth = spec.auth.get_or_insert_with(RegistryAuth::default);
            if let Some(user) = &self.registry_user {
                auth.username = Some(user.clone());
            }
            if let Some(password) = &self.registry_password {
                auth.password = Some(password.clone());
            }
        }
        if let (Some(server), Some(auth)) = (&self.registry_server, spec.auth.as_mut()) {
            auth.server_address = Some(server.clone());
        }
    }
}

/// Arguments for `fnbox run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Function manifest (YAML); flags override its values.
    #[arg(short = 'm', long)]
    pub manifest: Option<PathBuf>,

    #[command(flatten)]
    pub image: ImageArgs,

    /// Environment variable for the container (KEY=value), repeatable.
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,

    /// Bind mount (host:container[:mode]), repeatable.
    #[arg(short = 'v', long = "volume")]
    pub volumes: Vec<String>,

    /// OCI runtime for the container.
    #[arg(long)]
    pub runtime: Option<String>,

    /// Input written to the container's stdin.
    #[arg(long, conflicts_with = "input_file")]
    pub input: Option<String>,

    /// File whose content is written to stdin ("-" reads this process's stdin).
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// Kill the container if it runs longer than this many seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Keep the container after it exits.
    #[arg(long)]
    pub keep: bool,

    /// Command to run instead of the image default (after --).
    #[arg(last = true)]
    pub cmd: Vec<String>,
}

/// Arguments for `fnbox build`.
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Function manifest (YAML); flags override its values.
    #[arg(short = 'm', long)]
    pub manifest: Option<PathBuf>,

    #[command(flatten)]
    pub image: ImageArgs,
}

/// Arguments for `fnbox ps`.
#[derive(Parser, Debug)]
pub struct PsArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `fnbox find-container`.
#[derive(Parser, Debug)]
pub struct FindContainerArgs {
    /// Container ID.
    #[arg(long, conflicts_with = "image", required_unless_present = "image")]
    pub id: Option<String>,

    /// Image the container was created from.
    #[arg(long)]
    pub image: Option<String>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let engine = connect(&cli)?;

    match cli.command {
        Commands::Run(args) => run_function_command(engine, *args).await,
        Commands::Build(args) => run_build_command(engine, args).await,
        Commands::Ps(args) => run_ps_command(engine, args).await,
        Commands::Kill { id } => {
            ContainerManager::new(engine).kill_container(&id).await?;
            println!("{id}");
            Ok(())
        }
        Commands::Rm { id } => {
            ContainerManager::new(engine).remove_container(&id).await?;
            println!("{id}");
            Ok(())
        }
        Commands::FindImage { name } => {
            let record = ImageResolver::new(engine).find_image(&name).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Commands::FindContainer(args) => run_find_container_command(engine, args).await,
    }
}

fn connect(cli: &Cli) -> anyhow::Result<Arc<dyn ContainerEngine>> {
    let mut config = EngineConfig::from_env().context("Invalid engine configuration")?;
    if let Some(host) = &cli.docker_host {
        config.host = Some(host.clone());
    }
    if let Some(cert_path) = &cli.cert_path {
        config.cert_path = Some(cert_path.clone());
    }
    config.validate()?;

    let engine = DockerEngine::connect(&config.endpoint()?, config.timeout_secs)
        .context("Failed to connect to the container engine")?;
    Ok(Arc::new(engine))
}

fn load_manifest(path: Option<&Path>) -> anyhow::Result<FunctionManifest> {
    match path {
        Some(path) => FunctionManifest::from_file(path)
            .with_context(|| format!("Failed to load manifest {}", path.display())),
        None => Ok(FunctionManifest::default()),
    }
}

async fn read_input(args: &RunArgs, manifest: &FunctionManifest) -> anyhow::Result<Vec<u8>> {
    if let Some(input) = &args.input {
        return Ok(input.clone().into_bytes());
    }
    match &args.input_file {
        Some(path) if path.as_os_str() == "-" => {
            let mut buffer = Vec::new();
            tokio::io::stdin().read_to_end(&mut buffer).await?;
            Ok(buffer)
        }
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read input file {}", path.display())),
        None => Ok(manifest.input.clone().unwrap_or_default().into_bytes()),
    }
}

async fn print_output(result: &ExecutionResult) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&result.stdout).await?;
    stdout.flush().await?;
    let mut stderr = tokio::io::stderr();
    stderr.write_all(&result.stderr).await?;
    stderr.flush().await?;
    Ok(())
}

async fn run_function_command(
    engine: Arc<dyn ContainerEngine>,
    args: RunArgs,
) -> anyhow::Result<()> {
    let mut manifest = load_manifest(args.manifest.as_deref())?;
    args.image.apply(&mut manifest.image);
    if manifest.image.image_name.trim().is_empty() {
        bail!("No image given: pass --image or a manifest with image.image_name");
    }

    let mut spec = manifest.container.clone();
    if !args.cmd.is_empty() {
        spec.cmd = args.cmd.clone();
    }
    spec.env.extend(args.env.iter().cloned());
    spec.volumes.extend(args.volumes.iter().cloned());
    if let Some(runtime) = &args.runtime {
        spec.runtime = Some(runtime.clone());
    }
    let input = read_input(&args, &manifest).await?;

    let resolved = ImageResolver::new(engine.clone())
        .resolve(&manifest.image)
        .await
        .context("Failed to resolve image")?;
    spec.image = resolved.name.clone();

    let manager = ContainerManager::new(engine.clone());
    let executor = Executor::new(engine.clone());
    let container = manager.create_container(&spec).await?;

    let result = match args.timeout {
        None => executor.run(&container.id, &input).await,
        Some(secs) => {
            match tokio::time::timeout(Duration::from_secs(secs), executor.run(&container.id, &input))
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    warn!(container = %container.id, timeout_secs = secs, "Deadline reached, killing container");
                    if let Err(e) = manager.kill_container(&container.id).await {
                        warn!(container = %container.id, error = %e, "Kill after deadline failed");
                    }
                    let mut stdout = Vec::new();
                    let mut stderr = Vec::new();
                    let _ = executor.logs(&container.id, &mut stdout, &mut stderr).await;
                    print_output(&ExecutionResult {
                        stdout,
                        stderr,
                        outcome: Ok(()),
                    })
                    .await?;
                    cleanup(&manager, &container.id, args.keep).await;
                    bail!("Container {} timed out after {secs}s", container.id);
                }
            }
        }
    };

    let result = match result {
        Ok(result) => result,
        Err(e) => {
            cleanup(&manager, &container.id, args.keep).await;
            return Err(e).context("Failed to run container");
        }
    };

    print_output(&result).await?;
    cleanup(&manager, &container.id, args.keep).await;

    result
        .outcome
        .with_context(|| format!("Function in container {} failed", container.id))
}

async fn cleanup(manager: &ContainerManager, id: &str, keep: bool) {
    if keep {
        info!(container = %id, "Keeping container");
        return;
    }
    if let Err(e) = manager.remove_container(id).await {
        warn!(container = %id, error = %e, "Failed to remove container");
    }
}

async fn run_build_command(engine: Arc<dyn ContainerEngine>, args: BuildArgs) -> anyhow::Result<()> {
    let mut manifest = load_manifest(args.manifest.as_deref())?;
    args.image.apply(&mut manifest.image);
    if manifest.image.image_name.trim().is_empty() {
        bail!("No image given: pass --image or a manifest with image.image_name");
    }

    let resolved = ImageResolver::new(engine)
        .resolve(&manifest.image)
        .await
        .context("Failed to resolve image")?;

    if !resolved.build_log.is_empty() {
        eprint!("{}", resolved.build_log);
    }
    println!("{}", resolved.name);
    Ok(())
}

async fn run_ps_command(engine: Arc<dyn ContainerEngine>, args: PsArgs) -> anyhow::Result<()> {
    let containers = ContainerManager::new(engine).list_containers().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&containers)?);
        return Ok(());
    }

    println!("{:<14} {:<44} {:<28} {}", "CONTAINER ID", "NAME", "IMAGE", "STATE");
    for container in containers {
        let short_id: String = container.id.chars().take(12).collect();
        println!(
            "{:<14} {:<44} {:<28} {}",
            short_id, container.name, container.image, container.state
        );
    }
    Ok(())
}

async fn run_find_container_command(
    engine: Arc<dyn ContainerEngine>,
    args: FindContainerArgs,
) -> anyhow::Result<()> {
    let manager = ContainerManager::new(engine);
    let container = match (&args.id, &args.image) {
        (Some(id), _) => manager.find_container_by_id(id).await?,
        (None, Some(image)) => manager.find_container_by_image(image).await?,
        (None, None) => bail!("Pass --id or --image"),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&container)?);
    } else {
        println!("{} {} {} {}", container.id, container.name, container.image, container.state);
    }
    Ok(())
}
