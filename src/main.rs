use anyhow::Context;
use clap::{Parser, Subcommand};
use homelab::config::Config;
use homelab::docker::{DockerManager, PullPolicy};
use homelab::images::{ImageVersions, DEFAULT_IMAGE_FILE};
use homelab::provision::Provisioner;
use homelab::services::HomelabServices;
use homelab::spec::ContainerSpec;
use homelab::tunnel::DockerHost;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(
    name = "homelab",
    version,
    about = "Provision homelab containers on a remote Docker host"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Image versions file
    #[arg(long, global = true, default_value = DEFAULT_IMAGE_FILE)]
    images: PathBuf,

    /// Environment file loaded before reading configuration (default: ./.env if present)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Docker host, overriding ssh://$DOCKER_USERNAME@$DOCKER_HOSTNAME
    #[arg(long, global = true, env = "HOMELAB_DOCKER_HOST")]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update every service container
    Up {
        /// When to pull service images
        #[arg(long, value_enum, default_value_t = PullPolicy::IfNotPresent)]
        pull: PullPolicy,
    },
    /// Show what `up` would change
    Preview,
    /// Remove managed containers (all of them when no service is named)
    Destroy {
        services: Vec<String>,
    },
    /// Print the desired container specs as JSON without contacting the host
    Render,
}

/// Work done against the Docker host, as opposed to `render`
#[derive(Debug, PartialEq, Eq)]
enum Operation {
    Apply,
    Preview,
    Destroy(Vec<String>),
}

impl Commands {
    /// The daemon operation and pull policy, or `None` when no host is needed
    fn operation(self) -> Option<(Operation, PullPolicy)> {
        match self {
            Commands::Up { pull } => Some((Operation::Apply, pull)),
            Commands::Preview => Some((Operation::Preview, PullPolicy::IfNotPresent)),
            Commands::Destroy { services } => {
                Some((Operation::Destroy(services), PullPolicy::IfNotPresent))
            }
            Commands::Render => None,
        }
    }
}

#[tokio::main]
async fn main() {
    // The env file is read before parsing so it can supply HOMELAB_DOCKER_HOST
    // and RUST_LOG; its outcome is reported once logging is up.
    let args: Vec<OsString> = std::env::args_os().collect();
    let env_file = load_env_file(env_file_arg(&args).as_deref());

    let cli = Cli::parse_from(args);
    init_logging(cli.verbose);

    let result = match env_file {
        Ok(path) => {
            if let Some(path) = path {
                info!(path = %path.display(), "Loaded env file");
            }
            run(cli).await
        }
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let directive = if verbose { "homelab=debug" } else { "homelab=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let images = ImageVersions::load(&cli.images)?;
    info!(
        version = VERSION,
        images = %cli.images.display(),
        domain = %config.domain_name,
        "Configuration loaded"
    );

    let specs = HomelabServices::from_config(&config, images).all(&config)?;

    let Some((operation, pull)) = cli.command.operation() else {
        return render(&specs);
    };

    let host_str = cli.host.unwrap_or_else(|| config.ssh_connection_string());
    let host = DockerHost::parse(&host_str)?;
    let docker = DockerManager::connect(&host).await?;

    let result = execute(operation, &Provisioner::new(&docker, pull), &specs).await;
    docker.close().await;
    result
}

async fn execute(
    operation: Operation,
    provisioner: &Provisioner<'_>,
    specs: &[ContainerSpec],
) -> anyhow::Result<()> {
    match operation {
        Operation::Apply => {
            let summary = provisioner.apply(specs).await?;
            println!("{}", summary);
        }
        Operation::Preview => {
            let summary = provisioner.preview(specs).await?;
            println!("{}", summary);
        }
        Operation::Destroy(services) => {
            let removed = provisioner.destroy(&services).await?;
            if removed.is_empty() {
                println!("No containers removed");
            } else {
                for name in &removed {
                    println!("  removed  {}", name);
                }
            }
        }
    }
    Ok(())
}

fn render(specs: &[ContainerSpec]) -> anyhow::Result<()> {
    let redacted: Vec<ContainerSpec> = specs.iter().map(ContainerSpec::redacted).collect();
    let json = serde_json::to_string_pretty(&redacted).context("Failed to render specs")?;
    println!("{}", json);
    Ok(())
}

/// Value of `--env-file` in raw arguments, ahead of full parsing
fn env_file_arg(args: &[OsString]) -> Option<PathBuf> {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        let Some(arg) = arg.to_str() else {
            continue;
        };
        if arg == "--" {
            break;
        }
        if arg == "--env-file" {
            return iter.next().map(PathBuf::from);
        }
        if let Some(value) = arg.strip_prefix("--env-file=") {
            return Some(PathBuf::from(value));
        }
    }
    None
}

/// Load variables from an env file; already-exported variables take precedence
///
/// Returns the path loaded, or `None` when no file was named and `./.env`
/// does not exist.
fn load_env_file(path: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    match path {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("Failed to load env file '{}'", path.display()))?;
            Ok(Some(path.to_path_buf()))
        }
        None => match dotenvy::dotenv() {
            Ok(path) => Ok(Some(path)),
            Err(e) if e.not_found() => Ok(None),
            Err(e) => Err(e).context("Failed to load .env"),
        },
    }
}
