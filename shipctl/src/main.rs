use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use ociclient::{Credentials, RegistryClient, RepositoryCoordinate};
use shipctl::{
    AppConfig, ConfigStore, DeployError, DeploymentOutcome, DeploymentRequest, FileConfigStore,
    LogNotifier, Orchestrator, OrchestratorOptions, State, TracingSink,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Push saved container images and bump their tag in a GitOps repository
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Additional configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// State file holding credentials and last deployed tags
    #[arg(long, global = true, env = "SHIPCTL_STATE_FILE")]
    state_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Push an image and update its manifest in the GitOps repository
    Deploy(DeployArgs),

    /// Push an image to the registry only
    Push(ImageArgs),

    /// Rewrite the image tag in a local checkout, without git
    Patch {
        /// Root of the checkout
        #[arg(long, default_value = ".")]
        dir: PathBuf,

        /// Image name to look for, the last segment of the repository
        #[arg(short, long)]
        identifier: String,

        #[arg(short, long)]
        tag: String,

        /// Manifest file or directory, relative to the checkout
        #[arg(short = 'm', long)]
        manifest_path: Option<PathBuf>,
    },

    /// Show the last tag deployed for a service
    LastTag {
        service: String,
    },
}

#[derive(Args, Debug)]
struct ImageArgs {
    /// Archive written by `docker save`
    #[arg(short, long)]
    archive: PathBuf,

    #[arg(short, long)]
    tag: String,

    /// `host/path` of the target repository, defaults to registry.host
    #[arg(short, long)]
    repository: Option<String>,
}

#[derive(Args, Debug)]
struct DeployArgs {
    #[command(flatten)]
    image: ImageArgs,

    /// Service name used for logging and locking, defaults to the image name
    #[arg(short, long)]
    service: Option<String>,

    /// Manifest repository URL, defaults to git.remote_url
    #[arg(long)]
    git_remote: Option<String>,

    /// Manifest file or directory inside the repository
    #[arg(short = 'm', long)]
    manifest_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        "shipctl=debug,ociclient=debug,gitops=debug,info"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(true)
        .init();

    let config = AppConfig::load(cli.config.as_deref())?;
    debug!(
        registry = ?config.registry.host,
        remote = ?config.git.remote_url,
        branch = %config.git.branch,
        "Loaded configuration"
    );

    let store = match cli.state_file {
        Some(path) => FileConfigStore::new(path),
        None => FileConfigStore::default_location()?,
    };

    match cli.command {
        Commands::Deploy(args) => deploy(&config, store, args).await,
        Commands::Push(args) => push(&config, &store, args).await,
        Commands::Patch {
            dir,
            identifier,
            tag,
            manifest_path,
        } => patch(dir, &identifier, &tag, manifest_path),
        Commands::LastTag { service } => {
            match store.last_tag(&service)? {
                Some(tag) => println!("{}", tag),
                None => println!("{} has not been deployed yet", service),
            }
            Ok(())
        }
    }
}

async fn deploy(config: &AppConfig, store: FileConfigStore, args: DeployArgs) -> Result<()> {
    let state = store.load()?;
    let coordinate = coordinate(config, args.image.repository.as_deref())?;
    let git_remote = args
        .git_remote
        .or_else(|| config.git.remote_url.clone())
        .ok_or_else(|| DeployError::Config("no manifest repository; pass --git-remote or set git.remote_url".into()))?;

    let request = DeploymentRequest {
        service_name: args
            .service
            .unwrap_or_else(|| coordinate.service_identifier().to_string()),
        tag: args.image.tag,
        archive_path: args.image.archive,
        manifest_path_hint: args.manifest_path,
        git_remote,
        git_credentials: git_credentials(config, &state),
        registry_credentials: registry_credentials(config, &state),
        coordinate,
    };

    let options = OrchestratorOptions {
        transport: config.transport_options(),
        push: config.push_options(),
        workspace: config.workspace_options(),
        author_name: config.git.author_name.clone(),
        pipeline_timeout: config.pipeline_timeout(),
    };
    let orchestrator = Orchestrator::new(options, Arc::new(TracingSink))
        .with_notifier(Arc::new(LogNotifier))
        .with_store(Arc::new(store));

    if let DeploymentOutcome::Succeeded {
        tag,
        manifest_digest,
        manifest_path,
        commit,
    } = orchestrator.run(request).await.into_result()?
    {
        println!("tag:      {}", tag);
        println!("digest:   {}", manifest_digest);
        println!("manifest: {}", manifest_path.display());
        println!("commit:   {}", commit.as_deref().unwrap_or("(unchanged)"));
    }
    Ok(())
}

async fn push(config: &AppConfig, store: &FileConfigStore, args: ImageArgs) -> Result<()> {
    let state = store.load()?;
    let coordinate = coordinate(config, args.repository.as_deref())?;
    ociclient::validate_tag(&args.tag)
        .map_err(ociclient::Error::from)
        .map_err(DeployError::from)?;

    let credentials = registry_credentials(config, &state);
    let client = RegistryClient::connect(
        &coordinate.registry_host,
        credentials.as_ref(),
        &config.transport_options(),
        config.push_options(),
    )
    .await
    .map_err(DeployError::from)?;

    let outcome = client
        .push_image(&args.archive, &coordinate.repository, &args.tag)
        .await
        .map_err(DeployError::from)?;

    println!("{}:{}@{}", coordinate, args.tag, outcome.manifest_digest);
    Ok(())
}

fn patch(dir: PathBuf, identifier: &str, tag: &str, hint: Option<PathBuf>) -> Result<()> {
    ociclient::validate_tag(tag)
        .map_err(ociclient::Error::from)
        .map_err(DeployError::from)?;

    let target = gitops::locate(&dir, hint.as_deref(), identifier).map_err(DeployError::from)?;
    let outcome = gitops::patch_file(&dir.join(&target.path), identifier, tag).map_err(DeployError::from)?;

    println!(
        "{}: {} image line(s), {}",
        target.path.display(),
        outcome.matched,
        if outcome.changed { "updated" } else { "already up to date" }
    );
    Ok(())
}

fn coordinate(config: &AppConfig, repository: Option<&str>) -> Result<RepositoryCoordinate, DeployError> {
    let repository = repository
        .or(config.registry.host.as_deref())
        .ok_or_else(|| DeployError::Config("no repository; pass --repository or set registry.host".into()))?;
    Ok(repository.parse().map_err(ociclient::Error::from)?)
}

/// Configured credentials win over the ones in the state file.
fn registry_credentials(config: &AppConfig, state: &State) -> Option<Credentials> {
    match (&config.registry.username, &config.registry.password) {
        (Some(username), Some(password)) => Some(Credentials::new(username, password)),
        _ => state.registry.clone().map(Into::into),
    }
}

fn git_credentials(config: &AppConfig, state: &State) -> Option<gitops::GitCredentials> {
    match (&config.git.username, &config.git.password) {
        (Some(username), Some(password)) => Some(gitops::GitCredentials::new(username, password)),
        _ => state.git.clone().map(Into::into),
    }
}
