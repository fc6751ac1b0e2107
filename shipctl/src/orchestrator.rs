use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use gitops::{GitCredentials, Workspace, WorkspaceOptions};
use ociclient::{
    Credentials, OciDigest, PushOptions, PushOutcome, RegistryClient, RepositoryCoordinate,
    TransportOptions,
};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::error::{DeployError, Result};
use crate::lock::ServiceLocks;
use crate::sink::{LogLevel, LogSink, NotificationKind, Notifier};
use crate::store::ConfigStore;

/// Where a deployment is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Init,
    PushingImage,
    CloningRepo,
    LocatingManifest,
    PatchingTag,
    CommittingAndPushing,
    Succeeded,
    Failed,
}

impl Stage {
    /// Stages that run after the image is already in the registry.
    fn follows_publish(self) -> bool {
        matches!(
            self,
            Stage::CloningRepo
                | Stage::LocatingManifest
                | Stage::PatchingTag
                | Stage::CommittingAndPushing
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::PushingImage => "pushing image",
            Stage::CloningRepo => "cloning repository",
            Stage::LocatingManifest => "locating manifest",
            Stage::PatchingTag => "patching tag",
            Stage::CommittingAndPushing => "committing and pushing",
            Stage::Succeeded => "succeeded",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything one deployment needs; nothing is read from global state.
#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    pub service_name: String,
    pub tag: String,
    pub coordinate: RepositoryCoordinate,
    pub archive_path: PathBuf,
    /// File or directory inside the manifest repository, relative to its root
    pub manifest_path_hint: Option<PathBuf>,
    pub git_remote: String,
    pub git_credentials: Option<GitCredentials>,
    pub registry_credentials: Option<Credentials>,
}

#[derive(Debug)]
pub enum DeploymentOutcome {
    Succeeded {
        tag: String,
        manifest_digest: OciDigest,
        manifest_path: PathBuf,
        /// `None` when the manifest already carried the tag
        commit: Option<String>,
    },
    Failed {
        stage: Stage,
        error: DeployError,
    },
}

impl DeploymentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeploymentOutcome::Succeeded { .. })
    }

    /// The deployed tag; failed deployments report none.
    pub fn tag(&self) -> Option<&str> {
        match self {
            DeploymentOutcome::Succeeded { tag, .. } => Some(tag),
            DeploymentOutcome::Failed { .. } => None,
        }
    }

    pub fn into_result(self) -> Result<Self> {
        match self {
            DeploymentOutcome::Failed { error, .. } => Err(error),
            succeeded => Ok(succeeded),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub transport: TransportOptions,
    pub push: PushOptions,
    pub workspace: WorkspaceOptions,
    pub author_name: String,
    pub pipeline_timeout: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            transport: TransportOptions::default(),
            push: PushOptions::default(),
            workspace: WorkspaceOptions::default(),
            author_name: "shipctl".to_string(),
            pipeline_timeout: Duration::from_secs(1800),
        }
    }
}

/// Runs deployments: push the image, then bump its tag in the manifest repository.
pub struct Orchestrator {
    options: OrchestratorOptions,
    sink: Arc<dyn LogSink>,
    notifier: Option<Arc<dyn Notifier>>,
    store: Option<Arc<dyn ConfigStore>>,
    locks: ServiceLocks,
}

impl Orchestrator {
    pub fn new(options: OrchestratorOptions, sink: Arc<dyn LogSink>) -> Self {
        Self {
            options,
            sink,
            notifier: None,
            store: None,
            locks: ServiceLocks::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Record the tag of every successful deployment in `store`.
    pub fn with_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run one deployment to completion.
    ///
    /// Deployments of the same service queue behind each other. The outcome
    /// is also reported to the sink and, if set, the notifier.
    ///
    /// When the pipeline timeout passes during the git stages, the git work
    /// stops before the next stage; a commit and push already under way runs
    /// to completion and its result is reported.
    #[instrument(skip_all, fields(service = %request.service_name, tag = %request.tag))]
    pub async fn run(&self, request: DeploymentRequest) -> DeploymentOutcome {
        let guard = Arc::new(self.locks.acquire(&request.service_name).await);
        let progress = Arc::new(Progress::new(
            Arc::clone(&self.sink),
            request.service_name.clone(),
        ));
        progress.enter(Stage::Init);

        let deadline = Instant::now() + self.options.pipeline_timeout;
        let result = self
            .pipeline(&request, Arc::clone(&progress), Arc::clone(&guard), deadline)
            .await;

        let outcome = match result {
            Ok(deployed) => DeploymentOutcome::Succeeded {
                tag: request.tag.clone(),
                manifest_digest: deployed.manifest_digest,
                manifest_path: deployed.manifest_path,
                commit: deployed.commit,
            },
            Err(error) => DeploymentOutcome::Failed {
                stage: progress.current(),
                error,
            },
        };

        self.report(&request, &progress, &outcome);
        drop(guard);
        outcome
    }

    async fn pipeline(
        &self,
        request: &DeploymentRequest,
        progress: Arc<Progress>,
        guard: Arc<OwnedMutexGuard<()>>,
        deadline: Instant,
    ) -> Result<Deployed> {
        ociclient::validate_tag(&request.tag).map_err(ociclient::Error::from)?;

        progress.enter(Stage::PushingImage);
        let pushed = match tokio::time::timeout_at(deadline, self.push_image(request)).await {
            Ok(pushed) => pushed?,
            Err(_) => return Err(self.timeout_error(request)),
        };
        progress.mark_published();
        progress.emit(
            LogLevel::Info,
            &format!(
                "Pushed {}:{} as {} ({} layers, {} blobs already present)",
                request.coordinate,
                request.tag,
                pushed.manifest_digest,
                pushed.layers.len(),
                pushed.skipped_blobs()
            ),
        );

        let job = ManifestJob {
            remote: request.git_remote.clone(),
            credentials: request.git_credentials.clone(),
            workspace: self.options.workspace.clone(),
            hint: request.manifest_path_hint.clone(),
            identifier: request.coordinate.service_identifier().to_string(),
            service: request.service_name.clone(),
            tag: request.tag.clone(),
            author_name: self.options.author_name.clone(),
            timeout: self.options.pipeline_timeout,
        };

        // The job keeps the service lock until it returns.
        let job_progress = Arc::clone(&progress);
        let mut handle = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            job.run(&job_progress)
        });
        let joined = match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                progress.cancel();
                progress.emit(
                    LogLevel::Warn,
                    &format!(
                        "Timed out after {}s while {}; waiting for the git work to stop",
                        self.options.pipeline_timeout.as_secs(),
                        progress.current()
                    ),
                );
                handle.await
            }
        };
        let (manifest_path, commit) = joined??;

        Ok(Deployed {
            manifest_digest: pushed.manifest_digest,
            manifest_path,
            commit,
        })
    }

    async fn push_image(&self, request: &DeploymentRequest) -> Result<PushOutcome> {
        let client = RegistryClient::connect(
            &request.coordinate.registry_host,
            request.registry_credentials.as_ref(),
            &self.options.transport,
            self.options.push.clone(),
        )
        .await?;
        Ok(client
            .push_image(&request.archive_path, &request.coordinate.repository, &request.tag)
            .await?)
    }

    fn timeout_error(&self, request: &DeploymentRequest) -> DeployError {
        DeployError::Timeout {
            service: request.service_name.clone(),
            timeout: self.options.pipeline_timeout,
        }
    }

    fn report(&self, request: &DeploymentRequest, progress: &Progress, outcome: &DeploymentOutcome) {
        let service = request.service_name.as_str();
        match outcome {
            DeploymentOutcome::Succeeded {
                tag,
                manifest_path,
                commit,
                ..
            } => {
                let message = match commit {
                    Some(commit) => format!(
                        "Deployed {}:{} ({} at commit {})",
                        service,
                        tag,
                        manifest_path.display(),
                        commit
                    ),
                    None => format!(
                        "Deployed {}:{} ({} already up to date)",
                        service,
                        tag,
                        manifest_path.display()
                    ),
                };
                progress.emit(LogLevel::Info, &message);
                self.sink.stage(service, Stage::Succeeded);
                info!(%tag, ?commit, "Deployment succeeded");

                if let Some(store) = &self.store {
                    if let Err(e) = store.record_tag(service, tag) {
                        warn!(error = %e, "Failed to record deployed tag");
                    }
                }
                if let Some(notifier) = &self.notifier {
                    notifier.show(NotificationKind::Success, &format!("{} deployed", service), &message);
                }
            }
            DeploymentOutcome::Failed { stage, error } => {
                let mut message = format!(
                    "Deployment failed while {} [{}]: {}",
                    stage,
                    error.kind(),
                    error.chain()
                );
                if progress.published() && stage.follows_publish() {
                    message.push_str(&format!(
                        "; image {}:{} is published but the manifest repository still points at the previous tag",
                        request.coordinate, request.tag
                    ));
                }
                progress.emit(LogLevel::Error, &message);
                self.sink.stage(service, Stage::Failed);
                warn!(%stage, kind = error.kind(), "Deployment failed");

                if let Some(notifier) = &self.notifier {
                    notifier.show(NotificationKind::Failure, &format!("{} failed", service), &message);
                }
            }
        }
    }
}

struct Deployed {
    manifest_digest: OciDigest,
    manifest_path: PathBuf,
    commit: Option<String>,
}

/// The git half of a deployment, run on a blocking thread.
struct ManifestJob {
    remote: String,
    credentials: Option<GitCredentials>,
    workspace: WorkspaceOptions,
    hint: Option<PathBuf>,
    identifier: String,
    service: String,
    tag: String,
    author_name: String,
    timeout: Duration,
}

impl ManifestJob {
    fn run(&self, progress: &Progress) -> Result<(PathBuf, Option<String>)> {
        self.enter(progress, Stage::CloningRepo)?;
        let workspace = match Workspace::open_cancellable(
            &self.remote,
            self.credentials.as_ref(),
            &self.workspace,
            progress.cancel_flag(),
        ) {
            Ok(workspace) => workspace,
            Err(_) if progress.cancelled() => return Err(self.timeout_error()),
            Err(e) => return Err(e.into()),
        };

        let result = self.update(&workspace, progress);
        if let Err(e) = workspace.close() {
            progress.emit(LogLevel::Warn, &format!("Failed to remove git workspace: {}", e));
        }
        result
    }

    fn update(&self, workspace: &Workspace, progress: &Progress) -> Result<(PathBuf, Option<String>)> {
        self.enter(progress, Stage::LocatingManifest)?;
        let target = gitops::locate(workspace.root(), self.hint.as_deref(), &self.identifier)?;
        if target.is_ambiguous() {
            progress.emit(
                LogLevel::Warn,
                &format!(
                    "{} also mention {}; using {}",
                    display_paths(&target.alternatives),
                    self.identifier,
                    target.path.display()
                ),
            );
        }

        self.enter(progress, Stage::PatchingTag)?;
        let patched = gitops::patch_file(&workspace.root().join(&target.path), &self.identifier, &self.tag)?;
        if patched.matched > 1 {
            progress.emit(
                LogLevel::Warn,
                &format!("Patched {} image lines in {}", patched.matched, target.path.display()),
            );
        }
        if !patched.changed {
            progress.emit(
                LogLevel::Warn,
                &format!("{} already uses tag {}; nothing to commit", target.path.display(), self.tag),
            );
            return Ok((target.path, None));
        }

        self.enter(progress, Stage::CommittingAndPushing)?;
        let message = format!("Deploy {} {}", self.service, self.tag);
        let commit = workspace.commit_and_push(&target.path, &message, &self.author_name)?;
        Ok((target.path, Some(commit.to_string())))
    }

    /// Move to `stage` unless the run has been cancelled.
    fn enter(&self, progress: &Progress, stage: Stage) -> Result<()> {
        if progress.cancelled() {
            return Err(self.timeout_error());
        }
        progress.enter(stage);
        Ok(())
    }

    fn timeout_error(&self) -> DeployError {
        DeployError::Timeout {
            service: self.service.clone(),
            timeout: self.timeout,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Stage tracking and sink forwarding for one deployment.
struct Progress {
    sink: Arc<dyn LogSink>,
    service: String,
    stage: Mutex<Stage>,
    published: AtomicBool,
    cancelled: AtomicBool,
}

impl Progress {
    fn new(sink: Arc<dyn LogSink>, service: String) -> Self {
        Self {
            sink,
            service,
            stage: Mutex::new(Stage::Init),
            published: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    fn enter(&self, stage: Stage) {
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner) = stage;
        self.sink.stage(&self.service, stage);
    }

    fn current(&self) -> Stage {
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, level: LogLevel, message: &str) {
        self.sink.emit(&self.service, message, level);
    }

    fn mark_published(&self) {
        self.published.store(true, Ordering::SeqCst);
    }

    fn published(&self) -> bool {
        self.published.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn cancel_flag(&self) -> &AtomicBool {
        &self.cancelled
    }
}
