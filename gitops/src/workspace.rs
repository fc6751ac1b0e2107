use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use git2::build::RepoBuilder;
use git2::{Cred, CredentialType, FetchOptions, Oid, PushOptions, RemoteCallbacks, Repository, Signature};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const ORIGIN: &str = "origin";

/// Username/password pair for the manifest repository remote.
#[derive(Clone)]
pub struct GitCredentials {
    pub username: String,
    pub password: String,
}

impl GitCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for GitCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How a workspace is cloned and how its commits are signed.
#[derive(Debug, Clone)]
pub struct WorkspaceOptions {
    /// The only branch fetched, committed to and pushed
    pub branch: String,
    /// History depth of the clone, `0` for the full history
    pub depth: i32,
    pub author_email: String,
}

impl Default for WorkspaceOptions {
    fn default() -> Self {
        Self {
            branch: "main".to_string(),
            depth: 1,
            author_email: "deploy@localhost".to_string(),
        }
    }
}

/// A throwaway clone of the manifest repository.
///
/// The checkout lives in a fresh temporary directory that is removed by
/// [`Workspace::close`] or, failing that, when the workspace is dropped.
pub struct Workspace {
    repo: Repository,
    dir: TempDir,
    remote_url: String,
    credentials: Option<GitCredentials>,
    options: WorkspaceOptions,
}

impl Workspace {
    /// Clone `options.branch` of `remote_url` into a new temporary directory.
    ///
    /// libgit2 cannot fetch shallowly from local paths or `file://` URLs, so
    /// those are always cloned with their full history.
    pub fn open(
        remote_url: &str,
        credentials: Option<&GitCredentials>,
        options: &WorkspaceOptions,
    ) -> Result<Self> {
        Self::open_cancellable(remote_url, credentials, options, &AtomicBool::new(false))
    }

    /// Like [`Workspace::open`], but the transfer is aborted once `cancel` is set.
    pub fn open_cancellable(
        remote_url: &str,
        credentials: Option<&GitCredentials>,
        options: &WorkspaceOptions,
        cancel: &AtomicBool,
    ) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("gitops-").tempdir()?;
        let clone_error = |source| Error::GitClone {
            url: redact_url(remote_url),
            source,
        };

        info!(
            remote = %redact_url(remote_url),
            branch = %options.branch,
            depth = options.depth,
            dir = %dir.path().display(),
            "Cloning manifest repository"
        );

        let mut callbacks = remote_callbacks(credentials);
        callbacks.transfer_progress(move |_| !cancel.load(Ordering::SeqCst));

        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(callbacks);
        if options.depth > 0 {
            if is_local(remote_url) {
                debug!(depth = options.depth, "Local remote, fetching full history");
            } else {
                fetch.depth(options.depth);
            }
        }

        let branch = options.branch.clone();
        let mut builder = RepoBuilder::new();
        builder
            .branch(&options.branch)
            .fetch_options(fetch)
            .remote_create(move |repo, name, url| {
                let refspec = format!("+refs/heads/{0}:refs/remotes/{1}/{0}", branch, name);
                repo.remote_with_fetch(name, url, &refspec)
            });

        let repo = builder.clone(remote_url, dir.path()).map_err(|source| {
            if cancel.load(Ordering::SeqCst) {
                warn!(remote = %redact_url(remote_url), "Clone cancelled");
            }
            clone_error(source)
        })?;
        debug!(head = ?repo.head().ok().and_then(|h| h.target()), "Clone complete");

        Ok(Self {
            repo,
            dir,
            remote_url: remote_url.to_string(),
            credentials: credentials.cloned(),
            options: options.clone(),
        })
    }

    /// Root of the working tree.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn branch(&self) -> &str {
        &self.options.branch
    }

    /// Stage `relative_path`, commit it on the branch and push to origin.
    ///
    /// Only that one file is staged. A rejected push leaves the local commit
    /// in place and returns [`Error::GitPush`]; nothing is merged or rebased.
    pub fn commit_and_push(
        &self,
        relative_path: &Path,
        message: &str,
        author_name: &str,
    ) -> Result<Oid> {
        let oid = self
            .commit(relative_path, message, author_name)
            .map_err(|source| Error::GitCommit {
                path: relative_path.to_path_buf(),
                source,
            })?;
        info!(commit = %oid, path = %relative_path.display(), "Committed manifest change");

        self.push()?;
        info!(commit = %oid, branch = %self.options.branch, "Pushed manifest change");
        Ok(oid)
    }

    fn commit(
        &self,
        relative_path: &Path,
        message: &str,
        author_name: &str,
    ) -> std::result::Result<Oid, git2::Error> {
        let mut index = self.repo.index()?;
        index.add_path(relative_path)?;
        index.write()?;

        let tree = self.repo.find_tree(index.write_tree()?)?;
        let parent = self.repo.head()?.peel_to_commit()?;
        let signature = Signature::now(author_name, &self.options.author_email)?;

        self.repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &[&parent])
    }

    fn push(&self) -> Result<()> {
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", self.options.branch);
        let push_error = |reason: String| Error::GitPush {
            url: redact_url(&self.remote_url),
            refspec: refspec.clone(),
            reason,
        };

        let mut remote = self
            .repo
            .find_remote(ORIGIN)
            .map_err(|e| push_error(e.message().to_string()))?;

        let mut rejected = None;
        {
            let mut callbacks = remote_callbacks(self.credentials.as_ref());
            callbacks.push_update_reference(|refname, status| {
                if let Some(status) = status {
                    rejected = Some(format!("{} rejected by remote: {}", refname, status));
                }
                Ok(())
            });

            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);
            remote
                .push(&[refspec.as_str()], Some(&mut options))
                .map_err(|e| push_error(e.message().to_string()))?;
        }

        match rejected {
            Some(reason) => Err(push_error(reason)),
            None => Ok(()),
        }
    }

    /// Delete the checkout.
    pub fn close(self) -> Result<()> {
        let path: PathBuf = self.dir.path().to_path_buf();
        drop(self.repo);
        self.dir.close()?;
        debug!(dir = %path.display(), "Removed git workspace");
        Ok(())
    }
}

/// Callbacks that offer the configured credentials exactly once.
fn remote_callbacks<'a>(credentials: Option<&GitCredentials>) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(credentials) = credentials.cloned() {
        let mut offered = false;
        callbacks.credentials(move |url, _username, allowed| {
            if offered {
                warn!(remote = %redact_url(url), "Remote rejected git credentials");
                return Err(git2::Error::from_str("authentication failed"));
            }
            offered = true;
            if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
                Cred::userpass_plaintext(&credentials.username, &credentials.password)
            } else {
                Err(git2::Error::from_str(
                    "remote does not accept username/password authentication",
                ))
            }
        });
    }
    callbacks
}

/// Plain paths and `file://` URLs go through libgit2's local transport.
fn is_local(url: &str) -> bool {
    match url.split_once("://") {
        Some((scheme, _)) => scheme.eq_ignore_ascii_case("file"),
        None => Path::new(url).exists() || !url.contains(':'),
    }
}

/// Strip any `user:password@` part from a remote URL before it is logged.
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://{}", scheme, &rest[at + 1..]),
        None => url.to_string(),
    }
}
