//! Git HEAD resolution for image versioning, via the git CLI.
//!
//! A deploy names a branch, and the commit that gets deployed is that
//! branch's HEAD on the remotes, not whatever happens to be checked out.
//! Remotes that disagree about the branch are a hard stop rather than a
//! guess.

#![forbid(unsafe_code)]

use std::path::Path;

use skiff_core::Printer;
use thiserror::Error;
use tracing::debug;

/// Commit ids are abbreviated to this many hex digits everywhere.
pub const SHORT_ID_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git is not installed or not on PATH")]
    NotInstalled,
    #[error("git {args:?} failed: {stderr}")]
    CommandFailed { args: Vec<String>, stderr: String },
    #[error("no branch given and current status is inconclusive: {0}")]
    Inconclusive(String),
    #[error("no remote tracking branch matching {0:?} found")]
    NoRemoteBranch(String),
    #[error("remote tracking branches for {0:?} disagree on the commit id")]
    AmbiguousRemotes(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

async fn run_git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    debug!(?args, dir = %dir.display(), "git call");
    let out = tokio::process::Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => GitError::NotInstalled,
            _ => GitError::Io(e),
        })?;
    if !out.status.success() {
        return Err(GitError::CommandFailed {
            args: args.iter().map(|s| s.to_string()).collect(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

async fn short_id(dir: &Path, rev: &str) -> Result<String, GitError> {
    run_git(dir, &["rev-parse", &format!("--short={SHORT_ID_LEN}"), rev]).await
}

/// Branch the working copy is on. A detached HEAD has no answer.
async fn current_branch(dir: &Path) -> Result<String, GitError> {
    match run_git(dir, &["symbolic-ref", "--short", "HEAD"]).await {
        Ok(branch) => Ok(branch),
        Err(GitError::CommandFailed { stderr, .. }) => Err(GitError::Inconclusive(
            if stderr.is_empty() {
                "detached HEAD".to_string()
            } else {
                stderr
            },
        )),
        Err(e) => Err(e),
    }
}

/// Fetch every remote and collect the `<remote>/<branch>` tracking refs with
/// their commit ids.
async fn remote_refs(
    dir: &Path,
    branch: &str,
    out: &dyn Printer,
) -> Result<Vec<(String, String)>, GitError> {
    let remotes = run_git(dir, &["remote"]).await?;
    let mut found = Vec::new();
    for remote in remotes.lines().map(str::trim).filter(|r| !r.is_empty()) {
        run_git(dir, &["fetch", remote]).await?;
        let wanted = format!("{remote}/{branch}");
        let listing = run_git(
            dir,
            &[
                "for-each-ref",
                "--format=%(refname:short) %(objectname)",
                &format!("refs/remotes/{remote}/"),
            ],
        )
        .await?;
        for line in listing.lines() {
            let Some((name, commit)) = line.split_once(' ') else {
                continue;
            };
            if name == wanted {
                let shown = &commit[..SHORT_ID_LEN.min(commit.len())];
                out.line(&format!("Found \"{name}\" at {shown}"));
                found.push((name.to_string(), commit.to_string()));
            }
        }
    }
    Ok(found)
}

/// Resolve the commit a deploy should use.
///
/// `local` short-circuits to the local HEAD. Otherwise the requested branch
/// (or the current one when `branch` is `None`) is looked up on every
/// remote; all remotes must agree on its HEAD.
pub async fn head_of(
    dir: &Path,
    branch: Option<&str>,
    local: bool,
    out: &dyn Printer,
) -> Result<String, GitError> {
    if local {
        return short_id(dir, "HEAD").await;
    }
    let branch = match branch {
        Some(branch) => branch.to_string(),
        None => current_branch(dir).await?,
    };
    out.line(&format!("Getting remote HEAD of {branch}"));
    let refs = remote_refs(dir, &branch, out).await?;
    let Some((_, first)) = refs.first() else {
        return Err(GitError::NoRemoteBranch(branch));
    };
    if refs.iter().any(|(_, commit)| commit != first) {
        return Err(GitError::AmbiguousRemotes(branch));
    }
    short_id(dir, first).await
}
