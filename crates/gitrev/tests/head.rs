#![forbid(unsafe_code)]

use std::path::Path;
use std::process::Command;

use skiff_core::BufferPrinter;
use skiff_gitrev::{head_of, GitError};
use tempfile::TempDir;

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .current_dir(dir)
        .args(args)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

fn git_out(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .unwrap();
    assert!(out.status.success(), "git {args:?} failed");
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn init_repo(dir: &Path) {
    git(dir, &["init", "-q"]);
    git(dir, &["config", "user.email", "dev@example.com"]);
    git(dir, &["config", "user.name", "Dev"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
}

fn commit(dir: &Path, file: &str, content: &str, message: &str) {
    std::fs::write(dir.join(file), content).unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-q", "-m", message]);
}

/// Working repo on branch `main` with one commit.
fn working_repo() -> TempDir {
    let work = TempDir::new().unwrap();
    init_repo(work.path());
    commit(work.path(), "a.txt", "one", "first");
    git(work.path(), &["branch", "-m", "main"]);
    work
}

fn add_bare_remote(work: &Path, name: &str) -> TempDir {
    let bare = TempDir::new().unwrap();
    git(bare.path(), &["init", "-q", "--bare"]);
    let url = bare.path().display().to_string();
    git(work, &["remote", "add", name, &url]);
    bare
}

#[tokio::test]
async fn local_mode_returns_the_short_head() {
    let work = working_repo();
    let out = BufferPrinter::new();
    let short = head_of(work.path(), None, true, &out).await.unwrap();
    assert_eq!(short.len(), 8);
    let full = git_out(work.path(), &["rev-parse", "HEAD"]);
    assert!(full.starts_with(&short));
}

#[tokio::test]
async fn remote_branch_resolves_to_its_head() {
    let work = working_repo();
    let _origin = add_bare_remote(work.path(), "origin");
    git(work.path(), &["push", "-q", "origin", "main"]);
    let out = BufferPrinter::new();

    let short = head_of(work.path(), Some("main"), false, &out).await.unwrap();

    let full = git_out(work.path(), &["rev-parse", "HEAD"]);
    assert!(full.starts_with(&short));
    let infos = out.infos();
    assert_eq!(infos[0], "Getting remote HEAD of main");
    assert_eq!(infos[1], format!("Found \"origin/main\" at {short}"));
}

#[tokio::test]
async fn current_branch_is_used_when_none_is_given() {
    let work = working_repo();
    let _origin = add_bare_remote(work.path(), "origin");
    git(work.path(), &["push", "-q", "origin", "main"]);
    let out = BufferPrinter::new();

    let short = head_of(work.path(), None, false, &out).await.unwrap();
    let full = git_out(work.path(), &["rev-parse", "HEAD"]);
    assert!(full.starts_with(&short));
}

#[tokio::test]
async fn stale_remote_head_wins_over_local_commits() {
    let work = working_repo();
    let _origin = add_bare_remote(work.path(), "origin");
    git(work.path(), &["push", "-q", "origin", "main"]);
    let pushed = git_out(work.path(), &["rev-parse", "HEAD"]);
    commit(work.path(), "b.txt", "two", "unpushed");
    let out = BufferPrinter::new();

    let short = head_of(work.path(), Some("main"), false, &out).await.unwrap();
    assert!(pushed.starts_with(&short));
}

#[tokio::test]
async fn unknown_branch_has_no_remote_tracking_ref() {
    let work = working_repo();
    let _origin = add_bare_remote(work.path(), "origin");
    git(work.path(), &["push", "-q", "origin", "main"]);
    let out = BufferPrinter::new();

    let err = head_of(work.path(), Some("release"), false, &out)
        .await
        .unwrap_err();
    assert!(matches!(err, GitError::NoRemoteBranch(branch) if branch == "release"));
}

#[tokio::test]
async fn repo_without_remotes_resolves_nothing() {
    let work = working_repo();
    let out = BufferPrinter::new();
    let err = head_of(work.path(), Some("main"), false, &out)
        .await
        .unwrap_err();
    assert!(matches!(err, GitError::NoRemoteBranch(_)));
}

#[tokio::test]
async fn detached_head_is_inconclusive() {
    let work = working_repo();
    git(work.path(), &["checkout", "-q", "--detach"]);
    let out = BufferPrinter::new();

    let err = head_of(work.path(), None, false, &out).await.unwrap_err();
    assert!(matches!(err, GitError::Inconclusive(_)), "{err}");
    assert!(err.to_string().contains("inconclusive"));
}

#[tokio::test]
async fn disagreeing_remotes_are_refused() {
    let work = working_repo();
    let _origin = add_bare_remote(work.path(), "origin");
    let _backup = add_bare_remote(work.path(), "backup");
    git(work.path(), &["push", "-q", "origin", "main"]);
    git(work.path(), &["push", "-q", "backup", "main"]);
    commit(work.path(), "b.txt", "two", "second");
    git(work.path(), &["push", "-q", "backup", "main"]);
    let out = BufferPrinter::new();

    let err = head_of(work.path(), Some("main"), false, &out)
        .await
        .unwrap_err();
    assert!(matches!(err, GitError::AmbiguousRemotes(branch) if branch == "main"));
}

#[tokio::test]
async fn agreeing_remotes_are_fine() {
    let work = working_repo();
    let _origin = add_bare_remote(work.path(), "origin");
    let _backup = add_bare_remote(work.path(), "backup");
    git(work.path(), &["push", "-q", "origin", "main"]);
    git(work.path(), &["push", "-q", "backup", "main"]);
    let out = BufferPrinter::new();

    let short = head_of(work.path(), Some("main"), false, &out).await.unwrap();
    let full = git_out(work.path(), &["rev-parse", "HEAD"]);
    assert!(full.starts_with(&short));
    assert_eq!(out.infos().len(), 3);
}
