//! Git cache operations on top of libgit2.
//!
//! Every repository is cloned once into `<checkout_dir>/cache/<id>-<name>`
//! and fetched on refresh. Builds get their own checkout under
//! `<checkout_dir>/builds/build_<id>`, cloned from the cache.
//!
//! The functions here are blocking; the `*_blocking` wrappers at the bottom
//! move them onto tokio's blocking pool for async callers. Callers hold
//! [`cache_lock`] for a cache directory while cloning, fetching or checking
//! out from it.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

use chrono::{DateTime, Utc};
use git2::build::CheckoutBuilder;
use git2::{BranchType, Oid, Repository, Sort};

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("Failed to clone/update repository: {0}")]
    Sync(git2::Error),
    #[error("Branch '{0}' not found")]
    BranchNotFound(String),
    #[error("Commit '{0}' not found")]
    CommitNotFound(String),
    #[error("Git operation failed: {0}")]
    Git(#[from] git2::Error),
    #[error("Filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Git task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Refusing to replace '{0}': path contains '..'")]
    UnsafePath(PathBuf),
}

static CACHE_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>> =
    LazyLock::new(Mutex::default);

/// The lock for one cache directory. Shared by every caller in this process.
pub fn cache_lock(path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = CACHE_LOCKS.lock().unwrap_or_else(|e| e.into_inner());
    locks.entry(path.to_path_buf()).or_default().clone()
}

/// Directories this module deletes must not be reached through `..`.
fn ensure_no_parent_dirs(path: &Path) -> Result<(), GitError> {
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(GitError::UnsafePath(path.to_path_buf()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub name: String,
    pub commit_sha: String,
    pub last_commit_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub author_email: String,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub active_branch: String,
    pub head_commit: String,
    pub remote_url: String,
}

/// Clone `url` into `local_path`, or fetch `origin` if a clone is already there.
pub fn clone_or_update(url: &str, local_path: &Path) -> Result<(), GitError> {
    ensure_no_parent_dirs(local_path)?;
    if let Some(parent) = local_path.parent() {
        fs::create_dir_all(parent)?;
    }

    if local_path.join(".git").exists() {
        tracing::info!(path = %local_path.display(), "Fetching cached repository");
        let repo = Repository::open(local_path)?;
        let mut remote = repo.find_remote("origin")?;
        remote
            .fetch(&["+refs/heads/*:refs/remotes/origin/*"], None, None)
            .map_err(GitError::Sync)?;
        return Ok(());
    }

    if local_path.exists() {
        fs::remove_dir_all(local_path)?;
    }
    tracing::info!(url, path = %local_path.display(), "Cloning repository");
    Repository::clone(url, local_path).map_err(GitError::Sync)?;
    Ok(())
}

/// Branches of `origin` (without `origin/HEAD`), plus local branches that
/// have no remote counterpart. Sorted by name.
pub fn list_branches(repo_path: &Path) -> Result<Vec<BranchInfo>, GitError> {
    let repo = Repository::open(repo_path)?;
    let mut found: BTreeMap<String, BranchInfo> = BTreeMap::new();

    for kind in [BranchType::Remote, BranchType::Local] {
        for item in repo.branches(Some(kind))? {
            let (branch, _) = item?;
            let Some(full_name) = branch.name()? else {
                continue;
            };
            let name = match kind {
                BranchType::Remote => match full_name.strip_prefix("origin/") {
                    Some("HEAD") | None => continue,
                    Some(short) => short,
                },
                BranchType::Local => full_name,
            };
            if found.contains_key(name) {
                continue;
            }
            let commit = branch.get().peel_to_commit()?;
            found.insert(
                name.to_string(),
                BranchInfo {
                    name: name.to_string(),
                    commit_sha: commit.id().to_string(),
                    last_commit_date: commit_time(&commit),
                },
            );
        }
    }

    Ok(found.into_values().collect())
}

/// Newest-first history of `branch`, at most `max_count` entries.
pub fn list_commits(
    repo_path: &Path,
    branch: &str,
    max_count: usize,
) -> Result<Vec<CommitInfo>, GitError> {
    let repo = Repository::open(repo_path)?;
    let head = repo
        .find_reference(&format!("refs/remotes/origin/{branch}"))
        .or_else(|_| repo.find_reference(&format!("refs/heads/{branch}")))
        .and_then(|reference| reference.peel_to_commit())
        .map_err(|_| GitError::BranchNotFound(branch.to_string()))?;

    let mut walk = repo.revwalk()?;
    walk.set_sorting(Sort::TIME)?;
    walk.push(head.id())?;

    let mut commits = Vec::new();
    for oid in walk.take(max_count) {
        let commit = repo.find_commit(oid?)?;
        commits.push(CommitInfo {
            sha: commit.id().to_string(),
            message: commit.message().unwrap_or_default().trim().to_string(),
            author: commit.author().name().unwrap_or_default().to_string(),
            author_email: commit.author().email().unwrap_or_default().to_string(),
            committed_at: commit_time(&commit),
        });
    }
    Ok(commits)
}

/// Clone the cache at `repo_path` into an emptied `dest_dir` and detach HEAD
/// at `sha`. Abbreviated SHAs are accepted; the full SHA is returned.
pub fn checkout_commit(repo_path: &Path, sha: &str, dest_dir: &Path) -> Result<String, GitError> {
    ensure_no_parent_dirs(dest_dir)?;
    let source = Repository::open(repo_path)?;
    let oid = resolve_commit(&source, sha)?;

    if dest_dir.exists() {
        fs::remove_dir_all(dest_dir)?;
    }
    fs::create_dir_all(dest_dir)?;

    let repo = Repository::init(dest_dir)?;
    {
        let source_url = repo_path.canonicalize()?;
        let mut remote = repo.remote("origin", &source_url.to_string_lossy())?;
        // The cache keeps upstream branches as remote-tracking refs, so both
        // namespaces are needed to reach every commit it knows about.
        remote
            .fetch(
                &[
                    "+refs/heads/*:refs/remotes/origin/*",
                    "+refs/remotes/origin/*:refs/remotes/cache/*",
                ],
                None,
                None,
            )
            .map_err(GitError::Sync)?;
    }

    let commit = repo
        .find_commit(oid)
        .map_err(|_| GitError::CommitNotFound(sha.to_string()))?;
    repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
    repo.set_head_detached(oid)?;

    tracing::info!(sha = %oid, dest = %dest_dir.display(), "Checked out commit");
    Ok(oid.to_string())
}

pub fn repository_info(repo_path: &Path) -> Result<RepositoryInfo, GitError> {
    let repo = Repository::open(repo_path)?;
    let head = repo.head()?;
    let active_branch = if repo.head_detached()? {
        "detached".to_string()
    } else {
        head.shorthand().unwrap_or("detached").to_string()
    };
    let head_commit = head.peel_to_commit()?.id().to_string();
    let remote_url = repo
        .find_remote("origin")
        .ok()
        .and_then(|remote| remote.url().map(str::to_string))
        .unwrap_or_else(|| "local".to_string());

    Ok(RepositoryInfo {
        active_branch,
        head_commit,
        remote_url,
    })
}

fn resolve_commit(repo: &Repository, sha: &str) -> Result<Oid, GitError> {
    if sha.is_empty() {
        return Err(GitError::CommitNotFound(String::new()));
    }
    repo.revparse_single(sha)
        .and_then(|object| object.peel_to_commit())
        .map(|commit| commit.id())
        .map_err(|_| GitError::CommitNotFound(sha.to_string()))
}

fn commit_time(commit: &git2::Commit<'_>) -> DateTime<Utc> {
    DateTime::from_timestamp(commit.time().seconds(), 0).unwrap_or_default()
}

pub async fn clone_or_update_blocking(url: String, local_path: PathBuf) -> Result<(), GitError> {
    tokio::task::spawn_blocking(move || clone_or_update(&url, &local_path)).await?
}

pub async fn list_branches_blocking(repo_path: PathBuf) -> Result<Vec<BranchInfo>, GitError> {
    tokio::task::spawn_blocking(move || list_branches(&repo_path)).await?
}

pub async fn list_commits_blocking(
    repo_path: PathBuf,
    branch: String,
    max_count: usize,
) -> Result<Vec<CommitInfo>, GitError> {
    tokio::task::spawn_blocking(move || list_commits(&repo_path, &branch, max_count)).await?
}

pub async fn checkout_commit_blocking(
    repo_path: PathBuf,
    sha: String,
    dest_dir: PathBuf,
) -> Result<String, GitError> {
    tokio::task::spawn_blocking(move || checkout_commit(&repo_path, &sha, &dest_dir)).await?
}
