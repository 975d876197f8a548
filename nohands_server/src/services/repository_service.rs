//! Repositories, branches and commits: CRUD plus refresh from the git cache.

use chrono::Utc;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::config::NohandsConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::models::branch::{Branch, NewBranch};
use crate::models::commit::{Commit, NewCommit};
use crate::models::repository::{NewRepository, Repository};
use crate::schema::{branches, commits, repositories};
use crate::services::git_service;
use crate::services::Window;

/// A branch with its repository's name.
pub type BranchRow = (Branch, String);
/// A commit with its repository's name and (optional) branch name.
pub type CommitRow = (Commit, String, Option<String>);

// ── Repositories ──

pub async fn list_repositories(
    conn: &mut AsyncPgConnection,
    active_only: bool,
    window: Window,
) -> ServiceResult<(Vec<Repository>, i64)> {
    let mut query = repositories::table.into_boxed();
    let mut count = repositories::table.into_boxed();
    if active_only {
        query = query.filter(repositories::is_active.eq(true));
        count = count.filter(repositories::is_active.eq(true));
    }

    let total: i64 = count.count().get_result(conn).await?;
    let results = query
        .order((repositories::created_at.desc(), repositories::id.desc()))
        .offset(window.offset)
        .limit(window.limit)
        .select(Repository::as_select())
        .load(conn)
        .await?;
    Ok((results, total))
}

pub async fn get_repository(conn: &mut AsyncPgConnection, id: i64) -> ServiceResult<Repository> {
    repositories::table
        .find(id)
        .select(Repository::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| ServiceError::not_found("Repository"))
}

/// Look a repository up by ID (all digits) or by name.
pub async fn resolve_repository(
    conn: &mut AsyncPgConnection,
    identifier: &str,
) -> ServiceResult<Repository> {
    let found = if !identifier.is_empty() && identifier.bytes().all(|b| b.is_ascii_digit()) {
        let id: i64 = identifier
            .parse()
            .map_err(|_| ServiceError::Invalid(format!("Invalid repository ID '{identifier}'")))?;
        repositories::table
            .find(id)
            .select(Repository::as_select())
            .first(conn)
            .await
            .optional()?
    } else {
        repositories::table
            .filter(repositories::name.eq(identifier))
            .select(Repository::as_select())
            .first(conn)
            .await
            .optional()?
    };
    found.ok_or_else(|| ServiceError::NotFound(format!("Repository '{identifier}' not found")))
}

/// Register a repository. Names are unique.
pub async fn connect_repository(
    conn: &mut AsyncPgConnection,
    new_repository: NewRepository,
) -> ServiceResult<Repository> {
    let existing: i64 = repositories::table
        .filter(repositories::name.eq(&new_repository.name))
        .count()
        .get_result(conn)
        .await?;
    if existing > 0 {
        return Err(ServiceError::Conflict(format!(
            "Repository with name '{}' already exists",
            new_repository.name
        )));
    }

    let repository = diesel::insert_into(repositories::table)
        .values(&new_repository)
        .returning(Repository::as_returning())
        .get_result(conn)
        .await?;

    tracing::info!(
        repository_id = repository.id,
        name = %repository.name,
        url = %repository.url,
        "Repository connected"
    );
    Ok(repository)
}

/// Update the git cache and upsert every branch it knows about.
pub async fn refresh_branches(
    conn: &mut AsyncPgConnection,
    config: &NohandsConfig,
    repository: &Repository,
) -> ServiceResult<Vec<Branch>> {
    let cache = config.cache_path(repository.id, &repository.name);
    let found = {
        let lock = git_service::cache_lock(&cache);
        let _guard = lock.lock().await;
        git_service::clone_or_update_blocking(repository.url.clone(), cache.clone()).await?;
        git_service::list_branches_blocking(cache).await?
    };

    let now = Utc::now();
    let rows: Vec<NewBranch> = found
        .into_iter()
        .map(|info| NewBranch {
            repository_id: repository.id,
            name: info.name,
            commit_sha: info.commit_sha,
            last_updated: now,
        })
        .collect();

    if !rows.is_empty() {
        diesel::insert_into(branches::table)
            .values(&rows)
            .on_conflict((branches::repository_id, branches::name))
            .do_update()
            .set((
                branches::commit_sha.eq(excluded(branches::commit_sha)),
                branches::last_updated.eq(excluded(branches::last_updated)),
            ))
            .execute(conn)
            .await?;
    }

    crate::metrics::git_refresh("branches");
    tracing::info!(
        repository_id = repository.id,
        branches = rows.len(),
        "Branches refreshed"
    );

    let branches = branches::table
        .filter(branches::repository_id.eq(repository.id))
        .order(branches::name.asc())
        .select(Branch::as_select())
        .load(conn)
        .await?;
    Ok(branches)
}

/// Upsert the newest `limit` commits of `branch`. Returns how many were seen.
pub async fn refresh_commits(
    conn: &mut AsyncPgConnection,
    config: &NohandsConfig,
    repository: &Repository,
    branch: &Branch,
    limit: usize,
) -> ServiceResult<usize> {
    let cache = config.cache_path(repository.id, &repository.name);
    let found = {
        let lock = git_service::cache_lock(&cache);
        let _guard = lock.lock().await;
        git_service::clone_or_update_blocking(repository.url.clone(), cache.clone()).await?;
        git_service::list_commits_blocking(cache, branch.name.clone(), limit).await?
    };

    let rows: Vec<NewCommit> = found
        .into_iter()
        .map(|info| NewCommit {
            repository_id: repository.id,
            branch_id: Some(branch.id),
            sha: info.sha,
            message: info.message,
            author: info.author,
            author_email: info.author_email,
            committed_at: info.committed_at,
        })
        .collect();

    if !rows.is_empty() {
        diesel::insert_into(commits::table)
            .values(&rows)
            .on_conflict((commits::repository_id, commits::sha))
            .do_update()
            .set((
                commits::branch_id.eq(excluded(commits::branch_id)),
                commits::message.eq(excluded(commits::message)),
                commits::author.eq(excluded(commits::author)),
                commits::author_email.eq(excluded(commits::author_email)),
                commits::committed_at.eq(excluded(commits::committed_at)),
            ))
            .execute(conn)
            .await?;
    }

    crate::metrics::git_refresh("commits");
    tracing::info!(
        repository_id = repository.id,
        branch = %branch.name,
        commits = rows.len(),
        "Commits refreshed"
    );
    Ok(rows.len())
}

// ── Branches ──

pub async fn list_branches(
    conn: &mut AsyncPgConnection,
    repository_id: Option<i64>,
    window: Window,
) -> ServiceResult<(Vec<BranchRow>, i64)> {
    let mut query = branches::table
        .inner_join(repositories::table)
        .select((Branch::as_select(), repositories::name))
        .into_boxed();
    let mut count = branches::table.into_boxed();
    if let Some(repository_id) = repository_id {
        query = query.filter(branches::repository_id.eq(repository_id));
        count = count.filter(branches::repository_id.eq(repository_id));
    }

    let total: i64 = count.count().get_result(conn).await?;
    let results = query
        .order((branches::name.asc(), branches::id.asc()))
        .offset(window.offset)
        .limit(window.limit)
        .load::<BranchRow>(conn)
        .await?;
    Ok((results, total))
}

pub async fn get_branch(conn: &mut AsyncPgConnection, id: i64) -> ServiceResult<BranchRow> {
    branches::table
        .inner_join(repositories::table)
        .filter(branches::id.eq(id))
        .select((Branch::as_select(), repositories::name))
        .first::<BranchRow>(conn)
        .await
        .optional()?
        .ok_or_else(|| ServiceError::not_found("Branch"))
}

pub async fn find_branch(
    conn: &mut AsyncPgConnection,
    repository_id: i64,
    name: &str,
) -> ServiceResult<Branch> {
    branches::table
        .filter(branches::repository_id.eq(repository_id))
        .filter(branches::name.eq(name))
        .select(Branch::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| ServiceError::NotFound(format!("Branch '{name}' not found")))
}

// ── Commits ──

pub async fn list_commits(
    conn: &mut AsyncPgConnection,
    repository_id: Option<i64>,
    branch_id: Option<i64>,
    window: Window,
) -> ServiceResult<(Vec<CommitRow>, i64)> {
    let mut query = commits::table
        .inner_join(repositories::table)
        .left_join(branches::table)
        .select((
            Commit::as_select(),
            repositories::name,
            branches::name.nullable(),
        ))
        .into_boxed();
    let mut count = commits::table.into_boxed();
    if let Some(repository_id) = repository_id {
        query = query.filter(commits::repository_id.eq(repository_id));
        count = count.filter(commits::repository_id.eq(repository_id));
    }
    if let Some(branch_id) = branch_id {
        query = query.filter(commits::branch_id.eq(branch_id));
        count = count.filter(commits::branch_id.eq(branch_id));
    }

    let total: i64 = count.count().get_result(conn).await?;
    let results = query
        .order((commits::committed_at.desc(), commits::id.desc()))
        .offset(window.offset)
        .limit(window.limit)
        .load::<CommitRow>(conn)
        .await?;
    Ok((results, total))
}

pub async fn get_commit(conn: &mut AsyncPgConnection, id: i64) -> ServiceResult<CommitRow> {
    commits::table
        .inner_join(repositories::table)
        .left_join(branches::table)
        .filter(commits::id.eq(id))
        .select((
            Commit::as_select(),
            repositories::name,
            branches::name.nullable(),
        ))
        .first::<CommitRow>(conn)
        .await
        .optional()?
        .ok_or_else(|| ServiceError::not_found("Commit"))
}

/// Find a commit of `repository_id` by full or abbreviated SHA.
pub async fn find_commit(
    conn: &mut AsyncPgConnection,
    repository_id: i64,
    sha: &str,
) -> ServiceResult<Commit> {
    if sha.is_empty() || !sha.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ServiceError::Invalid(format!("Invalid commit SHA '{sha}'")));
    }
    let mut matches = commits::table
        .filter(commits::repository_id.eq(repository_id))
        .filter(commits::sha.like(format!("{sha}%")))
        .select(Commit::as_select())
        .limit(2)
        .load(conn)
        .await?;
    match matches.len() {
        0 => Err(ServiceError::NotFound(format!("Commit '{sha}' not found"))),
        1 => Ok(matches.remove(0)),
        _ => Err(ServiceError::Invalid(format!("Ambiguous commit SHA '{sha}'"))),
    }
}

/// Newest known commit on a branch.
pub async fn latest_commit(
    conn: &mut AsyncPgConnection,
    branch_id: i64,
) -> ServiceResult<Option<Commit>> {
    let commit = commits::table
        .filter(commits::branch_id.eq(branch_id))
        .order(commits::committed_at.desc())
        .select(Commit::as_select())
        .first(conn)
        .await
        .optional()?;
    Ok(commit)
}

#[cfg(test)]
mod tests {
    use git2::Repository as GitRepository;

    use super::*;
    use crate::db::test_support::{insert_repository, test_db, unique};
    use crate::services::git_service::tests::{commit_file, fixture};

    fn config_in(dir: &std::path::Path) -> NohandsConfig {
        let checkout_dir = dir.join("checkouts").display().to_string();
        NohandsConfig::from_lookup(move |key| {
            (key == "NOHANDS_CHECKOUT_DIR").then(|| checkout_dir.clone())
        })
    }

    #[tokio::test]
    async fn duplicate_names_conflict() {
        let Some(db) = test_db().await else { return };
        let mut conn = db.pool.get().await.unwrap();
        let repository = insert_repository(&mut conn, "https://example.com/dup.git").await;

        let err = connect_repository(
            &mut conn,
            NewRepository {
                name: repository.name.clone(),
                url: "https://example.com/other.git".to_string(),
                description: String::new(),
                default_branch: "main".to_string(),
                dockerfile_path: "Dockerfile".to_string(),
                is_active: true,
                github_id: String::new(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        assert_eq!(
            err.to_string(),
            format!("Repository with name '{}' already exists", repository.name)
        );
    }

    #[tokio::test]
    async fn refresh_upserts_branches_and_commits() {
        let Some(db) = test_db().await else { return };
        let mut conn = db.pool.get().await.unwrap();
        let fx = fixture();
        let config = config_in(fx.dir.path());
        let repository = insert_repository(&mut conn, &fx.upstream.display().to_string()).await;

        let branches = refresh_branches(&mut conn, &config, &repository).await.unwrap();
        let names: Vec<&str> = branches.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["feature", "main"]);
        assert_eq!(branches[1].commit_sha, fx.second);
        assert!(config
            .cache_path(repository.id, &repository.name)
            .join(".git")
            .exists());

        let upstream = GitRepository::open(&fx.upstream).unwrap();
        let third = commit_file(&upstream, "refs/heads/main", "README.md", "v3\n", "Third", 4_000);
        let branches = refresh_branches(&mut conn, &config, &repository).await.unwrap();
        assert_eq!(branches.len(), 2);
        let main = branches.iter().find(|b| b.name == "main").unwrap();
        assert_eq!(main.commit_sha, third);

        assert_eq!(refresh_commits(&mut conn, &config, &repository, main, 10).await.unwrap(), 3);
        assert_eq!(refresh_commits(&mut conn, &config, &repository, main, 10).await.unwrap(), 3);
        let (rows, total) = list_commits(&mut conn, Some(repository.id), None, Window::ALL)
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(rows[0].0.sha, third);
        assert_eq!(rows[0].2.as_deref(), Some("main"));

        // Shared history moves to whichever branch was refreshed last.
        let feature = branches.iter().find(|b| b.name == "feature").unwrap();
        assert_eq!(refresh_commits(&mut conn, &config, &repository, feature, 10).await.unwrap(), 3);
        let (_, total) = list_commits(&mut conn, Some(repository.id), None, Window::ALL)
            .await
            .unwrap();
        assert_eq!(total, 4);
        let second = find_commit(&mut conn, repository.id, &fx.second).await.unwrap();
        assert_eq!(second.branch_id, Some(feature.id));
        assert_eq!(
            latest_commit(&mut conn, main.id).await.unwrap().map(|c| c.sha),
            Some(third)
        );
    }

    #[tokio::test]
    async fn repositories_resolve_by_id_or_name() {
        let Some(db) = test_db().await else { return };
        let mut conn = db.pool.get().await.unwrap();
        let repository = insert_repository(&mut conn, "https://example.com/resolve.git").await;

        let by_id = resolve_repository(&mut conn, &repository.id.to_string()).await.unwrap();
        assert_eq!(by_id.name, repository.name);
        let by_name = resolve_repository(&mut conn, &repository.name).await.unwrap();
        assert_eq!(by_name.id, repository.id);
        let missing = unique("missing");
        let err = resolve_repository(&mut conn, &missing).await.unwrap_err();
        assert_eq!(err.to_string(), format!("Repository '{missing}' not found"));
    }
}
