//! Build records: creation, listing and status transitions.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::error::{ServiceError, ServiceResult};
use crate::models::build::{Build, BuildStatus, NewBuild};
use crate::models::commit::Commit;
use crate::models::repository::Repository;
use crate::schema::{branches, builds, commits, repositories};
use crate::services::Window;

/// A build with its repository name and commit SHA.
pub type BuildRow = (Build, String, String);

/// Stored build logs keep at most this many trailing bytes.
pub const MAX_LOG_BYTES: usize = 64 * 1024;

pub const DEFAULT_CONTAINER_PORT: i32 = 8080;

#[derive(Debug, Clone, Default)]
pub struct TriggerParams {
    pub repository_id: i64,
    pub commit_id: i64,
    pub push_to_registry: bool,
    pub deploy_after_build: bool,
    pub container_port: Option<i32>,
    pub dockerfile_path: Option<String>,
    pub dockerfile_content: Option<String>,
}

/// Validate a trigger against the repository and commit and insert a
/// `pending` build. Dispatching it is up to the caller.
pub async fn create_build(
    conn: &mut AsyncPgConnection,
    params: TriggerParams,
) -> ServiceResult<Build> {
    let repository = repositories::table
        .find(params.repository_id)
        .select(Repository::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| ServiceError::not_found("Repository"))?;

    let commit = commits::table
        .filter(commits::id.eq(params.commit_id))
        .filter(commits::repository_id.eq(repository.id))
        .select(Commit::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| ServiceError::not_found("Commit"))?;

    let branch_name = match commit.branch_id {
        Some(branch_id) => branches::table
            .find(branch_id)
            .select(branches::name)
            .first::<String>(conn)
            .await
            .optional()?,
        None => None,
    };

    let new_build = new_build(&repository, &commit, branch_name, params)?;
    let build = diesel::insert_into(builds::table)
        .values(&new_build)
        .returning(Build::as_returning())
        .get_result(conn)
        .await?;

    crate::metrics::build_status_changed(BuildStatus::Pending.as_str());
    tracing::info!(
        build_id = build.id,
        repository = %repository.name,
        commit = %commit.short_sha(),
        branch = %build.branch_name,
        "Build created"
    );
    Ok(build)
}

fn new_build(
    repository: &Repository,
    commit: &Commit,
    branch_name: Option<String>,
    params: TriggerParams,
) -> ServiceResult<NewBuild> {
    let container_port = params.container_port.unwrap_or(DEFAULT_CONTAINER_PORT);
    if !(1..=65535).contains(&container_port) {
        return Err(ServiceError::Invalid(format!(
            "container_port must be between 1 and 65535, got {container_port}"
        )));
    }

    Ok(NewBuild {
        repository_id: repository.id,
        commit_id: commit.id,
        status: BuildStatus::Pending,
        branch_name: branch_name.unwrap_or_else(|| "unknown".to_string()),
        push_to_registry: params.push_to_registry,
        deploy_after_build: params.deploy_after_build,
        dockerfile_path: params
            .dockerfile_path
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| repository.dockerfile_path.clone()),
        dockerfile_content: params.dockerfile_content.filter(|c| !c.trim().is_empty()),
        container_port,
    })
}

pub async fn list_builds(
    conn: &mut AsyncPgConnection,
    repository_id: Option<i64>,
    status: Option<BuildStatus>,
    window: Window,
) -> ServiceResult<(Vec<BuildRow>, i64)> {
    let mut query = builds::table
        .inner_join(repositories::table)
        .inner_join(commits::table)
        .select((Build::as_select(), repositories::name, commits::sha))
        .into_boxed();
    let mut count = builds::table.into_boxed();
    if let Some(repository_id) = repository_id {
        query = query.filter(builds::repository_id.eq(repository_id));
        count = count.filter(builds::repository_id.eq(repository_id));
    }
    if let Some(status) = status {
        query = query.filter(builds::status.eq(status));
        count = count.filter(builds::status.eq(status));
    }

    let total: i64 = count.count().get_result(conn).await?;
    let results = query
        .order((builds::created_at.desc(), builds::id.desc()))
        .offset(window.offset)
        .limit(window.limit)
        .load::<BuildRow>(conn)
        .await?;
    Ok((results, total))
}

pub async fn get_build(conn: &mut AsyncPgConnection, build_id: i64) -> ServiceResult<BuildRow> {
    builds::table
        .inner_join(repositories::table)
        .inner_join(commits::table)
        .filter(builds::id.eq(build_id))
        .select((Build::as_select(), repositories::name, commits::sha))
        .first::<BuildRow>(conn)
        .await
        .optional()?
        .ok_or_else(|| ServiceError::not_found("Build"))
}

/// The bare build row, without joins.
pub async fn get_build_record(conn: &mut AsyncPgConnection, build_id: i64) -> ServiceResult<Build> {
    builds::table
        .find(build_id)
        .select(Build::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| ServiceError::not_found("Build"))
}

/// Builds whose container status is not `none`.
pub async fn list_with_containers(
    conn: &mut AsyncPgConnection,
    running_only: bool,
) -> ServiceResult<Vec<BuildRow>> {
    use crate::models::build::ContainerStatus;

    let mut query = builds::table
        .inner_join(repositories::table)
        .inner_join(commits::table)
        .select((Build::as_select(), repositories::name, commits::sha))
        .filter(builds::container_status.ne(ContainerStatus::None))
        .into_boxed();
    if running_only {
        query = query.filter(builds::container_status.eq(ContainerStatus::Running));
    }
    let rows = query
        .order((builds::created_at.desc(), builds::id.desc()))
        .load::<BuildRow>(conn)
        .await?;
    Ok(rows)
}

/// Move a build from `pending` to `running`. Returns `false` when another
/// runner claimed it first.
pub async fn claim_build(conn: &mut AsyncPgConnection, build_id: i64) -> ServiceResult<bool> {
    let claimed = diesel::update(
        builds::table
            .find(build_id)
            .filter(builds::status.eq(BuildStatus::Pending)),
    )
    .set((
        builds::status.eq(BuildStatus::Running),
        builds::started_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await?;

    if claimed > 0 {
        crate::metrics::build_status_changed(BuildStatus::Running.as_str());
    }
    Ok(claimed > 0)
}

/// IDs of `pending` builds, oldest first.
pub async fn pending_build_ids(conn: &mut AsyncPgConnection) -> ServiceResult<Vec<i64>> {
    let ids = builds::table
        .filter(builds::status.eq(BuildStatus::Pending))
        .order(builds::id.asc())
        .select(builds::id)
        .load::<i64>(conn)
        .await?;
    Ok(ids)
}

/// Store the final state of a build.
pub async fn finish_build(
    conn: &mut AsyncPgConnection,
    build_id: i64,
    status: BuildStatus,
    image_tag: &str,
    logs: &str,
    error_message: &str,
) -> ServiceResult<()> {
    diesel::update(builds::table.find(build_id))
        .set((
            builds::status.eq(status),
            builds::image_tag.eq(image_tag),
            builds::logs.eq(truncate_logs(logs)),
            builds::error_message.eq(error_message),
            builds::completed_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;

    crate::metrics::build_status_changed(status.as_str());
    tracing::info!(build_id, status = %status, "Build finished");
    Ok(())
}

/// Mark a build `failed`, appending the error to whatever logs it had.
pub async fn fail_build(
    conn: &mut AsyncPgConnection,
    build_id: i64,
    error_message: &str,
) -> ServiceResult<()> {
    let logs: String = builds::table
        .find(build_id)
        .select(builds::logs)
        .first(conn)
        .await?;
    let logs = if logs.is_empty() {
        format!("ERROR: {error_message}")
    } else {
        format!("{logs}\nERROR: {error_message}")
    };
    finish_build(conn, build_id, BuildStatus::Failed, "", &logs, error_message).await
}

/// Mark a build `failed` only if it is still `running`. Builds that already
/// finished keep their result. Returns whether the row changed.
pub async fn fail_running_build(
    conn: &mut AsyncPgConnection,
    build_id: i64,
    error_message: &str,
) -> ServiceResult<bool> {
    let updated = diesel::update(
        builds::table
            .find(build_id)
            .filter(builds::status.eq(BuildStatus::Running)),
    )
    .set((
        builds::status.eq(BuildStatus::Failed),
        builds::error_message.eq(error_message),
        builds::completed_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await?;

    if updated > 0 {
        crate::metrics::build_status_changed(BuildStatus::Failed.as_str());
        tracing::warn!(build_id, error_message, "Build failed by its runner");
    }
    Ok(updated > 0)
}

/// Fail builds left `running` by a previous process and return the IDs of
/// `pending` builds, oldest first, so they can be dispatched again.
pub async fn recover_interrupted(conn: &mut AsyncPgConnection) -> ServiceResult<(usize, Vec<i64>)> {
    let interrupted = diesel::update(builds::table.filter(builds::status.eq(BuildStatus::Running)))
        .set((
            builds::status.eq(BuildStatus::Failed),
            builds::error_message.eq("Build interrupted by server restart"),
            builds::completed_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;

    let pending = pending_build_ids(conn).await?;

    if interrupted > 0 || !pending.is_empty() {
        tracing::warn!(
            interrupted,
            pending = pending.len(),
            "Recovering builds from a previous run"
        );
    }
    Ok((interrupted, pending))
}

/// Keep the last [`MAX_LOG_BYTES`] of `logs`, on a char boundary.
pub fn truncate_logs(logs: &str) -> String {
    if logs.len() <= MAX_LOG_BYTES {
        return logs.to_string();
    }
    let mut start = logs.len() - MAX_LOG_BYTES;
    while !logs.is_char_boundary(start) {
        start += 1;
    }
    format!("...truncated...\n{}", &logs[start..])
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::db::test_support::{insert_build, insert_commit, insert_repository, test_db};

    fn repository() -> Repository {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Repository {
            id: 1,
            name: "Web App".to_string(),
            url: "https://example.com/web.git".to_string(),
            description: String::new(),
            default_branch: "main".to_string(),
            dockerfile_path: "docker/Dockerfile".to_string(),
            is_active: true,
            github_id: String::new(),
            created_at: at,
            updated_at: at,
        }
    }

    fn commit() -> Commit {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Commit {
            id: 5,
            repository_id: 1,
            branch_id: Some(2),
            sha: "0123456789abcdef0123456789abcdef01234567".to_string(),
            message: "Initial".to_string(),
            author: "Alice".to_string(),
            author_email: "alice@example.com".to_string(),
            committed_at: at,
            created_at: at,
        }
    }

    #[test]
    fn new_build_defaults() {
        let params = TriggerParams {
            repository_id: 1,
            commit_id: 5,
            ..Default::default()
        };
        let build = new_build(&repository(), &commit(), None, params).unwrap();
        assert_eq!(build.status, BuildStatus::Pending);
        assert_eq!(build.branch_name, "unknown");
        assert_eq!(build.dockerfile_path, "docker/Dockerfile");
        assert_eq!(build.container_port, 8080);
        assert!(build.dockerfile_content.is_none());
    }

    #[test]
    fn new_build_overrides() {
        let params = TriggerParams {
            repository_id: 1,
            commit_id: 5,
            push_to_registry: true,
            container_port: Some(3000),
            dockerfile_path: Some("Dockerfile.prod".to_string()),
            dockerfile_content: Some("FROM scratch\n".to_string()),
            ..Default::default()
        };
        let build =
            new_build(&repository(), &commit(), Some("develop".to_string()), params).unwrap();
        assert_eq!(build.branch_name, "develop");
        assert_eq!(build.dockerfile_path, "Dockerfile.prod");
        assert_eq!(build.dockerfile_content.as_deref(), Some("FROM scratch\n"));
        assert_eq!(build.container_port, 3000);
        assert!(build.push_to_registry);
    }

    #[test]
    fn blank_overrides_are_ignored() {
        let params = TriggerParams {
            dockerfile_path: Some("  ".to_string()),
            dockerfile_content: Some(String::new()),
            ..Default::default()
        };
        let build = new_build(&repository(), &commit(), None, params).unwrap();
        assert_eq!(build.dockerfile_path, "docker/Dockerfile");
        assert!(build.dockerfile_content.is_none());
    }

    #[test]
    fn container_port_is_validated() {
        let params = TriggerParams {
            container_port: Some(70000),
            ..Default::default()
        };
        let err = new_build(&repository(), &commit(), None, params).unwrap_err();
        assert!(matches!(err, ServiceError::Invalid(_)));
    }

    #[test]
    fn short_logs_are_kept() {
        assert_eq!(truncate_logs("hello"), "hello");
    }

    #[test]
    fn long_logs_keep_the_tail() {
        let logs = format!("{}END", "é".repeat(MAX_LOG_BYTES));
        let truncated = truncate_logs(&logs);
        assert!(truncated.starts_with("...truncated...\n"));
        assert!(truncated.ends_with("END"));
        assert!(truncated.len() <= MAX_LOG_BYTES + "...truncated...\n".len());
    }

    #[tokio::test]
    async fn claim_moves_a_pending_build_to_running_once() {
        let Some(db) = test_db().await else { return };
        let mut conn = db.pool.get().await.unwrap();
        let repository = insert_repository(&mut conn, "https://example.com/claim.git").await;
        let commit = insert_commit(&mut conn, repository.id).await;
        let build = insert_build(&mut conn, repository.id, commit.id).await;
        assert_eq!(build.status, BuildStatus::Pending);

        assert!(claim_build(&mut conn, build.id).await.unwrap());
        assert!(!claim_build(&mut conn, build.id).await.unwrap());

        let claimed = get_build_record(&mut conn, build.id).await.unwrap();
        assert_eq!(claimed.status, BuildStatus::Running);
        assert!(claimed.started_at.is_some());
        assert!(!pending_build_ids(&mut conn).await.unwrap().contains(&build.id));
    }

    #[tokio::test]
    async fn recovery_fails_running_builds_and_requeues_pending() {
        let Some(db) = test_db().await else { return };
        let mut conn = db.pool.get().await.unwrap();
        let repository = insert_repository(&mut conn, "https://example.com/recover.git").await;
        let commit = insert_commit(&mut conn, repository.id).await;
        let running = insert_build(&mut conn, repository.id, commit.id).await;
        let pending = insert_build(&mut conn, repository.id, commit.id).await;
        assert!(claim_build(&mut conn, running.id).await.unwrap());

        let (interrupted, queued) = recover_interrupted(&mut conn).await.unwrap();
        assert!(interrupted >= 1);
        assert!(queued.contains(&pending.id));
        assert!(!queued.contains(&running.id));

        let failed = get_build_record(&mut conn, running.id).await.unwrap();
        assert_eq!(failed.status, BuildStatus::Failed);
        assert_eq!(failed.error_message, "Build interrupted by server restart");
        assert!(failed.completed_at.is_some());
        let untouched = get_build_record(&mut conn, pending.id).await.unwrap();
        assert_eq!(untouched.status, BuildStatus::Pending);
    }

    #[tokio::test]
    async fn failing_a_running_build_leaves_finished_builds_alone() {
        let Some(db) = test_db().await else { return };
        let mut conn = db.pool.get().await.unwrap();
        let repository = insert_repository(&mut conn, "https://example.com/fail.git").await;
        let commit = insert_commit(&mut conn, repository.id).await;
        let finished = insert_build(&mut conn, repository.id, commit.id).await;
        let running = insert_build(&mut conn, repository.id, commit.id).await;
        assert!(claim_build(&mut conn, finished.id).await.unwrap());
        assert!(claim_build(&mut conn, running.id).await.unwrap());
        finish_build(&mut conn, finished.id, BuildStatus::Success, "img:1", "done", "")
            .await
            .unwrap();

        assert!(!fail_running_build(&mut conn, finished.id, "lost").await.unwrap());
        assert!(fail_running_build(&mut conn, running.id, "lost").await.unwrap());

        let kept = get_build_record(&mut conn, finished.id).await.unwrap();
        assert_eq!(kept.status, BuildStatus::Success);
        assert_eq!(kept.error_message, "");
        let failed = get_build_record(&mut conn, running.id).await.unwrap();
        assert_eq!(failed.status, BuildStatus::Failed);
        assert_eq!(failed.error_message, "lost");
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn trigger_requires_a_commit_of_the_same_repository() {
        let Some(db) = test_db().await else { return };
        let mut conn = db.pool.get().await.unwrap();
        let repository = insert_repository(&mut conn, "https://example.com/a.git").await;
        let other = insert_repository(&mut conn, "https://example.com/b.git").await;
        let foreign = insert_commit(&mut conn, other.id).await;

        let err = create_build(
            &mut conn,
            TriggerParams {
                repository_id: i64::MAX,
                commit_id: foreign.id,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Repository not found");

        let err = create_build(
            &mut conn,
            TriggerParams {
                repository_id: repository.id,
                commit_id: foreign.id,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert_eq!(err.to_string(), "Commit not found");
    }
}
