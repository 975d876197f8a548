//! Connection pool and schema migration.

use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};

pub type DbPool = Pool<AsyncPgConnection>;

/// SQL migration for the NoHands tables. Idempotent.
pub const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS repositories (
    id              BIGSERIAL PRIMARY KEY,
    name            VARCHAR(255) NOT NULL UNIQUE,
    url             VARCHAR(500) NOT NULL,
    description     TEXT NOT NULL DEFAULT '',
    default_branch  VARCHAR(100) NOT NULL DEFAULT 'main',
    dockerfile_path VARCHAR(255) NOT NULL DEFAULT 'Dockerfile',
    is_active       BOOLEAN NOT NULL DEFAULT TRUE,
    github_id       VARCHAR(100) NOT NULL DEFAULT '',
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS branches (
    id              BIGSERIAL PRIMARY KEY,
    repository_id   BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    name            VARCHAR(255) NOT NULL,
    commit_sha      VARCHAR(40) NOT NULL,
    last_updated    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (repository_id, name)
);

CREATE TABLE IF NOT EXISTS commits (
    id              BIGSERIAL PRIMARY KEY,
    repository_id   BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    branch_id       BIGINT REFERENCES branches(id) ON DELETE CASCADE,
    sha             VARCHAR(40) NOT NULL,
    message         TEXT NOT NULL,
    author          VARCHAR(255) NOT NULL,
    author_email    VARCHAR(254) NOT NULL,
    committed_at    TIMESTAMPTZ NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (repository_id, sha)
);

CREATE INDEX IF NOT EXISTS idx_commits_branch ON commits (branch_id);
CREATE INDEX IF NOT EXISTS idx_commits_committed ON commits (committed_at DESC);

CREATE TABLE IF NOT EXISTS builds (
    id                  BIGSERIAL PRIMARY KEY,
    repository_id       BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    commit_id           BIGINT NOT NULL REFERENCES commits(id) ON DELETE CASCADE,
    status              VARCHAR(20) NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'running', 'success', 'failed', 'cancelled')),
    branch_name         VARCHAR(255) NOT NULL,
    image_tag           VARCHAR(255) NOT NULL DEFAULT '',
    logs                TEXT NOT NULL DEFAULT '',
    error_message       TEXT NOT NULL DEFAULT '',
    created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at          TIMESTAMPTZ,
    completed_at        TIMESTAMPTZ,
    push_to_registry    BOOLEAN NOT NULL DEFAULT FALSE,
    deploy_after_build  BOOLEAN NOT NULL DEFAULT FALSE,
    dockerfile_path     VARCHAR(255) NOT NULL DEFAULT 'Dockerfile',
    dockerfile_content  TEXT,
    container_port      INTEGER NOT NULL DEFAULT 8080,
    host_port           INTEGER,
    container_id        VARCHAR(64) NOT NULL DEFAULT '',
    container_status    VARCHAR(20) NOT NULL DEFAULT 'none'
                        CHECK (container_status IN ('none', 'starting', 'running', 'stopped', 'error'))
);

CREATE INDEX IF NOT EXISTS idx_builds_status ON builds (status);
CREATE INDEX IF NOT EXISTS idx_builds_repository ON builds (repository_id);
CREATE INDEX IF NOT EXISTS idx_builds_created ON builds (created_at DESC);
"#;

/// Build the connection pool. Connections are opened lazily.
pub fn create_pool(database_url: &str) -> anyhow::Result<DbPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder(manager).build()?;
    Ok(pool)
}

/// Create the NoHands tables if they do not exist.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL).await?;
    Ok(())
}

/// Helpers for tests that need Postgres. They run against `DATABASE_URL`
/// and are skipped when it is unset. Tests share the database, so each one
/// holds a lock for its whole run.
#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use diesel::prelude::*;
    use diesel_async::RunQueryDsl;
    use tokio::sync::{Mutex, MutexGuard};

    use super::*;
    use crate::models::build::Build;
    use crate::models::commit::{Commit, NewCommit};
    use crate::models::repository::{NewRepository, Repository};
    use crate::schema::commits;
    use crate::services::build_service::{self, TriggerParams};
    use crate::services::repository_service;

    static SERIAL: Mutex<()> = Mutex::const_new(());
    static NEXT: AtomicUsize = AtomicUsize::new(0);

    pub(crate) struct TestDb {
        pub(crate) pool: DbPool,
        _serial: MutexGuard<'static, ()>,
    }

    pub(crate) async fn test_db() -> Option<TestDb> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL not set; skipping database test");
            return None;
        };
        let serial = SERIAL.lock().await;
        let pool = create_pool(&url).unwrap();
        let mut conn = pool.get().await.unwrap();
        run_migration(&mut conn).await.unwrap();
        drop(conn);
        Some(TestDb {
            pool,
            _serial: serial,
        })
    }

    /// A name no earlier test run has used.
    pub(crate) fn unique(prefix: &str) -> String {
        format!(
            "{prefix}-{}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_micros(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    pub(crate) async fn insert_repository(conn: &mut AsyncPgConnection, url: &str) -> Repository {
        repository_service::connect_repository(
            conn,
            NewRepository {
                name: unique("repo"),
                url: url.to_string(),
                description: String::new(),
                default_branch: "main".to_string(),
                dockerfile_path: "Dockerfile".to_string(),
                is_active: true,
                github_id: String::new(),
            },
        )
        .await
        .unwrap()
    }

    pub(crate) async fn insert_commit(conn: &mut AsyncPgConnection, repository_id: i64) -> Commit {
        let sha = format!(
            "{:032x}{:08x}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );
        diesel::insert_into(commits::table)
            .values(&NewCommit {
                repository_id,
                branch_id: None,
                sha,
                message: "Test commit".to_string(),
                author: "Alice".to_string(),
                author_email: "alice@example.com".to_string(),
                committed_at: Utc::now(),
            })
            .returning(Commit::as_returning())
            .get_result(conn)
            .await
            .unwrap()
    }

    pub(crate) async fn insert_build(
        conn: &mut AsyncPgConnection,
        repository_id: i64,
        commit_id: i64,
    ) -> Build {
        build_service::create_build(
            conn,
            TriggerParams {
                repository_id,
                commit_id,
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }
}
