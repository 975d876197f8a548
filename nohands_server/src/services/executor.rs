//! Build executor: runs dispatched builds in the background.
//!
//! Each dispatched build gets its own tokio task. A semaphore caps how many
//! run at once; builds waiting for a permit stay `pending`. The image
//! pipeline itself runs on a blocking thread with its own runtime.
//!
//! Builds created outside the server (e.g. `nohands build-create --no-wait`)
//! are picked up by a poll loop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use nohands_pipeline::{BuildOutcome, ImageBuildRequest, OutcomeStatus};
use tokio::sync::Semaphore;

use crate::config::NohandsConfig;
use crate::db::DbPool;
use crate::models::build::{Build, BuildStatus};
use crate::models::commit::Commit;
use crate::models::repository::Repository;
use crate::schema::{builds, commits, repositories};
use crate::services::{build_service, container_service, git_service};

#[derive(Clone)]
pub struct BuildRunner {
    pool: DbPool,
    config: Arc<NohandsConfig>,
    permits: Arc<Semaphore>,
    /// Builds dispatched in this process and not finished yet.
    queued: Arc<Mutex<HashSet<i64>>>,
}

impl BuildRunner {
    pub fn new(pool: DbPool, config: Arc<NohandsConfig>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_builds));
        Self {
            pool,
            config,
            permits,
            queued: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn queued(&self) -> std::sync::MutexGuard<'_, HashSet<i64>> {
        self.queued.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `build_id` in the background. No-op if it is already queued here.
    pub fn dispatch(&self, build_id: i64) {
        if !self.queued().insert(build_id) {
            return;
        }
        let runner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run(build_id).await {
                tracing::error!(build_id, "Build execution error: {e:#}");
            }
            runner.queued().remove(&build_id);
        });
    }

    /// Dispatch pending builds forever. Spawned as a background tokio task.
    pub async fn run_poller(self, interval: Duration) {
        tracing::info!(
            max_concurrent = self.config.max_concurrent_builds,
            "Build executor started"
        );

        loop {
            if let Err(e) = self.poll_pending().await {
                tracing::error!("Executor poll error: {e}");
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn poll_pending(&self) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let pending = build_service::pending_build_ids(&mut conn).await?;
        drop(conn);
        for build_id in pending {
            self.dispatch(build_id);
        }
        Ok(())
    }

    /// Wait for a permit, then execute the build to completion.
    pub async fn run(&self, build_id: i64) -> anyhow::Result<()> {
        let permit = self.permits.acquire().await?;
        crate::metrics::running_builds(self.running());
        let result = self.execute(build_id).await;
        drop(permit);
        crate::metrics::running_builds(self.running());
        result
    }

    fn running(&self) -> usize {
        self.config
            .max_concurrent_builds
            .saturating_sub(self.permits.available_permits())
    }

    /// Fail interrupted builds and re-dispatch pending ones.
    pub async fn recover(&self) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let (_, pending) = build_service::recover_interrupted(&mut conn).await?;
        drop(conn);
        for build_id in pending {
            self.dispatch(build_id);
        }
        Ok(())
    }

    async fn execute(&self, build_id: i64) -> anyhow::Result<()> {
        {
            let mut conn = self.pool.get().await?;
            if !build_service::claim_build(&mut conn, build_id).await? {
                tracing::debug!(build_id, "Build is no longer pending, skipping");
                return Ok(());
            }
        }

        let result = self.execute_claimed(build_id).await;
        if let Err(e) = &result {
            self.abandon(build_id, e).await;
        }
        result
    }

    /// Best effort after an error: a build claimed here must not stay `running`.
    async fn abandon(&self, build_id: i64, error: &anyhow::Error) {
        let message = format!("Build runner error: {error:#}");
        let failed = match self.pool.get().await {
            Ok(mut conn) => build_service::fail_running_build(&mut conn, build_id, &message)
                .await
                .map_err(anyhow::Error::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = failed {
            tracing::error!(build_id, "Could not mark build as failed: {e:#}");
        }
    }

    async fn execute_claimed(&self, build_id: i64) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let (build, repository, commit) = builds::table
            .inner_join(repositories::table)
            .inner_join(commits::table)
            .filter(builds::id.eq(build_id))
            .select((
                Build::as_select(),
                Repository::as_select(),
                Commit::as_select(),
            ))
            .first::<(Build, Repository, Commit)>(&mut conn)
            .await
            .context("Failed to load build")?;

        tracing::info!(
            build_id,
            repository = %repository.name,
            commit = %commit.short_sha(),
            "Executing build"
        );
        drop(conn);

        let build_start = Instant::now();
        let result = self.build(&build, &repository, &commit).await;

        let mut conn = self.pool.get().await?;
        match result {
            Ok(outcome) => {
                let status = match outcome.status {
                    OutcomeStatus::Success => BuildStatus::Success,
                    OutcomeStatus::Failed => BuildStatus::Failed,
                };
                build_service::finish_build(
                    &mut conn,
                    build_id,
                    status,
                    &outcome.image_tag,
                    &outcome.logs,
                    &outcome.error_message,
                )
                .await?;
            }
            Err(e) => {
                tracing::error!(build_id, "Build failed: {e}");
                build_service::fail_build(&mut conn, build_id, &e.to_string()).await?;
            }
        }
        let millis = build_start.elapsed().as_millis();
        crate::metrics::build_duration(u64::try_from(millis).unwrap_or(u64::MAX));

        if build.deploy_after_build {
            let finished = build_service::get_build_record(&mut conn, build_id).await?;
            if finished.status == BuildStatus::Success {
                tracing::info!(build_id, "Deploying after build");
                if let Err(e) = container_service::start(&mut conn, &self.config, build_id, None).await {
                    tracing::error!(build_id, "Deploy after build failed: {e}");
                }
            }
        }

        Ok(())
    }

    /// Update the cache, check the commit out and run the image pipeline.
    async fn build(
        &self,
        build: &Build,
        repository: &Repository,
        commit: &Commit,
    ) -> anyhow::Result<BuildOutcome> {
        let cache = self.config.cache_path(repository.id, &repository.name);
        let checkout = self.config.build_path(build.id);

        {
            let lock = git_service::cache_lock(&cache);
            let _guard = lock.lock().await;
            git_service::clone_or_update_blocking(repository.url.clone(), cache.clone()).await?;
            git_service::checkout_commit_blocking(cache, commit.sha.clone(), checkout.clone())
                .await?;
        }

        let registry = if build.push_to_registry {
            let registry = self.config.registry();
            if registry.is_none() {
                tracing::warn!(
                    build_id = build.id,
                    "Registry push requested but credentials are not configured"
                );
            }
            registry
        } else {
            None
        };

        let request = ImageBuildRequest {
            source_dir: checkout,
            dockerfile_path: build.dockerfile_path.clone(),
            dockerfile_content: build.dockerfile_content.clone(),
            image_name: repository.image_name(),
            image_tag: commit.short_sha().to_string(),
            registry,
        };

        let outcome =
            tokio::task::spawn_blocking(move || nohands_pipeline::build_image_blocking(request))
                .await?;
        Ok(outcome)
    }
}
