//! Running a successful build's image as a container.

use std::path::PathBuf;

use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::config::NohandsConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::models::build::{Build, BuildStatus, ContainerStatus};
use crate::schema::builds;
use crate::services::build_service;
use crate::services::docker;

#[derive(Debug, Clone)]
pub struct ContainerLogs {
    pub build_id: i64,
    pub container_id: String,
    pub status: ContainerStatus,
    pub logs: String,
}

#[derive(AsChangeset)]
#[diesel(table_name = builds, treat_none_as_null = true)]
struct ContainerChange<'a> {
    container_status: ContainerStatus,
    container_id: &'a str,
    host_port: Option<i32>,
}

/// Only successful builds without a running container can be started.
pub fn ensure_startable(build: &Build) -> ServiceResult<()> {
    if build.status != BuildStatus::Success {
        return Err(ServiceError::Invalid(format!(
            "Can only start containers for successful builds (build status: {})",
            build.status
        )));
    }
    if build.container_status == ContainerStatus::Running && !build.container_id.is_empty() {
        return Err(ServiceError::Conflict(format!(
            "Container is already running (ID: {})",
            docker::short_id(&build.container_id)
        )));
    }
    Ok(())
}

/// The image tarball exported by a build that was not pushed to a registry.
pub fn exported_tar(config: &NohandsConfig, build: &Build) -> Option<PathBuf> {
    if build.push_to_registry {
        return None;
    }
    let (name, tag) = build.image_tag.rsplit_once(':')?;
    Some(nohands_pipeline::export_path(
        &config.build_path(build.id),
        name,
        tag,
    ))
}

/// Environment handed to every container.
pub fn container_env(config: &NohandsConfig) -> Vec<(String, String)> {
    if config.app_url.is_empty() {
        Vec::new()
    } else {
        vec![("CSRF_TRUSTED_ORIGINS".to_string(), config.app_url.clone())]
    }
}

async fn set_status(
    conn: &mut AsyncPgConnection,
    build_id: i64,
    status: ContainerStatus,
) -> ServiceResult<()> {
    diesel::update(builds::table.find(build_id))
        .set(builds::container_status.eq(status))
        .execute(conn)
        .await?;
    Ok(())
}

async fn set_container(
    conn: &mut AsyncPgConnection,
    build_id: i64,
    change: ContainerChange<'_>,
) -> ServiceResult<Build> {
    let build = diesel::update(builds::table.find(build_id))
        .set(&change)
        .returning(Build::as_returning())
        .get_result(conn)
        .await?;
    Ok(build)
}

/// Start a container for `build_id`, on `host_port` or the first free port.
pub async fn start(
    conn: &mut AsyncPgConnection,
    config: &NohandsConfig,
    build_id: i64,
    host_port: Option<u16>,
) -> ServiceResult<Build> {
    let build = build_service::get_build_record(conn, build_id).await?;
    ensure_startable(&build)?;
    let container_port = u16::try_from(build.container_port).map_err(|_| {
        ServiceError::Invalid(format!("Invalid container port {}", build.container_port))
    })?;

    set_status(conn, build_id, ContainerStatus::Starting).await?;

    // A stopped container keeps its name until removed.
    if !build.container_id.is_empty() {
        if let Err(e) = docker::remove_container(&build.container_id, true).await {
            tracing::debug!(build_id, "Old container not removed: {e}");
        }
    }

    match run_container(config, &build, container_port, host_port).await {
        Ok((container_id, host_port)) => {
            crate::metrics::container_action("start");
            set_container(
                conn,
                build_id,
                ContainerChange {
                    container_status: ContainerStatus::Running,
                    container_id: &container_id,
                    host_port: Some(i32::from(host_port)),
                },
            )
            .await
        }
        Err(e) => {
            crate::metrics::container_action("error");
            tracing::error!(build_id, "Failed to start container: {e}");
            set_status(conn, build_id, ContainerStatus::Error).await?;
            Err(e.into())
        }
    }
}

async fn run_container(
    config: &NohandsConfig,
    build: &Build,
    container_port: u16,
    host_port: Option<u16>,
) -> Result<(String, u16), docker::DockerError> {
    let image = match exported_tar(config, build) {
        Some(tar) if tar.exists() => docker::load_image_from_tar(&tar).await?,
        _ => build.image_tag.clone(),
    };
    docker::start_container(
        &image,
        container_port,
        host_port,
        Some(&build.container_name()),
        &container_env(config),
    )
    .await
}

/// Stop the build's container, optionally removing it.
pub async fn stop(conn: &mut AsyncPgConnection, build_id: i64, remove: bool) -> ServiceResult<Build> {
    let build = build_service::get_build_record(conn, build_id).await?;
    if build.container_id.is_empty() {
        return Err(ServiceError::Invalid("No container running for this build".to_string()));
    }

    let gone = already_gone(docker::stop_container(&build.container_id).await)?;
    if gone {
        tracing::warn!(build_id, "Container no longer exists, clearing it");
    } else if remove {
        if let Err(e) = docker::remove_container(&build.container_id, false).await {
            tracing::warn!(build_id, "Failed to remove container: {e}");
        }
    }
    crate::metrics::container_action("stop");

    set_container(
        conn,
        build_id,
        ContainerChange {
            container_status: ContainerStatus::Stopped,
            container_id: "",
            host_port: None,
        },
    )
    .await
}

/// `Ok(true)` when Docker no longer has the container, which counts as stopped.
fn already_gone(stopped: Result<(), docker::DockerError>) -> Result<bool, docker::DockerError> {
    match stopped {
        Ok(()) => Ok(false),
        Err(e) if e.is_missing_container() => Ok(true),
        Err(e) => Err(e),
    }
}

/// Container output. A `running` container that Docker reports as exited
/// is recorded as `stopped`.
pub async fn logs(
    conn: &mut AsyncPgConnection,
    build_id: i64,
    tail: Option<u32>,
) -> ServiceResult<ContainerLogs> {
    let build = build_service::get_build_record(conn, build_id).await?;
    if build.container_id.is_empty() {
        return Err(ServiceError::Invalid("No container found for this build".to_string()));
    }

    let logs = docker::container_logs(&build.container_id, tail).await?;
    let mut status = build.container_status;
    if status == ContainerStatus::Running
        && docker::container_status(&build.container_id).await == "exited"
    {
        status = ContainerStatus::Stopped;
        set_status(conn, build_id, status).await?;
    }

    Ok(ContainerLogs {
        build_id,
        container_id: build.container_id,
        status,
        logs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::build::tests::sample_build;

    fn config(app_url: &str) -> NohandsConfig {
        let app_url = app_url.to_string();
        NohandsConfig::from_lookup(move |key| match key {
            "NOHANDS_CHECKOUT_DIR" => Some("/data".to_string()),
            "NOHANDS_APP_URL" => Some(app_url.clone()),
            _ => None,
        })
    }

    #[test]
    fn only_successful_builds_start() {
        let mut build = sample_build();
        build.status = BuildStatus::Failed;
        let err = ensure_startable(&build).unwrap_err();
        assert!(matches!(err, ServiceError::Invalid(_)));
        assert!(err.to_string().contains("failed"));

        build.status = BuildStatus::Success;
        assert!(ensure_startable(&build).is_ok());
    }

    #[test]
    fn running_container_is_a_conflict() {
        let mut build = sample_build();
        build.container_status = ContainerStatus::Running;
        build.container_id = "abcdef0123456789".to_string();
        let err = ensure_startable(&build).unwrap_err();
        assert_eq!(err.to_string(), "Container is already running (ID: abcdef012345)");
    }

    #[test]
    fn exported_tar_lives_in_the_build_checkout() {
        let mut build = sample_build();
        let tar = exported_tar(&config(""), &build).unwrap();
        assert_eq!(tar, PathBuf::from("/data/builds/build_7/web_0123abcd.tar"));

        build.push_to_registry = true;
        assert!(exported_tar(&config(""), &build).is_none());
    }

    #[test]
    fn csrf_origin_comes_from_app_url() {
        assert!(container_env(&config("")).is_empty());
        assert_eq!(
            container_env(&config("https://ci.example.com")),
            vec![(
                "CSRF_TRUSTED_ORIGINS".to_string(),
                "https://ci.example.com".to_string()
            )]
        );
    }

    #[test]
    fn missing_container_counts_as_stopped() {
        assert!(!already_gone(Ok(())).unwrap());
        let missing = docker::DockerError::Command {
            action: "to stop container",
            stderr: "Error response from daemon: No such container: 0123abcd".to_string(),
        };
        assert!(already_gone(Err(missing)).unwrap());

        let denied = docker::DockerError::Command {
            action: "to stop container",
            stderr: "permission denied".to_string(),
        };
        let err = already_gone(Err(denied)).unwrap_err();
        assert_eq!(err.to_string(), "Failed to stop container: permission denied");
    }
}
