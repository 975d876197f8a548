//! Operator subcommands: inspect and drive repositories, builds and
//! containers from the shell, against the same database as the server.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Subcommand, ValueEnum};
use diesel_async::AsyncPgConnection;
use serde_json::json;

use crate::config::NohandsConfig;
use crate::db::DbPool;
use crate::error::ServiceError;
use crate::models::build::BuildStatus;
use crate::models::commit::short_sha;
use crate::routes::api::{BranchJson, RepositoryJson};
use crate::services::build_service::{self, BuildRow, TriggerParams};
use crate::services::executor::BuildRunner;
use crate::services::{container_service, docker, git_service, repository_service, Window};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Plain,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// List repositories
    RepoList {
        /// Show only active repositories
        #[arg(long)]
        active_only: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Connect a Git repository (remote URL or local path)
    RepoConnect {
        /// Repository name (unique identifier)
        name: String,
        /// Git repository URL or local path
        url: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "main")]
        default_branch: String,
        #[arg(long, default_value = "Dockerfile")]
        dockerfile_path: String,
        /// Create repository as inactive
        #[arg(long)]
        inactive: bool,
        #[arg(long, default_value = "")]
        github_id: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Fetch a repository and update its branches
    RepoRefresh {
        /// Repository ID or name
        repository: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// List commits of a branch
    BranchCommits {
        /// Repository ID or name
        repository: String,
        /// Branch name (defaults to the repository's default branch)
        #[arg(long)]
        branch: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Refresh commits from Git before listing
        #[arg(long)]
        refresh: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// List builds
    BuildList {
        /// Filter by repository ID or name
        #[arg(long)]
        repository: Option<String>,
        #[arg(long, value_parser = parse_build_status)]
        status: Option<BuildStatus>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Show one build
    BuildDetail {
        build_id: i64,
        #[arg(long)]
        show_logs: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Create a build and run it
    BuildCreate {
        /// Repository ID or name
        repository: String,
        /// Branch name (defaults to the repository's default branch)
        #[arg(long)]
        branch: Option<String>,
        /// Commit SHA or prefix (defaults to the branch head)
        #[arg(long)]
        commit: Option<String>,
        #[arg(long)]
        push_to_registry: bool,
        #[arg(long, default_value_t = 8080)]
        container_port: i32,
        #[arg(long)]
        dockerfile_path: Option<String>,
        /// Inline Dockerfile content
        #[arg(long)]
        dockerfile_content: Option<String>,
        /// Queue the build for the server instead of running it here
        #[arg(long)]
        no_wait: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// List builds that have containers
    ContainerList {
        #[arg(long)]
        running_only: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Start a container from a successful build
    ContainerStart {
        build_id: i64,
        /// Host port (auto-assigned if not given)
        #[arg(long)]
        host_port: Option<u16>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Stop a build's container
    ContainerStop {
        build_id: i64,
        /// Do not remove the container after stopping
        #[arg(long)]
        no_remove: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Show a build container's output
    ContainerLogs {
        build_id: i64,
        #[arg(long, default_value_t = 100)]
        tail: u32,
        #[arg(long, value_enum, default_value_t = LogFormat::Plain)]
        format: LogFormat,
    },
}

fn parse_build_status(value: &str) -> Result<BuildStatus, String> {
    value.parse().map_err(|e: crate::models::build::InvalidStatus| e.to_string())
}

/// Shorten `text` to `max` chars, on one line.
fn clip(text: &str, max: usize) -> String {
    let line = text.replace('\n', " ");
    if line.chars().count() > max {
        let cut: String = line.chars().take(max).collect();
        format!("{cut}...")
    } else {
        line
    }
}

fn date(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_summary((build, repository, sha): &BuildRow) -> serde_json::Value {
    json!({
        "id": build.id,
        "repository": repository,
        "commit_sha": short_sha(sha),
        "branch_name": build.branch_name,
        "status": build.status,
        "image_tag": build.image_tag,
        "duration": build.duration(),
        "error_message": build.error_message,
        "container_status": build.container_status,
        "host_port": build.host_port,
        "container_url": build.container_url(),
        "created_at": build.created_at,
    })
}

/// Run an operator subcommand. `Serve` is handled by `main`.
pub async fn run(command: Command, pool: DbPool, config: Arc<NohandsConfig>) -> anyhow::Result<()> {
    let mut conn = pool.get().await?;
    let conn: &mut AsyncPgConnection = &mut conn;

    match command {
        Command::Serve => anyhow::bail!("serve is not an operator subcommand"),
        Command::RepoList {
            active_only,
            format,
        } => repo_list(conn, active_only, format).await,
        Command::RepoConnect {
            name,
            url,
            description,
            default_branch,
            dockerfile_path,
            inactive,
            github_id,
            format,
        } => {
            let req = crate::routes::api::ConnectRepositoryRequest {
                name,
                url,
                description,
                default_branch: Some(default_branch),
                dockerfile_path: Some(dockerfile_path),
                github_id,
            };
            let mut new_repository = req.into_new_repository()?;
            new_repository.is_active = !inactive;
            let repository = repository_service::connect_repository(conn, new_repository).await?;
            match format {
                OutputFormat::Json => print_json(&RepositoryJson::from(repository)),
                OutputFormat::Table => {
                    println!("Repository '{}' connected.", repository.name);
                    println!("\nRepository details:");
                    println!("  ID: {}", repository.id);
                    println!("  Name: {}", repository.name);
                    println!("  URL: {}", repository.url);
                    println!("  Default Branch: {}", repository.default_branch);
                    println!("  Dockerfile Path: {}", repository.dockerfile_path);
                    println!("  Active: {}", if repository.is_active { "Yes" } else { "No" });
                    println!("\nRun 'nohands repo-refresh {}' to fetch branches.", repository.id);
                    Ok(())
                }
            }
        }
        Command::RepoRefresh { repository, format } => {
            let repository = repository_service::resolve_repository(conn, &repository).await?;
            if format == OutputFormat::Table {
                println!("Refreshing branches for repository: {}", repository.name);
            }
            let branches = repository_service::refresh_branches(conn, &config, &repository).await?;
            match format {
                OutputFormat::Json => {
                    let rows: Vec<BranchJson> = branches
                        .into_iter()
                        .map(|b| BranchJson::from((b, repository.name.clone())))
                        .collect();
                    print_json(&rows)
                }
                OutputFormat::Table => {
                    let cache = config.cache_path(repository.id, &repository.name);
                    match git_service::repository_info(&cache) {
                        Ok(info) => println!(
                            "Cache: {} at {} ({})",
                            info.remote_url,
                            short_sha(&info.head_commit),
                            info.active_branch
                        ),
                        Err(e) => tracing::warn!("Could not read cache state: {e}"),
                    }
                    println!("\nFound {} branch(es):\n", branches.len());
                    println!("{:<6} {:<40} Latest Commit", "ID", "Branch Name");
                    println!("{}", "-".repeat(80));
                    for branch in branches {
                        println!(
                            "{:<6} {:<40} {}",
                            branch.id,
                            branch.name,
                            short_sha(&branch.commit_sha)
                        );
                    }
                    Ok(())
                }
            }
        }
        Command::BranchCommits {
            repository,
            branch,
            limit,
            refresh,
            format,
        } => branch_commits(conn, &config, &repository, branch, limit, refresh, format).await,
        Command::BuildList {
            repository,
            status,
            limit,
            format,
        } => {
            let repository_id = match repository {
                Some(identifier) => {
                    Some(repository_service::resolve_repository(conn, &identifier).await?.id)
                }
                None => None,
            };
            let (rows, _) =
                build_service::list_builds(conn, repository_id, status, Window::first(limit))
                    .await?;
            print_builds(&rows, format)
        }
        Command::BuildDetail {
            build_id,
            show_logs,
            format,
        } => build_detail(conn, build_id, show_logs, format).await,
        Command::BuildCreate {
            repository,
            branch,
            commit,
            push_to_registry,
            container_port,
            dockerfile_path,
            dockerfile_content,
            no_wait,
            format,
        } => {
            let repository = repository_service::resolve_repository(conn, &repository).await?;
            let branch_name = branch.unwrap_or_else(|| repository.default_branch.clone());
            let branch = match repository_service::find_branch(conn, repository.id, &branch_name).await {
                Ok(branch) => branch,
                Err(ServiceError::NotFound(_)) => {
                    println!("Branch \"{branch_name}\" not found. Refreshing branches...");
                    repository_service::refresh_branches(conn, &config, &repository).await?;
                    repository_service::find_branch(conn, repository.id, &branch_name).await?
                }
                Err(e) => return Err(e.into()),
            };
            let commit = match commit {
                Some(sha) => repository_service::find_commit(conn, repository.id, &sha).await?,
                None => {
                    repository_service::refresh_commits(conn, &config, &repository, &branch, 1)
                        .await?;
                    repository_service::latest_commit(conn, branch.id)
                        .await?
                        .ok_or_else(|| {
                            anyhow::anyhow!("No commits found on branch '{branch_name}'")
                        })?
                }
            };

            let build = build_service::create_build(
                conn,
                TriggerParams {
                    repository_id: repository.id,
                    commit_id: commit.id,
                    push_to_registry,
                    deploy_after_build: false,
                    container_port: Some(container_port),
                    dockerfile_path,
                    dockerfile_content,
                },
            )
            .await?;
            println!("Build #{} created", build.id);

            if no_wait {
                println!(
                    "Build queued; a running 'nohands serve' will pick it up. \
                     Use 'nohands build-detail {}' to check status.",
                    build.id
                );
                return Ok(());
            }

            println!("Starting build...");
            BuildRunner::new(pool.clone(), config.clone()).run(build.id).await?;
            let finished = build_service::get_build_record(conn, build.id).await?;
            if !finished.status.is_finished() {
                println!(
                    "Build #{} was claimed by another runner (status: {}).",
                    build.id, finished.status
                );
            }
            build_detail(conn, build.id, false, format).await
        }
        Command::ContainerList {
            running_only,
            format,
        } => {
            let rows = build_service::list_with_containers(conn, running_only).await?;
            match format {
                OutputFormat::Json => {
                    let rows: Vec<_> = rows.iter().map(build_summary).collect();
                    print_json(&rows)
                }
                OutputFormat::Table => {
                    if rows.is_empty() {
                        println!("No containers found.");
                        return Ok(());
                    }
                    println!("\nFound {} container(s):\n", rows.len());
                    println!(
                        "{:<8} {:<25} {:<10} {:<12} {:<10} URL",
                        "Build", "Repository", "Commit", "Status", "Port"
                    );
                    println!("{}", "-".repeat(100));
                    for (build, repository, sha) in &rows {
                        let port = build.host_port.map(|p| p.to_string()).unwrap_or_default();
                        println!(
                            "{:<8} {:<25} {:<10} {:<12} {:<10} {}",
                            format!("#{}", build.id),
                            clip(repository, 23),
                            short_sha(sha),
                            build.container_status,
                            port,
                            build.container_url()
                        );
                    }
                    Ok(())
                }
            }
        }
        Command::ContainerStart {
            build_id,
            host_port,
            format,
        } => {
            if format == OutputFormat::Table {
                println!("Starting container for build #{build_id}...");
            }
            let build = container_service::start(conn, &config, build_id, host_port).await?;
            match format {
                OutputFormat::Json => print_json(&json!({
                    "build_id": build.id,
                    "container_id": build.container_id,
                    "host_port": build.host_port,
                    "container_port": build.container_port,
                    "url": build.container_url(),
                })),
                OutputFormat::Table => {
                    println!("\nContainer started successfully!");
                    println!("\n  Container ID: {}", docker::short_id(&build.container_id));
                    println!("  Host Port: {}", build.host_port.unwrap_or_default());
                    println!("  Container Port: {}", build.container_port);
                    println!("  URL: {}", build.container_url());
                    println!("  Proxy: /builds/{}/fwd/", build.id);
                    Ok(())
                }
            }
        }
        Command::ContainerStop {
            build_id,
            no_remove,
            format,
        } => {
            let before = build_service::get_build_record(conn, build_id).await?;
            container_service::stop(conn, build_id, !no_remove).await?;
            let container_id = docker::short_id(&before.container_id);
            match format {
                OutputFormat::Json => print_json(&json!({
                    "build_id": build_id,
                    "container_id": container_id,
                    "stopped": true,
                    "removed": !no_remove,
                })),
                OutputFormat::Table => {
                    println!("\nContainer stopped successfully!");
                    if !no_remove {
                        println!("  Container {container_id} has been removed.");
                    }
                    Ok(())
                }
            }
        }
        Command::ContainerLogs {
            build_id,
            tail,
            format,
        } => {
            let logs = container_service::logs(conn, build_id, Some(tail)).await?;
            match format {
                LogFormat::Json => print_json(&json!({
                    "build_id": logs.build_id,
                    "container_id": docker::short_id(&logs.container_id),
                    "status": logs.status,
                    "logs": logs.logs,
                })),
                LogFormat::Plain => {
                    println!(
                        "Container: {} (Status: {})",
                        docker::short_id(&logs.container_id),
                        logs.status
                    );
                    println!("{}", "-".repeat(50));
                    if logs.logs.is_empty() {
                        println!("No logs available.");
                    } else {
                        print!("{}", logs.logs);
                    }
                    Ok(())
                }
            }
        }
    }
}

async fn repo_list(
    conn: &mut AsyncPgConnection,
    active_only: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let (mut repositories, _) =
        repository_service::list_repositories(conn, active_only, Window::ALL).await?;
    repositories.sort_by(|a, b| a.name.cmp(&b.name));

    if format == OutputFormat::Json {
        let rows: Vec<RepositoryJson> = repositories.into_iter().map(Into::into).collect();
        return print_json(&rows);
    }
    if repositories.is_empty() {
        println!("No repositories found.");
        return Ok(());
    }
    println!("\nFound {} repository(ies):\n", repositories.len());
    println!(
        "{:<6} {:<30} {:<15} {:<8} URL",
        "ID", "Name", "Default Branch", "Active"
    );
    println!("{}", "-".repeat(100));
    for repository in repositories {
        println!(
            "{:<6} {:<30} {:<15} {:<8} {}",
            repository.id,
            repository.name,
            repository.default_branch,
            if repository.is_active { "yes" } else { "no" },
            repository.url
        );
    }
    Ok(())
}

async fn branch_commits(
    conn: &mut AsyncPgConnection,
    config: &NohandsConfig,
    identifier: &str,
    branch: Option<String>,
    limit: usize,
    refresh: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let repository = repository_service::resolve_repository(conn, identifier).await?;
    let branch_name = branch.unwrap_or_else(|| repository.default_branch.clone());
    let branch = match repository_service::find_branch(conn, repository.id, &branch_name).await {
        Ok(branch) => branch,
        Err(ServiceError::NotFound(_)) => anyhow::bail!(
            "Branch '{branch_name}' not found. Run 'nohands repo-refresh {}' first.",
            repository.id
        ),
        Err(e) => return Err(e.into()),
    };

    if refresh {
        println!("Refreshing commits for {}/{}...", repository.name, branch_name);
        repository_service::refresh_commits(conn, config, &repository, &branch, limit).await?;
    }

    let (rows, _) = repository_service::list_commits(
        conn,
        Some(repository.id),
        Some(branch.id),
        commit_window(limit),
    )
    .await?;

    if format == OutputFormat::Json {
        let commits: Vec<_> = rows
            .iter()
            .map(|(commit, _, _)| {
                json!({
                    "id": commit.id,
                    "sha": commit.sha,
                    "message": commit.message,
                    "author": commit.author,
                    "author_email": commit.author_email,
                    "committed_at": commit.committed_at,
                })
            })
            .collect();
        return print_json(&commits);
    }
    if rows.is_empty() {
        println!("No commits found. Try running with --refresh.");
        return Ok(());
    }
    println!("\nCommits for {}/{}:\n", repository.name, branch_name);
    println!("{:<6} {:<10} {:<20} {:<20} Message", "ID", "SHA", "Author", "Date");
    println!("{}", "-".repeat(100));
    for (commit, _, _) in rows {
        println!(
            "{:<6} {:<10} {:<20} {:<20} {}",
            commit.id,
            commit.short_sha(),
            clip(&commit.author, 18),
            date(commit.committed_at),
            clip(&commit.message, 40)
        );
    }
    Ok(())
}

fn print_builds(rows: &[BuildRow], format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        let builds: Vec<_> = rows.iter().map(build_summary).collect();
        return print_json(&builds);
    }
    if rows.is_empty() {
        println!("No builds found.");
        return Ok(());
    }
    println!("\nFound {} build(s):\n", rows.len());
    println!(
        "{:<6} {:<25} {:<10} {:<20} {:<10} {:<10}",
        "ID", "Repository", "Commit", "Branch", "Status", "Duration"
    );
    println!("{}", "-".repeat(100));
    for (build, repository, sha) in rows {
        println!(
            "{:<6} {:<25} {:<10} {:<20} {:<10} {:<10}",
            build.id,
            clip(repository, 23),
            short_sha(sha),
            clip(&build.branch_name, 18),
            build.status,
            build.duration()
        );
    }
    Ok(())
}

async fn build_detail(
    conn: &mut AsyncPgConnection,
    build_id: i64,
    show_logs: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let row = match build_service::get_build(conn, build_id).await {
        Ok(row) => row,
        Err(ServiceError::NotFound(_)) => anyhow::bail!("Build #{build_id} not found."),
        Err(e) => return Err(e.into()),
    };

    if format == OutputFormat::Json {
        let mut summary = build_summary(&row);
        summary["push_to_registry"] = json!(row.0.push_to_registry);
        summary["container_port"] = json!(row.0.container_port);
        summary["dockerfile_path"] = json!(row.0.dockerfile_path);
        summary["started_at"] = json!(row.0.started_at);
        summary["completed_at"] = json!(row.0.completed_at);
        if show_logs {
            summary["logs"] = json!(row.0.logs);
        }
        return print_json(&summary);
    }

    let (build, repository, sha) = row;
    println!("\nBuild #{}", build.id);
    println!("{}", "=".repeat(50));
    println!("Status: {}", build.status);
    println!("\nRepository: {repository}");
    println!("Branch: {}", build.branch_name);
    println!("Commit: {}", short_sha(&sha));
    println!("\nConfiguration:");
    println!(
        "  Push to Registry: {}",
        if build.push_to_registry { "Yes" } else { "No" }
    );
    println!("  Container Port: {}", build.container_port);
    if build.dockerfile_content.is_some() {
        println!("  Dockerfile: inline ({})", build.dockerfile_path);
    } else {
        println!("  Dockerfile: {}", build.dockerfile_path);
    }
    println!("\nTiming:");
    println!("  Created: {}", build.created_at);
    if let Some(started) = build.started_at {
        println!("  Started: {started}");
    }
    if let Some(completed) = build.completed_at {
        println!("  Completed: {completed}");
    }
    println!("  Duration: {}", build.duration());
    if !build.image_tag.is_empty() {
        println!("\nImage Tag: {}", build.image_tag);
    }
    if build.container_status != crate::models::build::ContainerStatus::None {
        println!("\nContainer:");
        println!("  Status: {}", build.container_status);
        if !build.container_id.is_empty() {
            println!("  Container ID: {}", docker::short_id(&build.container_id));
        }
        if let Some(port) = build.host_port {
            println!("  Host Port: {port}");
            println!("  URL: http://localhost:{port}");
        }
    }
    if !build.error_message.is_empty() {
        println!("\nError: {}", build.error_message);
    }
    if show_logs {
        println!("\nBuild Logs:");
        println!("{}", "-".repeat(50));
        println!("{}", build.logs);
    }
    Ok(())
}

/// Listing window for `limit` commits; limits past `i64::MAX` list everything.
fn commit_window(limit: usize) -> Window {
    Window::first(i64::try_from(limit).unwrap_or(i64::MAX))
}
