//! REST API payloads: request bodies, query strings, JSON shapes and pagination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};
use crate::models::build::{Build, BuildStatus, ContainerStatus};
use crate::models::repository::{check_name, NewRepository, Repository};
use crate::services::build_service::{BuildRow, TriggerParams};
use crate::services::container_service::ContainerLogs;
use crate::services::repository_service::{BranchRow, CommitRow};
use crate::services::Window;

pub const MAX_PAGE_SIZE: i64 = 100;
pub const DEFAULT_COMMIT_REFRESH_LIMIT: usize = 50;
pub const MAX_COMMIT_REFRESH_LIMIT: usize = 1000;
pub const DEFAULT_LOG_TAIL: u32 = 100;

// ── Pagination ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: i64,
    pub page_size: i64,
}

impl PageRequest {
    /// 1-based page; size defaults to `default_size` and is capped at [`MAX_PAGE_SIZE`].
    pub fn new(page: Option<i64>, page_size: Option<i64>, default_size: i64) -> Self {
        Self {
            page: page.filter(|p| *p >= 1).unwrap_or(1),
            page_size: page_size
                .filter(|s| *s >= 1)
                .unwrap_or(default_size)
                .min(MAX_PAGE_SIZE),
        }
    }

    pub fn window(&self) -> Window {
        Window {
            offset: (self.page - 1).saturating_mul(self.page_size),
            limit: self.page_size,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Paginated<T> {
    pub count: i64,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub results: Vec<T>,
}

impl<T> Paginated<T> {
    /// `filters` are repeated on the `next`/`previous` links.
    pub fn new(
        results: Vec<T>,
        count: i64,
        page: PageRequest,
        path: &str,
        filters: &[(&str, Option<String>)],
    ) -> Self {
        let link = |number: i64| {
            let mut url = format!("{path}?page={number}&page_size={}", page.page_size);
            for (key, value) in filters {
                if let Some(value) = value {
                    url.push_str(&format!("&{key}={value}"));
                }
            }
            url
        };
        let next = (page.page * page.page_size < count).then(|| link(page.page + 1));
        let previous = (page.page > 1).then(|| link(page.page - 1));
        Self {
            count,
            next,
            previous,
            results,
        }
    }
}

// ── Query strings ──

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BranchQuery {
    pub repository: Option<i64>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommitQuery {
    pub repository: Option<i64>,
    pub branch: Option<i64>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BuildQuery {
    pub repository: Option<i64>,
    pub status: Option<BuildStatus>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshCommitsQuery {
    pub limit: Option<usize>,
}

impl RefreshCommitsQuery {
    pub fn limit(&self) -> usize {
        self.limit
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_COMMIT_REFRESH_LIMIT)
            .min(MAX_COMMIT_REFRESH_LIMIT)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StartContainerQuery {
    pub host_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StopContainerQuery {
    pub remove: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<u32>,
}

// ── Request bodies ──

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub repository_id: i64,
    pub commit_id: i64,
    #[serde(default)]
    pub push_to_registry: bool,
    #[serde(default)]
    pub deploy_after_build: bool,
    pub container_port: Option<i32>,
    pub dockerfile_path: Option<String>,
    pub dockerfile_content: Option<String>,
}

impl From<TriggerRequest> for TriggerParams {
    fn from(req: TriggerRequest) -> Self {
        TriggerParams {
            repository_id: req.repository_id,
            commit_id: req.commit_id,
            push_to_registry: req.push_to_registry,
            deploy_after_build: req.deploy_after_build,
            container_port: req.container_port,
            dockerfile_path: req.dockerfile_path,
            dockerfile_content: req.dockerfile_content,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectRepositoryRequest {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    pub default_branch: Option<String>,
    pub dockerfile_path: Option<String>,
    #[serde(default)]
    pub github_id: String,
}

impl ConnectRepositoryRequest {
    pub fn into_new_repository(self) -> ServiceResult<NewRepository> {
        let name = self.name.trim().to_string();
        let url = self.url.trim().to_string();
        if name.is_empty() {
            return Err(ServiceError::Invalid("Repository name is required".to_string()));
        }
        if url.is_empty() {
            return Err(ServiceError::Invalid("Repository URL is required".to_string()));
        }
        check_name(&name).map_err(ServiceError::Invalid)?;
        Ok(NewRepository {
            name,
            url,
            description: self.description,
            default_branch: non_blank(self.default_branch).unwrap_or_else(|| "main".to_string()),
            dockerfile_path: non_blank(self.dockerfile_path)
                .unwrap_or_else(|| "Dockerfile".to_string()),
            is_active: true,
            github_id: self.github_id,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ── Responses ──

#[derive(Debug, Serialize)]
pub struct RepositoryJson {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub description: String,
    pub default_branch: String,
    pub dockerfile_path: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Repository> for RepositoryJson {
    fn from(r: Repository) -> Self {
        RepositoryJson {
            id: r.id,
            name: r.name,
            url: r.url,
            description: r.description,
            default_branch: r.default_branch,
            dockerfile_path: r.dockerfile_path,
            is_active: r.is_active,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BranchJson {
    pub id: i64,
    pub repository_name: String,
    pub name: String,
    pub commit_sha: String,
    pub last_updated: DateTime<Utc>,
}

impl From<BranchRow> for BranchJson {
    fn from((branch, repository_name): BranchRow) -> Self {
        BranchJson {
            id: branch.id,
            repository_name,
            name: branch.name,
            commit_sha: branch.commit_sha,
            last_updated: branch.last_updated,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CommitJson {
    pub id: i64,
    pub repository_name: String,
    pub branch_name: Option<String>,
    pub sha: String,
    pub message: String,
    pub author: String,
    pub author_email: String,
    pub committed_at: DateTime<Utc>,
}

impl From<CommitRow> for CommitJson {
    fn from((commit, repository_name, branch_name): CommitRow) -> Self {
        CommitJson {
            id: commit.id,
            repository_name,
            branch_name,
            sha: commit.sha,
            message: commit.message,
            author: commit.author,
            author_email: commit.author_email,
            committed_at: commit.committed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BuildJson {
    pub id: i64,
    pub repository_name: String,
    pub commit_sha: String,
    pub branch_name: String,
    pub status: BuildStatus,
    pub image_tag: String,
    pub logs: String,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub push_to_registry: bool,
    pub deploy_after_build: bool,
    pub duration: String,
    pub container_status: ContainerStatus,
    pub container_port: i32,
    pub host_port: Option<i32>,
    pub container_url: String,
}

impl From<BuildRow> for BuildJson {
    fn from((build, repository_name, commit_sha): BuildRow) -> Self {
        BuildJson::new(build, repository_name, commit_sha)
    }
}

impl BuildJson {
    pub fn new(build: Build, repository_name: String, commit_sha: String) -> Self {
        let duration = build.duration();
        let container_url = build.container_url();
        BuildJson {
            id: build.id,
            repository_name,
            commit_sha,
            branch_name: build.branch_name,
            status: build.status,
            image_tag: build.image_tag,
            logs: build.logs,
            error_message: build.error_message,
            created_at: build.created_at,
            started_at: build.started_at,
            completed_at: build.completed_at,
            push_to_registry: build.push_to_registry,
            deploy_after_build: build.deploy_after_build,
            duration,
            container_status: build.container_status,
            container_port: build.container_port,
            host_port: build.host_port,
            container_url,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RefreshCommitsResponse {
    pub branch: String,
    pub commits: usize,
}

#[derive(Debug, Serialize)]
pub struct ContainerLogsJson {
    pub build_id: i64,
    pub container_id: String,
    pub container_status: ContainerStatus,
    pub logs: String,
}

impl From<ContainerLogs> for ContainerLogsJson {
    fn from(logs: ContainerLogs) -> Self {
        ContainerLogsJson {
            build_id: logs.build_id,
            container_id: logs.container_id,
            container_status: logs.status,
            logs: logs.logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::build::tests::sample_build;

    #[test]
    fn page_request_defaults_and_caps() {
        assert_eq!(
            PageRequest::new(None, None, 20),
            PageRequest {
                page: 1,
                page_size: 20
            }
        );
        assert_eq!(PageRequest::new(Some(0), Some(500), 20).page_size, 100);
        assert_eq!(PageRequest::new(Some(-3), Some(0), 20).page, 1);
        assert_eq!(
            PageRequest::new(Some(3), Some(10), 20).window(),
            Window {
                offset: 20,
                limit: 10
            }
        );
    }

    #[test]
    fn pagination_links() {
        let page = PageRequest::new(Some(2), Some(10), 20);
        let paged = Paginated::new(
            vec![1, 2, 3],
            35,
            page,
            "/api/builds/",
            &[("repository", Some("4".to_string())), ("status", None)],
        );
        assert_eq!(paged.count, 35);
        assert_eq!(
            paged.next.as_deref(),
            Some("/api/builds/?page=3&page_size=10&repository=4")
        );
        assert_eq!(
            paged.previous.as_deref(),
            Some("/api/builds/?page=1&page_size=10&repository=4")
        );

        let last = Paginated::new(vec![1], 35, PageRequest::new(Some(4), Some(10), 20), "/x/", &[]);
        assert!(last.next.is_none());
        let first = Paginated::<i32>::new(vec![], 0, PageRequest::new(None, None, 20), "/x/", &[]);
        assert!(first.next.is_none() && first.previous.is_none());
    }

    #[test]
    fn trigger_request_defaults() {
        let req: TriggerRequest =
            serde_json::from_str(r#"{"repository_id": 1, "commit_id": 2}"#).unwrap();
        let params = TriggerParams::from(req);
        assert_eq!(params.repository_id, 1);
        assert_eq!(params.commit_id, 2);
        assert!(!params.push_to_registry);
        assert!(!params.deploy_after_build);
        assert!(params.container_port.is_none());
    }

    #[test]
    fn connect_request_validation() {
        let req: ConnectRepositoryRequest =
            serde_json::from_str(r#"{"name": " web ", "url": "https://example.com/web.git"}"#)
                .unwrap();
        let repo = req.into_new_repository().unwrap();
        assert_eq!(repo.name, "web");
        assert_eq!(repo.default_branch, "main");
        assert_eq!(repo.dockerfile_path, "Dockerfile");
        assert!(repo.is_active);

        let req: ConnectRepositoryRequest =
            serde_json::from_str(r#"{"name": "", "url": "x"}"#).unwrap();
        assert!(matches!(
            req.into_new_repository(),
            Err(ServiceError::Invalid(_))
        ));
    }

    #[test]
    fn connect_request_rejects_path_like_names() {
        let req: ConnectRepositoryRequest = serde_json::from_str(
            r#"{"name": "../../victim", "url": "https://example.com/x.git"}"#,
        )
        .unwrap();
        let err = req.into_new_repository().unwrap_err();
        assert!(matches!(err, ServiceError::Invalid(_)));
        assert!(err.to_string().starts_with("Invalid repository name '../../victim'"));
    }

    #[test]
    fn build_json_carries_derived_fields() {
        let mut build = sample_build();
        build.container_status = ContainerStatus::Running;
        build.host_port = Some(8004);
        let json = serde_json::to_value(BuildJson::new(
            build,
            "web".to_string(),
            "0123abcd".to_string(),
        ))
        .unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["container_status"], "running");
        assert_eq!(json["container_url"], "http://localhost:8004");
        assert_eq!(json["duration"], "N/A");
        assert_eq!(json["repository_name"], "web");
    }

    #[test]
    fn refresh_limit_is_bounded() {
        assert_eq!(RefreshCommitsQuery::default().limit(), 50);
        assert_eq!(RefreshCommitsQuery { limit: Some(5000) }.limit(), 1000);
    }
}
