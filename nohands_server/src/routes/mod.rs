//! NoHands HTTP routes: REST API, forwarding proxy and health check.

pub mod api;
pub mod proxy;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use diesel_async::pooled_connection::deadpool::Object;
use diesel_async::AsyncPgConnection;

use crate::config::NohandsConfig;
use crate::db::DbPool;
use crate::error::ServiceResult;
use crate::services::executor::BuildRunner;
use crate::services::{build_service, container_service, repository_service};

use api::{
    BranchJson, BranchQuery, BuildJson, BuildQuery, CommitJson, CommitQuery,
    ConnectRepositoryRequest, ContainerLogsJson, ListQuery, LogsQuery, PageRequest, Paginated,
    RefreshCommitsQuery, RefreshCommitsResponse, RepositoryJson, StartContainerQuery,
    StopContainerQuery, TriggerRequest,
};

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub config: Arc<NohandsConfig>,
    pub runner: BuildRunner,
    /// Client for the forwarding proxy; never follows redirects.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(pool: DbPool, config: Arc<NohandsConfig>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(config.proxy_timeout_secs))
            .build()?;
        let runner = BuildRunner::new(pool.clone(), config.clone());
        Ok(Self {
            pool,
            config,
            runner,
            http,
        })
    }

    async fn conn(&self) -> ServiceResult<Object<AsyncPgConnection>> {
        Ok(self.pool.get().await?)
    }

    fn page(&self, page: Option<i64>, page_size: Option<i64>) -> PageRequest {
        PageRequest::new(page, page_size, self.config.page_size)
    }
}

/// Build the NoHands router.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Repositories
        .route(
            "/api/repositories/",
            get(list_repositories).post(connect_repository),
        )
        .route("/api/repositories/{id}/", get(get_repository))
        .route("/api/repositories/{id}/refresh/", post(refresh_repository))
        // Branches
        .route("/api/branches/", get(list_branches))
        .route("/api/branches/{id}/", get(get_branch))
        .route("/api/branches/{id}/refresh/", post(refresh_branch))
        // Commits
        .route("/api/commits/", get(list_commits))
        .route("/api/commits/{id}/", get(get_commit))
        // Builds
        .route("/api/builds/", get(list_builds))
        .route("/api/builds/trigger/", post(trigger_build))
        .route("/api/builds/{id}/", get(get_build))
        .route("/api/builds/{id}/container/start/", post(start_container))
        .route("/api/builds/{id}/container/stop/", post(stop_container))
        .route("/api/builds/{id}/container/logs/", get(container_logs))
        .merge(proxy::routes())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

fn query_value<T: ToString>(value: Option<T>) -> Option<String> {
    value.map(|v| v.to_string())
}

// ── Repositories ──

async fn list_repositories(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ServiceResult<Json<Paginated<RepositoryJson>>> {
    let page = state.page(query.page, query.page_size);
    let mut conn = state.conn().await?;
    let (repositories, count) =
        repository_service::list_repositories(&mut conn, true, page.window()).await?;
    let results = repositories.into_iter().map(RepositoryJson::from).collect();
    Ok(Json(Paginated::new(results, count, page, "/api/repositories/", &[])))
}

async fn get_repository(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ServiceResult<Json<RepositoryJson>> {
    let mut conn = state.conn().await?;
    let repository = repository_service::get_repository(&mut conn, id).await?;
    Ok(Json(repository.into()))
}

async fn connect_repository(
    State(state): State<AppState>,
    Json(req): Json<ConnectRepositoryRequest>,
) -> ServiceResult<(StatusCode, Json<RepositoryJson>)> {
    let new_repository = req.into_new_repository()?;
    let mut conn = state.conn().await?;
    let repository = repository_service::connect_repository(&mut conn, new_repository).await?;
    Ok((StatusCode::CREATED, Json(repository.into())))
}

async fn refresh_repository(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ServiceResult<Json<Vec<BranchJson>>> {
    let mut conn = state.conn().await?;
    let repository = repository_service::get_repository(&mut conn, id).await?;
    let branches =
        repository_service::refresh_branches(&mut conn, &state.config, &repository).await?;
    let results = branches
        .into_iter()
        .map(|branch| BranchJson::from((branch, repository.name.clone())))
        .collect();
    Ok(Json(results))
}

// ── Branches ──

async fn list_branches(
    State(state): State<AppState>,
    Query(query): Query<BranchQuery>,
) -> ServiceResult<Json<Paginated<BranchJson>>> {
    let page = state.page(query.page, query.page_size);
    let mut conn = state.conn().await?;
    let (rows, count) =
        repository_service::list_branches(&mut conn, query.repository, page.window()).await?;
    let results = rows.into_iter().map(BranchJson::from).collect();
    let filters = [("repository", query_value(query.repository))];
    Ok(Json(Paginated::new(results, count, page, "/api/branches/", &filters)))
}

async fn get_branch(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ServiceResult<Json<BranchJson>> {
    let mut conn = state.conn().await?;
    let row = repository_service::get_branch(&mut conn, id).await?;
    Ok(Json(row.into()))
}

async fn refresh_branch(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<RefreshCommitsQuery>,
) -> ServiceResult<Json<RefreshCommitsResponse>> {
    let mut conn = state.conn().await?;
    let (branch, _) = repository_service::get_branch(&mut conn, id).await?;
    let repository = repository_service::get_repository(&mut conn, branch.repository_id).await?;
    let commits = repository_service::refresh_commits(
        &mut conn,
        &state.config,
        &repository,
        &branch,
        query.limit(),
    )
    .await?;
    Ok(Json(RefreshCommitsResponse {
        branch: branch.name,
        commits,
    }))
}

// ── Commits ──

async fn list_commits(
    State(state): State<AppState>,
    Query(query): Query<CommitQuery>,
) -> ServiceResult<Json<Paginated<CommitJson>>> {
    let page = state.page(query.page, query.page_size);
    let mut conn = state.conn().await?;
    let (rows, count) = repository_service::list_commits(
        &mut conn,
        query.repository,
        query.branch,
        page.window(),
    )
    .await?;
    let results = rows.into_iter().map(CommitJson::from).collect();
    let filters = [
        ("repository", query_value(query.repository)),
        ("branch", query_value(query.branch)),
    ];
    Ok(Json(Paginated::new(results, count, page, "/api/commits/", &filters)))
}

async fn get_commit(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ServiceResult<Json<CommitJson>> {
    let mut conn = state.conn().await?;
    let row = repository_service::get_commit(&mut conn, id).await?;
    Ok(Json(row.into()))
}

// ── Builds ──

async fn list_builds(
    State(state): State<AppState>,
    Query(query): Query<BuildQuery>,
) -> ServiceResult<Json<Paginated<BuildJson>>> {
    let page = state.page(query.page, query.page_size);
    let mut conn = state.conn().await?;
    let (rows, count) =
        build_service::list_builds(&mut conn, query.repository, query.status, page.window())
            .await?;
    let results = rows.into_iter().map(BuildJson::from).collect();
    let filters = [
        ("repository", query_value(query.repository)),
        ("status", query_value(query.status)),
    ];
    Ok(Json(Paginated::new(results, count, page, "/api/builds/", &filters)))
}

async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ServiceResult<Json<BuildJson>> {
    let mut conn = state.conn().await?;
    let row = build_service::get_build(&mut conn, id).await?;
    Ok(Json(row.into()))
}

async fn trigger_build(
    State(state): State<AppState>,
    Json(req): Json<TriggerRequest>,
) -> ServiceResult<(StatusCode, Json<BuildJson>)> {
    let mut conn = state.conn().await?;
    let build = build_service::create_build(&mut conn, req.into()).await?;
    state.runner.dispatch(build.id);

    let row = build_service::get_build(&mut conn, build.id).await?;
    Ok((StatusCode::CREATED, Json(row.into())))
}

async fn start_container(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<StartContainerQuery>,
) -> ServiceResult<Json<BuildJson>> {
    let mut conn = state.conn().await?;
    container_service::start(&mut conn, &state.config, id, query.host_port).await?;
    let row = build_service::get_build(&mut conn, id).await?;
    Ok(Json(row.into()))
}

async fn stop_container(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<StopContainerQuery>,
) -> ServiceResult<Json<BuildJson>> {
    let mut conn = state.conn().await?;
    container_service::stop(&mut conn, id, query.remove.unwrap_or(true)).await?;
    let row = build_service::get_build(&mut conn, id).await?;
    Ok(Json(row.into()))
}

async fn container_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<LogsQuery>,
) -> ServiceResult<Json<ContainerLogsJson>> {
    let mut conn = state.conn().await?;
    let logs = container_service::logs(
        &mut conn,
        id,
        Some(query.tail.unwrap_or(api::DEFAULT_LOG_TAIL)),
    )
    .await?;
    Ok(Json(logs.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::db::test_support::{insert_commit, insert_repository, test_db, unique};

    /// Router over a pool that never connects; only requests rejected
    /// before touching the database can be exercised.
    fn test_app() -> Router {
        let config = Arc::new(NohandsConfig::from_lookup(|_| None));
        let pool = crate::db::create_pool("postgres://nohands@127.0.0.1:1/nohands").unwrap();
        let state = AppState::new(pool, config).unwrap();
        app_router(state)
    }

    fn db_app(pool: DbPool) -> Router {
        let config = Arc::new(NohandsConfig::from_lookup(|_| None));
        app_router(AppState::new(pool, config).unwrap())
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = test_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_trigger_rejects_malformed_json() {
        let response = test_app()
            .oneshot(post_json("/api/builds/trigger/", "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_trigger_rejects_missing_fields() {
        let response = test_app()
            .oneshot(post_json("/api/builds/trigger/", r#"{"repository_id": 1}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_trigger_rejects_wrong_types() {
        let response = test_app()
            .oneshot(post_json(
                "/api/builds/trigger/",
                r#"{"repository_id": "one", "commit_id": 2}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_trigger_requires_json_content_type() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/builds/trigger/")
            .body(Body::from(r#"{"repository_id": 1, "commit_id": 2}"#))
            .unwrap();
        let response = test_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_connect_repository_rejects_blank_name() {
        let response = test_app()
            .oneshot(post_json(
                "/api/repositories/",
                r#"{"name": "  ", "url": "https://example.com/x.git"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Repository name is required");
    }

    #[tokio::test]
    async fn test_invalid_status_filter_is_rejected() {
        let request = Request::builder()
            .uri("/api/builds/?status=exploded")
            .body(Body::empty())
            .unwrap();
        let response = test_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_non_numeric_id_is_rejected() {
        let request = Request::builder()
            .uri("/api/builds/latest/")
            .body(Body::empty())
            .unwrap();
        let response = test_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_proxy_root_redirects_to_trailing_slash() {
        let request = Request::builder()
            .uri("/builds/3/fwd")
            .body(Body::empty())
            .unwrap();
        let response = test_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(response.headers()["location"], "/builds/3/fwd/");
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let request = Request::builder()
            .uri("/api/nothing/")
            .body(Body::empty())
            .unwrap();
        let response = test_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_trigger_unknown_repository_or_commit_is_not_found() {
        let Some(db) = test_db().await else { return };
        let mut conn = db.pool.get().await.unwrap();
        let repository = insert_repository(&mut conn, "https://example.com/trigger.git").await;
        let other = insert_repository(&mut conn, "https://example.com/other.git").await;
        let foreign = insert_commit(&mut conn, other.id).await;
        drop(conn);

        let body = format!(r#"{{"repository_id": {}, "commit_id": {}}}"#, i64::MAX, foreign.id);
        let response = db_app(db.pool.clone())
            .oneshot(post_json("/api/builds/trigger/", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"error": "Repository not found"})
        );

        let body = format!(r#"{{"repository_id": {}, "commit_id": {}}}"#, repository.id, foreign.id);
        let response = db_app(db.pool.clone())
            .oneshot(post_json("/api/builds/trigger/", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"error": "Commit not found"})
        );
    }

    #[tokio::test]
    async fn test_connect_repository_twice_conflicts() {
        let Some(db) = test_db().await else { return };
        let name = unique("web");
        let body = format!(r#"{{"name": "{name}", "url": "https://example.com/web.git"}}"#);

        let response = db_app(db.pool.clone())
            .oneshot(post_json("/api/repositories/", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_body(response).await["name"], name.as_str());

        let response = db_app(db.pool.clone())
            .oneshot(post_json("/api/repositories/", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            json_body(response).await["error"],
            format!("Repository with name '{name}' already exists")
        );
    }
}
