//! 🌐 ADMIN / HTTP SURFACE: task CRUD, token issuance, presence snapshot,
//! repo admin (component I, spec §4.I/§6.2).
//! AUDIT CHECKPOINT: middleware order and the auth/admin gates below decide
//! who gets to do what — review changes here as security changes.
//!
//! Mirrors the teacher's route-table-plus-`ServiceBuilder` shape in
//! `ApiServer`.

use crate::repo::{Repo, RepoStatus};
use crate::state::AppState;
use crate::task::{SubmitParams, Task, TaskFilter, TaskStatus};
use crate::validation::ContentValidator;
use crate::HubError;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

const SERVICE_NAME: &str = "agentcom-hub";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = match &self {
            HubError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            HubError::NotFound(_) => StatusCode::NOT_FOUND,
            HubError::Unauthorized => StatusCode::UNAUTHORIZED,
            HubError::Forbidden => StatusCode::FORBIDDEN,
            HubError::Conflict(_) | HubError::WrongState { .. } | HubError::StaleGeneration { .. } => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse { error: self.code().to_string() })).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let rate_limits = crate::rate_limit::RateLimitConfig::new();
    let auth_state = Arc::new(state.clone());

    let admin_routes = Router::new()
        .route("/admin/tokens", post(issue_token))
        .route("/admin/tokens/{agent_id}", delete(revoke_token))
        .route("/repos", post(upsert_repo))
        .route("/repos/{id}/status", post(set_repo_status))
        .layer(middleware::from_fn_with_state(auth_state.clone(), require_admin));

    let authenticated_routes = Router::new()
        .route("/tasks", post(create_task))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/retry", post(retry_task))
        .route("/agents", get(list_agents))
        .route("/repos", get(list_repos))
        .merge(admin_routes)
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    // 🏗️ DECISION: outer layer order is rate limit -> trace -> CORS, same
    // relative order as the teacher's `build_router` (rate limit -> auth ->
    // trace -> CORS). Per-route auth is applied closer to the routes
    // instead (`authenticated_routes`/`admin_routes` above) because unlike
    // the teacher's single shared API key, this hub has routes with three
    // distinct auth levels (none, per-agent token, admin token) that a
    // single blanket auth layer can't express.
    // Why rate limit goes first: an unauthenticated flood shouldn't reach
    // token verification at all, so the cheapest check runs first.
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(crate::protocol::ws_handler))
        .merge(authenticated_routes)
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn_with_state(rate_limits.clone(), crate::rate_limit::rate_limit_middleware))
                .layer(TraceLayer::new_for_http())
                // SECURITY DECISION: permissive CORS, unlike the teacher's
                // origin-allowlisted CorsLayer.
                // Why: every caller here is an agent process or operator
                // tool, never a browser page running third-party JS — the
                // thing origin-restricted CORS defends against (a
                // malicious web page making credentialed requests on a
                // victim's behalf) doesn't apply to a non-browser client.
                // Auth is the actual boundary (bearer token, checked below),
                // not Origin.
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// 🔑 AUTH GATE: resolves a bearer token to an agent id and stashes it as a
/// request extension; admin-only routes additionally check `is_admin` below.
/// SECURITY DECISION: reject on any missing/invalid token before touching
/// the route handler.
/// Why: a handler should never have to reason about whether `state.auth`
/// was actually checked — failing closed here means every route behind
/// this layer is authenticated by construction, not by each handler
/// remembering to check.
/// Alternative: per-handler auth checks (rejected: one handler that forgets
/// the check is a vulnerability; a single gate can't be skipped).
async fn require_auth(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    mut request: axum::extract::Request,
    next: middleware::Next,
) -> Response {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return HubError::Unauthorized.into_response();
    };
    let Some(agent_id) = state.auth.verify(token).await else {
        return HubError::Unauthorized.into_response();
    };

    request.extensions_mut().insert(AuthenticatedAgent(agent_id));
    next.run(request).await
}

/// 🔐 ADMIN GATE: runs after `require_auth`, so `AuthenticatedAgent` is
/// already present.
/// Why: distinct from `require_auth` rather than folded into it — most
/// routes need "some valid agent", only token issuance/revocation and repo
/// admin need "an *admin* agent", and stacking the two layers keeps that
/// distinction in the route table instead of an `if` inside every admin
/// handler.
async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
    next: middleware::Next,
) -> Response {
    match request.extensions().get::<AuthenticatedAgent>() {
        Some(AuthenticatedAgent(agent_id)) if state.auth.is_admin(agent_id) => next.run(request).await,
        Some(_) => HubError::Forbidden.into_response(),
        None => HubError::Unauthorized.into_response(),
    }
}

#[derive(Clone)]
struct AuthenticatedAgent(String);

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    description: String,
    priority: Option<crate::task::Priority>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    repo: String,
    #[serde(default)]
    needed_capabilities: std::collections::HashSet<String>,
    max_retries: Option<u32>,
    complete_by: Option<chrono::DateTime<chrono::Utc>>,
}

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), HubError> {
    let validator = ContentValidator::new()?;
    let description = validator.validate_description(&request.description)?;

    let task = state
        .queue
        .submit(SubmitParams {
            description,
            metadata: request.metadata,
            priority: request.priority,
            needed_capabilities: request.needed_capabilities,
            repo: request.repo,
            max_retries: request.max_retries,
            complete_by: request.complete_by,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
struct TaskListQuery {
    status: Option<TaskStatus>,
    priority: Option<crate::task::Priority>,
    repo: Option<String>,
}

async fn list_tasks(State(state): State<AppState>, Query(query): Query<TaskListQuery>) -> Json<Vec<Task>> {
    let filter = TaskFilter {
        status: query.status,
        priority: query.priority,
        repo: query.repo,
    };
    Json(state.queue.list(filter).await)
}

async fn get_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Result<Json<Task>, HubError> {
    Ok(Json(state.queue.get(&task_id).await?))
}

async fn retry_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Result<Json<Task>, HubError> {
    Ok(Json(state.queue.retry_dead_letter(&task_id).await?))
}

#[derive(Debug, Deserialize)]
struct IssueTokenRequest {
    agent_id: String,
}

#[derive(Debug, Serialize)]
struct IssueTokenResponse {
    agent_id: String,
    token: String,
}

async fn issue_token(
    State(state): State<AppState>,
    Json(request): Json<IssueTokenRequest>,
) -> Result<(StatusCode, Json<IssueTokenResponse>), HubError> {
    if request.agent_id.trim().is_empty() {
        return Err(HubError::Validation("agent_id must not be empty".into()));
    }
    let token = state.auth.issue(&request.agent_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(IssueTokenResponse {
            agent_id: request.agent_id,
            token,
        }),
    ))
}

async fn revoke_token(State(state): State<AppState>, Path(agent_id): Path<String>) -> Result<StatusCode, HubError> {
    if state.auth.revoke(&agent_id).await? {
        Ok(StatusCode::OK)
    } else {
        Err(HubError::NotFound(agent_id))
    }
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<crate::presence::PresenceEntry>> {
    Json(state.presence.list().await)
}

async fn list_repos(State(state): State<AppState>) -> Json<Vec<Repo>> {
    Json(state.repos.list().await)
}

#[derive(Debug, Deserialize)]
struct UpsertRepoRequest {
    id: String,
    url: String,
    name: String,
    #[serde(default)]
    priority_index: i64,
}

async fn upsert_repo(State(state): State<AppState>, Json(request): Json<UpsertRepoRequest>) -> Result<Json<Repo>, HubError> {
    let existing = state.repos.get(&request.id).await;
    let status = existing.map(|r| r.status).unwrap_or(RepoStatus::Active);
    let repo = state
        .repos
        .upsert(Repo {
            id: request.id,
            url: request.url,
            name: request.name,
            status,
            priority_index: request.priority_index,
        })
        .await?;
    Ok(Json(repo))
}

#[derive(Debug, Deserialize)]
struct SetRepoStatusRequest {
    status: RepoStatus,
}

async fn set_repo_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SetRepoStatusRequest>,
) -> Result<Json<Repo>, HubError> {
    let mut repo = state.repos.get(&id).await.ok_or_else(|| HubError::NotFound(id.clone()))?;
    repo.status = request.status;
    Ok(Json(state.repos.upsert(repo).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::Request;
    use std::net::SocketAddr;
    use tower::ServiceExt;

    fn test_peer() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    struct NoopSink;

    #[async_trait::async_trait]
    impl crate::presence::TimeoutSink for NoopSink {
        async fn on_agent_timeout(&self, _agent_id: &str) {}
    }

    async fn test_state() -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::store::DurableStore::open(dir.path()).unwrap();
        let bus = crate::bus::spawn();
        let queue = crate::queue::spawn(&store, bus.clone(), 50, 3, 30_000).unwrap();
        let repos = crate::repo::spawn(&store).unwrap();
        let auth = crate::auth::spawn(&store, ["admin-1".to_string()].into_iter().collect()).unwrap();
        let presence = crate::presence::spawn(bus.clone(), 90_000, std::sync::Arc::new(NoopSink));
        let fsm_registry =
            crate::agent::registry::AgentFsmRegistry::new(std::time::Duration::from_secs(60), queue.clone(), bus.clone());
        let config = Arc::new(crate::config::Config {
            listen_addr: "127.0.0.1:0".to_string(),
            data_dir: dir.path().to_path_buf(),
            admin_agents: ["admin-1".to_string()].into_iter().collect(),
            heartbeat_timeout_ms: 90_000,
            acceptance_timeout_ms: 60_000,
            default_deadline_ms: 1_800_000,
            reclaim_sweep_ms: 30_000,
            scheduler_tick_ms: 1_000,
            history_cap: 50,
            validation_failure_threshold: 10,
        });
        AppState {
            queue,
            presence,
            auth,
            fsm_registry,
            bus,
            repos,
            abuse: Arc::new(crate::protocol::abuse::AbuseTracker::new()),
            config,
            connections: Default::default(),
        }
    }

    #[tokio::test]
    async fn health_requires_no_auth() {
        let app = router(test_state().await);
        let mut request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        request.extensions_mut().insert(ConnectInfo(test_peer()));
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn tasks_without_bearer_token_is_unauthorized() {
        let app = router(test_state().await);
        let mut request = Request::builder().uri("/tasks").body(Body::empty()).unwrap();
        request.extensions_mut().insert(ConnectInfo(test_peer()));
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_route_rejects_non_admin_token() {
        let state = test_state().await;
        let token = state.auth.issue("worker-1").await.unwrap();
        let app = router(state);
        let mut request = Request::builder()
            .method("POST")
            .uri("/admin/tokens")
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"agent_id":"worker-2"}"#))
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(test_peer()));
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
