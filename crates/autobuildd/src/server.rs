//! HTTP request surface.
//!
//! A thin axum adapter over the typed core operations: one route per
//! operation, every response wrapped in the `{ok, value}` / `{error,
//! message}` envelope, plus the append-only event stream as SSE on
//! `/events`. Bound to localhost only; the frontend is the only intended
//! caller.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use autobuild_core::envfile::EnvConfig;
use autobuild_core::error::{CoreError, CoreResult};
use autobuild_core::types::{Id, ProjectSettings, TerminalConfig};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::forge::ForgeClient;
use crate::layout;
use crate::orchestrator::{Orchestrator, StartOptions, TaskPatch};
use crate::registry::Registry;
use crate::termbridge::TerminalBridge;
use crate::updater::FrameworkUpdater;
use crate::{bus::EventBus, installer};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub registry: Arc<Registry>,
    pub orchestrator: Arc<Orchestrator>,
    pub terminals: Arc<TerminalBridge>,
    pub updater: Arc<FrameworkUpdater>,
    pub forge: ForgeClient,
    pub bus: EventBus,
}

/// Response envelope: exactly one of `value` or `error` is present.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn respond<T: Serialize>(result: CoreResult<T>) -> impl IntoResponse {
    match result {
        Ok(value) => (
            StatusCode::OK,
            Json(Envelope {
                ok: true,
                value: Some(value),
                error: None,
            }),
        ),
        Err(e) => {
            let status = match &e {
                CoreError::NotFound(_) => StatusCode::NOT_FOUND,
                CoreError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(Envelope {
                    ok: false,
                    value: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

/// Build the router with every operation mounted.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", get(stream_events))
        // Projects
        .route("/projects", post(project_add).get(project_list))
        .route("/projects/{id}", delete(project_remove))
        .route("/projects/{id}/settings", put(project_settings))
        .route("/projects/{id}/framework/install", post(framework_install))
        .route("/projects/{id}/framework/update", post(framework_update))
        .route(
            "/projects/{id}/framework/update-available",
            get(framework_update_available),
        )
        .route("/projects/{id}/tasks", get(task_list))
        .route("/projects/{id}/roadmap", post(roadmap_run))
        .route("/projects/{id}/ideation", post(ideation_run))
        .route("/projects/{id}/forge/issues", get(forge_issues))
        .route("/projects/{id}/tracker/issues", get(tracker_issues))
        // Tasks
        .route("/tasks", post(task_create))
        .route("/tasks/{id}", patch(task_update).delete(task_delete))
        .route("/tasks/{id}/start", post(task_start))
        .route("/tasks/{id}/stop", post(task_stop))
        .route("/tasks/{id}/review", post(task_review))
        .route("/tasks/{id}/worktree", get(worktree_status))
        .route("/tasks/{id}/worktree/diff", get(worktree_diff))
        .route("/tasks/{id}/worktree/merge-preview", get(merge_preview))
        .route("/tasks/{id}/worktree/merge", post(merge))
        .route("/tasks/{id}/worktree/discard", post(worktree_discard))
        // Terminals
        .route("/terminals", post(terminal_create).get(terminal_list))
        .route("/terminals/{id}/write", post(terminal_write))
        .route("/terminals/{id}/resize", post(terminal_resize))
        .route("/terminals/{id}/kill", post(terminal_kill))
        .route("/terminals/{id}/buffer", get(terminal_buffer))
        .route("/terminals/{id}/claude-mode", post(terminal_claude_mode))
        // Framework updates
        .route("/framework/check", post(framework_check))
        .route("/framework/download", post(framework_download))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on localhost until the process exits.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("request surface listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// SSE event stream. A subscriber that lags is told how many events it
/// missed instead of silently losing them.
async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.bus.subscribe();
    let stream = stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(event) => {
                let sse = SseEvent::default()
                    .event(event.kind())
                    .data(event.to_json().unwrap_or_else(|_| "{}".to_string()));
                Some((Ok(sse), rx))
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                let sse = SseEvent::default()
                    .event("stream.lagged")
                    .data(serde_json::json!({ "missed": missed }).to_string());
                Some((Ok(sse), rx))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// --- Projects ---

#[derive(Debug, Deserialize)]
struct AddProjectRequest {
    name: String,
    path: String,
}

async fn project_add(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddProjectRequest>,
) -> impl IntoResponse {
    let result = state
        .registry
        .add(&req.name, std::path::Path::new(&req.path))
        .await
        .map_err(|e| match e {
            crate::registry::RegistryError::DuplicatePath(p) => {
                CoreError::InvalidRequest(format!("project already registered at {p}"))
            }
            crate::registry::RegistryError::NotADirectory(p) => {
                CoreError::InvalidRequest(format!("not a directory: {p}"))
            }
            other => CoreError::External(other.to_string()),
        });
    respond(result)
}

async fn project_list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    respond(Ok(state.registry.list().await))
}

async fn project_remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = state
        .registry
        .remove(&Id::from_string(&id))
        .await
        .map_err(|e| CoreError::NotFound(e.to_string()));
    respond(result)
}

async fn project_settings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(settings): Json<ProjectSettings>,
) -> impl IntoResponse {
    if settings.max_workers < 1 {
        return respond::<autobuild_core::types::Project>(Err(CoreError::InvalidRequest(
            "maxWorkers must be at least 1".to_string(),
        )));
    }
    let result = state
        .registry
        .update_settings(&Id::from_string(&id), settings)
        .await
        .map_err(|e| CoreError::NotFound(e.to_string()));
    respond(result)
}

async fn framework_install(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = install_framework(&state, &id, false).await;
    respond(result)
}

async fn framework_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = install_framework(&state, &id, true).await;
    respond(result)
}

async fn install_framework(
    state: &Arc<AppState>,
    project_id: &str,
    is_update: bool,
) -> CoreResult<String> {
    let project = state
        .registry
        .get(&Id::from_string(project_id))
        .await
        .map_err(|e| CoreError::NotFound(e.to_string()))?;
    let source = state.updater.source_dir().to_path_buf();
    let project_dir = std::path::PathBuf::from(&project.path);
    let result = if is_update {
        installer::update(&project_dir, &source)
    } else {
        installer::install(&project_dir, &source)
    };
    let dest = result.map_err(|e| CoreError::External(e.to_string()))?;
    let framework_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    state
        .registry
        .set_framework_dir(&project.id, &framework_name)
        .await
        .map_err(|e| CoreError::External(e.to_string()))?;
    Ok(framework_name)
}

async fn framework_update_available(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = async {
        let project = state
            .registry
            .get(&Id::from_string(&id))
            .await
            .map_err(|e| CoreError::NotFound(e.to_string()))?;
        let framework = layout::find_framework_dir(std::path::Path::new(&project.path))
            .ok_or_else(|| {
                CoreError::InvalidRequest(format!("framework not installed in {}", project.path))
            })?;
        installer::bundled_update_available(&framework, state.updater.source_dir())
            .map_err(|e| CoreError::External(e.to_string()))
    }
    .await;
    respond(result)
}

// --- Tasks ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest {
    project_id: String,
    title: String,
    description: String,
}

async fn task_create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> impl IntoResponse {
    let result = state
        .orchestrator
        .task_create(&Id::from_string(&req.project_id), &req.title, &req.description)
        .await;
    respond(result)
}

async fn task_list(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.orchestrator.task_list(&Id::from_string(&id)).await)
}

async fn task_start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(options): Json<StartOptions>,
) -> impl IntoResponse {
    respond(
        state
            .orchestrator
            .task_start(&Id::from_string(&id), options)
            .await,
    )
}

async fn task_stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.orchestrator.task_stop(&Id::from_string(&id)).await)
}

#[derive(Debug, Deserialize)]
struct ReviewRequest {
    approved: bool,
    #[serde(default)]
    feedback: Option<String>,
}

async fn task_review(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ReviewRequest>,
) -> impl IntoResponse {
    respond(
        state
            .orchestrator
            .task_review(&Id::from_string(&id), req.approved, req.feedback.as_deref())
            .await,
    )
}

async fn task_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch_body): Json<TaskPatch>,
) -> impl IntoResponse {
    respond(
        state
            .orchestrator
            .task_update(&Id::from_string(&id), patch_body)
            .await,
    )
}

async fn task_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.orchestrator.task_delete(&Id::from_string(&id)).await)
}

// --- Worktrees ---

async fn worktree_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.orchestrator.worktree_status(&Id::from_string(&id)).await)
}

async fn worktree_diff(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.orchestrator.worktree_diff(&Id::from_string(&id)).await)
}

async fn merge_preview(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.orchestrator.merge_preview(&Id::from_string(&id)).await)
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct MergeRequest {
    stage_only: bool,
}

async fn merge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<MergeRequest>,
) -> impl IntoResponse {
    respond(
        state
            .orchestrator
            .merge_with_agent(&Id::from_string(&id), req.stage_only)
            .await,
    )
}

async fn worktree_discard(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.orchestrator.worktree_discard(&Id::from_string(&id)).await)
}

// --- Project-level agent runs ---

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RoadmapRequest {
    refresh: bool,
}

async fn roadmap_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RoadmapRequest>,
) -> impl IntoResponse {
    respond(
        state
            .orchestrator
            .roadmap_run(&Id::from_string(&id), req.refresh)
            .await,
    )
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct IdeationRequest {
    categories: Vec<String>,
    include_context: bool,
    max_ideas_per_category: Option<u32>,
    refresh: bool,
}

async fn ideation_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<IdeationRequest>,
) -> impl IntoResponse {
    respond(
        state
            .orchestrator
            .ideation_run(
                &Id::from_string(&id),
                req.categories,
                req.include_context,
                req.max_ideas_per_category,
                req.refresh,
            )
            .await,
    )
}

// --- External APIs ---

async fn project_env(state: &Arc<AppState>, project_id: &str) -> CoreResult<EnvConfig> {
    let project = state
        .registry
        .get(&Id::from_string(project_id))
        .await
        .map_err(|e| CoreError::NotFound(e.to_string()))?;
    let framework = layout::find_framework_dir(std::path::Path::new(&project.path))
        .ok_or_else(|| {
            CoreError::InvalidRequest(format!("framework not installed in {}", project.path))
        })?;
    EnvConfig::load(&layout::env_path(&framework))
        .map_err(|e| CoreError::ArtifactParse(e.to_string()))
}

async fn forge_issues(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = async {
        let env = project_env(&state, &id).await?;
        let token = env.github_token.ok_or_else(|| {
            CoreError::InvalidRequest("GITHUB_TOKEN is not configured".to_string())
        })?;
        let repo = env.github_repo.ok_or_else(|| {
            CoreError::InvalidRequest("GITHUB_REPO is not configured".to_string())
        })?;
        state
            .forge
            .list_issues(&token, &repo)
            .await
            .map_err(|e| CoreError::External(e.to_string()))
    }
    .await;
    respond(result)
}

async fn tracker_issues(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = async {
        let env = project_env(&state, &id).await?;
        let api_key = env.linear_api_key.ok_or_else(|| {
            CoreError::InvalidRequest("LINEAR_API_KEY is not configured".to_string())
        })?;
        state
            .forge
            .tracker_issues(&api_key)
            .await
            .map_err(|e| CoreError::External(e.to_string()))
    }
    .await;
    respond(result)
}

// --- Terminals ---

async fn terminal_create(
    State(state): State<Arc<AppState>>,
    Json(config): Json<TerminalConfig>,
) -> impl IntoResponse {
    respond(state.terminals.create(config).await)
}

async fn terminal_list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    respond(state.terminals.list().await)
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    data: String,
}

async fn terminal_write(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<WriteRequest>,
) -> impl IntoResponse {
    respond(
        state
            .terminals
            .write(&Id::from_string(&id), &req.data)
            .await,
    )
}

#[derive(Debug, Deserialize)]
struct ResizeRequest {
    cols: u16,
    rows: u16,
}

async fn terminal_resize(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> impl IntoResponse {
    respond(
        state
            .terminals
            .resize(&Id::from_string(&id), req.cols, req.rows)
            .await,
    )
}

async fn terminal_kill(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.terminals.kill(&Id::from_string(&id)).await)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BufferResponse {
    buffer: String,
    is_dead: bool,
}

async fn terminal_buffer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = state
        .terminals
        .get_buffer(&Id::from_string(&id))
        .await
        .map(|(buffer, is_dead)| BufferResponse { buffer, is_dead });
    respond(result)
}

async fn terminal_claude_mode(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.terminals.enable_claude_mode(&Id::from_string(&id)).await)
}

// --- Framework updates ---

async fn framework_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let bundled = state.updater.source_dir().to_path_buf();
    respond(
        state
            .updater
            .check(&bundled)
            .await
            .map_err(|e| CoreError::External(e.to_string())),
    )
}

async fn framework_download(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    respond(
        state
            .updater
            .download()
            .await
            .map_err(|e| CoreError::External(e.to_string())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_exactly_one_side() {
        let ok = Envelope {
            ok: true,
            value: Some(42),
            error: None,
        };
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["value"], 42);
        assert!(json.get("error").is_none());

        let err: Envelope<i32> = Envelope {
            ok: false,
            value: None,
            error: Some("nope".to_string()),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "nope");
        assert!(json.get("value").is_none());
    }
}
