//! HTTP routes of the agent.
//!
//! | Method | Path | Purpose |
//! |---|---|---|
//! | `POST` | `/` | full upload |
//! | `PUT` | `/` | incremental update |
//! | `DELETE` | `/?id=` | remove workspace |
//! | `GET` | `/healthz` | liveness |

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::apply::{apply_change, install_upload, resolve_root, FileChange};
use super::AgentState;
use crate::errors::INVALID_WORKSPACE_ID;
use crate::models::{ChangeKind, CommandSet};
use crate::orchestrator::{ProcessOrchestrator, RestartOutcome, RestartRequest};
use crate::sync::transport::{STATUS_CREATED, STATUS_FAILED, STATUS_REMOVED, STATUS_UPDATED};
use crate::{AppError, Result};

/// Largest accepted request body (archives included).
const MAX_BODY_BYTES: usize = 1024 * 1024 * 1024;

/// JSON body returned by the sync routes.
#[derive(Debug, Serialize)]
struct Reply {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

type RouteResult = std::result::Result<Json<Reply>, (StatusCode, Json<Reply>)>;

fn reply(status: &'static str) -> Json<Reply> {
    Json(Reply {
        status,
        error: None,
    })
}

fn failed(err: &AppError) -> (StatusCode, Json<Reply>) {
    let (code, message) = match err {
        AppError::NotFound(_) => (StatusCode::BAD_REQUEST, INVALID_WORKSPACE_ID.to_owned()),
        AppError::Protocol(msg) | AppError::PathViolation(msg) => {
            (StatusCode::BAD_REQUEST, msg.clone())
        }
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    };
    (
        code,
        Json(Reply {
            status: STATUS_FAILED,
            error: Some(message),
        }),
    )
}

/// Build the agent router over `state`.
pub fn router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/", get(index).post(upload).put(update).delete(remove))
        .route("/healthz", get(health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Serve the agent router on `listener` until `ct` fires.
///
/// # Errors
///
/// Returns `AppError::Io` if the server fails.
pub async fn serve_http(
    listener: TcpListener,
    state: Arc<AgentState>,
    ct: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "agent http listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("http server error: {err}")))?;
    info!("agent http shut down");
    Ok(())
}

/// Handler for `GET /healthz`.
async fn health() -> &'static str {
    "ok"
}

/// Handler for `GET /`.
async fn index() -> String {
    format!("tether agent v{}", env!("CARGO_PKG_VERSION"))
}

/// Multipart fields of an upload or update.
#[derive(Debug, Default)]
struct SyncForm {
    fields: HashMap<String, String>,
    file: Option<Bytes>,
}

impl SyncForm {
    async fn read(mut multipart: Multipart) -> Result<Self> {
        let mut form = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| AppError::Protocol(format!("invalid multipart body: {err}")))?
        {
            let name = field.name().unwrap_or_default().to_owned();
            let data = field
                .bytes()
                .await
                .map_err(|err| AppError::Protocol(format!("invalid field `{name}`: {err}")))?;
            if name == "file" {
                form.file = Some(data);
            } else {
                form.fields
                    .insert(name, String::from_utf8_lossy(&data).into_owned());
            }
        }
        Ok(form)
    }

    fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    fn commands(&self) -> CommandSet {
        let get = |name: &str| self.text(name).unwrap_or_default().to_owned();
        CommandSet::new(get("init"), get("build"), get("test"), get("start"))
    }

    fn env(&self) -> Result<BTreeMap<String, String>> {
        self.text("env").map_or_else(
            || Ok(BTreeMap::new()),
            |raw| {
                serde_json::from_str(raw)
                    .map_err(|err| AppError::Protocol(format!("invalid env field: {err}")))
            },
        )
    }
}

/// Handler for `POST /`: replace a workspace with an uploaded archive.
async fn upload(State(state): State<Arc<AgentState>>, multipart: Multipart) -> RouteResult {
    let form = SyncForm::read(multipart).await.map_err(|err| failed(&err))?;
    handle_upload(&state, form).await.map_err(|err| {
        warn!(%err, "upload failed");
        failed(&err)
    })?;
    Ok(reply(STATUS_CREATED))
}

async fn handle_upload(state: &AgentState, form: SyncForm) -> Result<()> {
    let id = form
        .text("id")
        .ok_or_else(|| AppError::Protocol("missing form fields".into()))?
        .to_owned();
    let env = form.env()?;
    let root = resolve_root(
        &state.config.workspace_dir,
        &state.home,
        &id,
        form.text("path"),
    )?;
    info!(workspace_id = %id, root = %root.display(), "creating workspace");

    // ── Replace any previous workspace with this id ──
    if let Some(previous) = state.registry.remove(&id).await {
        if let Err(err) = previous.stop().await {
            warn!(workspace_id = %id, %err, "previous workspace not fully stopped");
        }
    }

    let commands = form.commands();
    let archive = form.file;
    let install_root = root.clone();
    tokio::task::spawn_blocking(move || install_upload(&install_root, archive.as_deref()))
        .await
        .map_err(|err| AppError::Io(format!("install task failed: {err}")))??;

    let orchestrator = Arc::new(ProcessOrchestrator::new(
        id.clone(),
        root,
        state.config.bootstrap_dir.clone(),
        state.relay.clone(),
        Arc::clone(&state.inspector),
    ));
    state.registry.insert(Arc::clone(&orchestrator)).await;

    let token = orchestrator
        .restart(RestartRequest {
            init_reset: true,
            reset: true,
            commands,
            env,
        })
        .await?;
    log_outcome(&id, token.await);
    Ok(())
}

/// Handler for `PUT /`: apply one change and restart the pipeline.
async fn update(State(state): State<Arc<AgentState>>, multipart: Multipart) -> RouteResult {
    let form = SyncForm::read(multipart).await.map_err(|err| failed(&err))?;
    handle_update(&state, form).await.map_err(|err| {
        warn!(%err, "update failed");
        failed(&err)
    })?;
    Ok(reply(STATUS_UPDATED))
}

async fn handle_update(state: &AgentState, mut form: SyncForm) -> Result<()> {
    let id = form.text("id").unwrap_or_default().to_owned();
    let orchestrator = state
        .registry
        .get(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("workspace `{id}`")))?;

    let (Some(kind), Some(path)) = (form.text("type"), form.text("path")) else {
        return Err(AppError::Protocol("missing form fields".into()));
    };
    let kind = ChangeKind::parse(kind)
        .ok_or_else(|| AppError::Protocol(format!("invalid change type `{kind}`")))?;
    let mode = form
        .text("mode")
        .map(|raw| {
            raw.parse::<u32>()
                .map_err(|err| AppError::Protocol(format!("invalid mode `{raw}`: {err}")))
        })
        .transpose()?;
    let change = FileChange {
        kind,
        path: path.to_owned(),
        is_dir: form.text("pathtype") == Some("dir"),
        mode,
        contents: form.file.take(),
    };
    let env = form.env()?;
    let commands = form.commands();

    let root = orchestrator.root().to_path_buf();
    let applied = tokio::task::spawn_blocking(move || apply_change(&root, &change))
        .await
        .map_err(|err| AppError::Io(format!("apply task failed: {err}")))??;
    info!(workspace_id = %id, path = %applied.display(), kind = kind.as_str(), "change applied");

    let token = orchestrator
        .restart(RestartRequest {
            init_reset: false,
            reset: true,
            commands,
            env,
        })
        .await?;
    log_outcome(&id, token.await);
    Ok(())
}

/// Handler for `DELETE /?id=`: stop and forget a workspace.
async fn remove(
    State(state): State<Arc<AgentState>>,
    Query(params): Query<HashMap<String, String>>,
) -> RouteResult {
    let id = params.get("id").cloned().unwrap_or_default();
    if let Some(orchestrator) = state.registry.remove(&id).await {
        orchestrator.stop().await.map_err(|err| failed(&err))?;
        info!(workspace_id = %id, "workspace removed");
    }
    Ok(reply(STATUS_REMOVED))
}

fn log_outcome(id: &str, outcome: RestartOutcome) {
    match outcome {
        RestartOutcome::Started => info!(workspace_id = %id, "pipeline started"),
        RestartOutcome::BuildFailed(reason) => {
            warn!(workspace_id = %id, %reason, "build failed");
        }
        RestartOutcome::Abandoned => warn!(workspace_id = %id, "restart abandoned"),
    }
}
