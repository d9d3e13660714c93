//! Client side of the sync protocol: full uploads and incremental updates.
//!
//! The wire calls live behind [`AgentApi`] so the retry and recovery policy
//! in [`UploadTransport`] does not depend on HTTP. A full upload is retried
//! with a fixed backoff from a staged archive. An update rejected because
//! the agent forgot the workspace triggers exactly one full upload and one
//! retry of the same update.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::models::{ChangeKind, ChangeRecord, Workspace};
use crate::sync::archive::stage_archive;
use crate::sync::ignore::IgnoreProvider;
use crate::sync::watcher::ChangeSink;
use crate::{AppError, Result};

/// Boxed future returned by [`AgentApi`] methods.
pub type ApiFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Status the agent reports for a successful full upload.
pub const STATUS_CREATED: &str = "created";
/// Status the agent reports for a successful update.
pub const STATUS_UPDATED: &str = "updated";
/// Status the agent reports for a successful removal.
pub const STATUS_REMOVED: &str = "removed";
/// Status the agent reports for any failure.
pub const STATUS_FAILED: &str = "failed";

/// Calls the remote agent exposes.
pub trait AgentApi: Send + Sync {
    /// Send a full workspace archive.
    fn upload<'a>(&'a self, workspace: &'a Workspace, archive: Vec<u8>) -> ApiFuture<'a>;

    /// Send one change. `contents` carries file bytes for file
    /// creates and updates.
    fn update<'a>(
        &'a self,
        workspace: &'a Workspace,
        change: &'a ChangeRecord,
        contents: Option<Bytes>,
    ) -> ApiFuture<'a>;

    /// Ask the agent to stop and forget a workspace.
    fn remove<'a>(&'a self, workspace: &'a Workspace) -> ApiFuture<'a>;

    /// Liveness probe against an agent address.
    fn health<'a>(&'a self, address: &'a str) -> ApiFuture<'a>;
}

/// JSON body of every agent response.
#[derive(Debug, Deserialize)]
pub struct AgentResponse {
    /// `created`, `updated`, `removed` or `failed`.
    pub status: String,
    /// Failure description when `status` is `failed`.
    #[serde(default)]
    pub error: Option<String>,
}

/// [`AgentApi`] over HTTP multipart requests.
#[derive(Debug, Clone, Default)]
pub struct HttpAgentApi {
    client: reqwest::Client,
}

impl HttpAgentApi {
    /// Create an API client with a default `reqwest` client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn command_form(workspace: &Workspace) -> Result<Form> {
        let form = workspace
            .commands
            .fields()
            .into_iter()
            .fold(Form::new().text("id", workspace.id.clone()), |form, (name, value)| {
                form.text(name, value.to_owned())
            });
        if workspace.env.is_empty() {
            return Ok(form);
        }
        Ok(form.text("env", serde_json::to_string(&workspace.env)?))
    }

    async fn expect_status(
        workspace_id: &str,
        request: reqwest::RequestBuilder,
        expected: &str,
    ) -> Result<()> {
        let transport = |err: reqwest::Error| AppError::Transport {
            workspace_id: workspace_id.to_owned(),
            message: err.to_string(),
        };
        let response = request.send().await.map_err(transport)?;
        let http_status = response.status();
        let body = response.bytes().await.map_err(transport)?;

        let Ok(parsed) = serde_json::from_slice::<AgentResponse>(&body) else {
            return Err(AppError::Rejected {
                workspace_id: workspace_id.to_owned(),
                status: http_status.to_string(),
                message: String::from_utf8_lossy(&body).trim().to_owned(),
            });
        };
        if parsed.status == expected {
            Ok(())
        } else {
            Err(AppError::Rejected {
                workspace_id: workspace_id.to_owned(),
                status: parsed.status,
                message: parsed.error.unwrap_or_default(),
            })
        }
    }
}

impl AgentApi for HttpAgentApi {
    fn upload<'a>(&'a self, workspace: &'a Workspace, archive: Vec<u8>) -> ApiFuture<'a> {
        Box::pin(async move {
            let mut form = Self::command_form(workspace)?
                .part("file", Part::bytes(archive).file_name("upload.tar.gz"));
            if let Some(path) = workspace.path_field() {
                form = form.text("path", path);
            }
            let request = self
                .client
                .post(format!("{}/", workspace.base_url()))
                .multipart(form);
            Self::expect_status(&workspace.id, request, STATUS_CREATED).await
        })
    }

    fn update<'a>(
        &'a self,
        workspace: &'a Workspace,
        change: &'a ChangeRecord,
        contents: Option<Bytes>,
    ) -> ApiFuture<'a> {
        Box::pin(async move {
            let mut form = Self::command_form(workspace)?
                .text("type", change.kind.as_str())
                .text("path", change.wire_path());
            if change.kind != ChangeKind::Delete {
                form = form
                    .text("mode", change.mode.to_string())
                    .text("pathtype", if change.is_dir { "dir" } else { "file" });
                if let Some(contents) = contents {
                    form = form.part(
                        "file",
                        Part::bytes(contents.to_vec()).file_name("upload"),
                    );
                }
            }
            let request = self
                .client
                .put(format!("{}/", workspace.base_url()))
                .multipart(form);
            Self::expect_status(&workspace.id, request, STATUS_UPDATED).await
        })
    }

    fn remove<'a>(&'a self, workspace: &'a Workspace) -> ApiFuture<'a> {
        Box::pin(async move {
            let request = self
                .client
                .delete(format!("{}/?id={}", workspace.base_url(), workspace.id));
            Self::expect_status(&workspace.id, request, STATUS_REMOVED).await
        })
    }

    fn health<'a>(&'a self, address: &'a str) -> ApiFuture<'a> {
        Box::pin(async move {
            let base = if address.starts_with("http://") || address.starts_with("https://") {
                address.trim_end_matches('/').to_owned()
            } else {
                format!("http://{}", address.trim_end_matches('/'))
            };
            let transport = |err: reqwest::Error| AppError::Transport {
                workspace_id: String::new(),
                message: err.to_string(),
            };
            let response = self
                .client
                .get(format!("{base}/healthz"))
                .send()
                .await
                .map_err(transport)?;
            let status = response.status();
            let body = response.text().await.map_err(transport)?;
            if status.is_success() && body.trim() == "ok" {
                Ok(())
            } else {
                Err(AppError::Rejected {
                    workspace_id: String::new(),
                    status: status.to_string(),
                    message: body,
                })
            }
        })
    }
}

/// Upload and update policy on top of an [`AgentApi`].
pub struct UploadTransport {
    api: Arc<dyn AgentApi>,
    ignore: Arc<dyn IgnoreProvider>,
    attempts: u32,
    backoff: Duration,
}

impl UploadTransport {
    /// Transport using the retry settings of `config`.
    #[must_use]
    pub fn new(
        api: Arc<dyn AgentApi>,
        ignore: Arc<dyn IgnoreProvider>,
        config: &ClientConfig,
    ) -> Self {
        Self::with_policy(api, ignore, config.upload_attempts, config.upload_backoff())
    }

    /// Transport with explicit retry settings.
    #[must_use]
    pub fn with_policy(
        api: Arc<dyn AgentApi>,
        ignore: Arc<dyn IgnoreProvider>,
        attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            api,
            ignore,
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Underlying API client.
    #[must_use]
    pub fn api(&self) -> &Arc<dyn AgentApi> {
        &self.api
    }

    /// Archive the workspace and send it, retrying on any failure.
    ///
    /// # Errors
    ///
    /// Returns the last failure once every attempt is used up, or
    /// `AppError::Io`/`AppError::Watch` if the archive cannot be staged.
    pub async fn upload(&self, workspace: &Workspace) -> Result<()> {
        let ignores = self.ignore.load(&workspace.local_path)?;
        let root = workspace.local_path.clone();
        let staged = tokio::task::spawn_blocking(move || stage_archive(&root, &ignores))
            .await
            .map_err(|err| AppError::Io(format!("archive task failed: {err}")))??;
        let mut staged = tokio::fs::File::from_std(staged);

        let mut last_error = None;
        for attempt in 1..=self.attempts {
            staged.seek(std::io::SeekFrom::Start(0)).await?;
            let mut archive = Vec::new();
            staged.read_to_end(&mut archive).await?;

            match self.api.upload(workspace, archive).await {
                Ok(()) => {
                    info!(workspace_id = %workspace.id, attempt, "workspace uploaded");
                    return Ok(());
                }
                Err(err) => {
                    debug!(workspace_id = %workspace.id, attempt, %err, "upload attempt failed");
                    last_error = Some(err);
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.backoff).await;
            }
        }

        let err = last_error.unwrap_or_else(|| AppError::Transport {
            workspace_id: workspace.id.clone(),
            message: "upload never attempted".into(),
        });
        warn!(workspace_id = %workspace.id, %err, "upload gave up");
        Err(err)
    }

    /// Send one change, recovering once if the agent lost the workspace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Vanished` if the local file is gone,
    /// `AppError::Rejected`/`AppError::Transport` on agent failures.
    pub async fn update(&self, workspace: &Workspace, change: &ChangeRecord) -> Result<()> {
        let contents = read_contents(workspace, change).await?;
        match self.api.update(workspace, change, contents.clone()).await {
            Err(err) if err.is_invalid_workspace() => {
                info!(workspace_id = %workspace.id, "agent lost workspace, re-uploading");
                self.upload(workspace).await?;
                self.api.update(workspace, change, contents).await
            }
            other => other,
        }
    }

    /// Ask the agent to drop the workspace.
    ///
    /// # Errors
    ///
    /// Returns the agent or network failure.
    pub async fn remove(&self, workspace: &Workspace) -> Result<()> {
        self.api.remove(workspace).await
    }
}

async fn read_contents(workspace: &Workspace, change: &ChangeRecord) -> Result<Option<Bytes>> {
    if change.kind == ChangeKind::Delete || change.is_dir {
        return Ok(None);
    }
    let path = workspace.local_path.join(&change.path);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Some(Bytes::from(bytes))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(AppError::Vanished(path.display().to_string()))
        }
        Err(err) => Err(AppError::Io(format!(
            "failed to read {}: {err}",
            path.display()
        ))),
    }
}

/// [`ChangeSink`] forwarding a workspace's changes through a transport.
pub struct TransportSink {
    transport: Arc<UploadTransport>,
    workspace: Workspace,
}

impl TransportSink {
    /// Sink for `workspace`.
    #[must_use]
    pub fn new(transport: Arc<UploadTransport>, workspace: Workspace) -> Self {
        Self {
            transport,
            workspace,
        }
    }
}

impl ChangeSink for TransportSink {
    fn deliver<'a>(
        &'a self,
        change: &'a ChangeRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.transport.update(&self.workspace, change))
    }
}
