//! Contract tests for the agent HTTP surface.
//!
//! Each test runs the real router on an ephemeral port and talks to it
//! through the client API or raw `reqwest` requests.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::Form;
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use tether::agent::{serve_http, AgentState};
use tether::config::AgentConfig;
use tether::errors::INVALID_WORKSPACE_ID;
use tether::models::{ChangeKind, ChangeRecord, CommandSet, Workspace};
use tether::process::default_inspector;
use tether::relay::Relay;
use tether::sync::{AgentApi, HttpAgentApi, NoIgnore, UploadTransport};

struct Agent {
    addr: String,
    state: Arc<AgentState>,
    workspaces: PathBuf,
    ct: CancellationToken,
    _dir: TempDir,
}

impl Agent {
    async fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspaces = dir.path().join("workspaces");
        let config = AgentConfig {
            http_port: 0,
            workspace_dir: workspaces.clone(),
            bootstrap_dir: dir.path().join("no-bootstrap"),
            ..AgentConfig::default()
        };
        let ct = CancellationToken::new();
        let (relay, _relay_handle) = Relay::spawn(64, ct.clone());
        let state = Arc::new(AgentState::new(
            Arc::new(config),
            relay,
            default_inspector(),
            dir.path().join("home"),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral");
        let addr = listener.local_addr().expect("local addr").to_string();
        let server_state = Arc::clone(&state);
        let server_ct = ct.clone();
        tokio::spawn(async move {
            let _ = serve_http(listener, server_state, server_ct).await;
        });

        Self {
            addr,
            state,
            workspaces,
            ct,
            _dir: dir,
        }
    }

    fn workspace(&self, local: &Path, commands: CommandSet) -> Workspace {
        Workspace::new(local.to_path_buf(), self.addr.clone(), commands)
    }

    fn remote(&self, ws: &Workspace) -> PathBuf {
        self.workspaces.join(&ws.id)
    }

    async fn shutdown(self) {
        for orch in self.state.registry.drain().await {
            let _ = orch.stop().await;
        }
        self.ct.cancel();
    }
}

fn transport() -> UploadTransport {
    UploadTransport::with_policy(
        Arc::new(HttpAgentApi::new()),
        Arc::new(NoIgnore),
        3,
        Duration::from_millis(10),
    )
}

fn record(ws: &Workspace, path: &str, kind: ChangeKind) -> ChangeRecord {
    ChangeRecord {
        workspace_id: ws.id.clone(),
        path: PathBuf::from(path),
        kind,
        is_dir: false,
        mode: 0o644,
    }
}

#[tokio::test]
async fn healthz_returns_ok() {
    let agent = Agent::start().await;

    let response = reqwest::get(format!("http://{}/healthz", agent.addr))
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.expect("body"), "ok");
    HttpAgentApi::new().health(&agent.addr).await.expect("health");

    agent.shutdown().await;
}

#[tokio::test]
async fn upload_installs_tree_and_registers_workspace() {
    let agent = Agent::start().await;
    let local = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(local.path().join("cmd")).expect("mkdir");
    fs::write(local.path().join("cmd/main.go"), "package main").expect("write");
    let ws = agent.workspace(local.path(), CommandSet::default());

    transport().upload(&ws).await.expect("upload");

    let remote = agent.remote(&ws);
    assert_eq!(
        fs::read_to_string(remote.join("cmd/main.go")).expect("remote file"),
        "package main"
    );
    assert_eq!(agent.state.registry.ids().await, vec![ws.id.clone()]);
    agent.shutdown().await;
}

#[tokio::test]
async fn updates_write_and_delete_remote_files() {
    let agent = Agent::start().await;
    let local = tempfile::tempdir().expect("tempdir");
    let ws = agent.workspace(local.path(), CommandSet::default());
    let transport = transport();
    transport.upload(&ws).await.expect("upload");

    fs::write(local.path().join("notes.md"), "# hi").expect("write");
    transport
        .update(&ws, &record(&ws, "notes.md", ChangeKind::Create))
        .await
        .expect("create");
    let remote = agent.remote(&ws).join("notes.md");
    assert_eq!(fs::read_to_string(&remote).expect("remote"), "# hi");

    transport
        .update(&ws, &record(&ws, "notes.md", ChangeKind::Delete))
        .await
        .expect("delete");
    assert!(!remote.exists());
    agent.shutdown().await;
}

#[tokio::test]
async fn unknown_workspace_update_is_invalid_id() {
    let agent = Agent::start().await;
    let local = tempfile::tempdir().expect("tempdir");
    fs::write(local.path().join("a.txt"), "x").expect("write");
    let ws = agent.workspace(local.path(), CommandSet::default());

    let err = HttpAgentApi::new()
        .update(&ws, &record(&ws, "a.txt", ChangeKind::Create), Some("x".into()))
        .await
        .expect_err("unknown id");
    assert!(err.is_invalid_workspace(), "{err}");
    agent.shutdown().await;
}

#[tokio::test]
async fn transport_recovers_after_agent_forgets_workspace() {
    let agent = Agent::start().await;
    let local = tempfile::tempdir().expect("tempdir");
    fs::write(local.path().join("a.txt"), "v1").expect("write");
    let ws = agent.workspace(local.path(), CommandSet::default());

    // Never uploaded: the update must re-upload and retry once.
    fs::write(local.path().join("b.txt"), "v2").expect("write");
    transport()
        .update(&ws, &record(&ws, "b.txt", ChangeKind::Create))
        .await
        .expect("recovered update");

    let remote = agent.remote(&ws);
    assert_eq!(fs::read_to_string(remote.join("a.txt")).expect("a"), "v1");
    assert_eq!(fs::read_to_string(remote.join("b.txt")).expect("b"), "v2");
    agent.shutdown().await;
}

#[tokio::test]
async fn malformed_requests_answer_400() {
    let agent = Agent::start().await;
    let local = tempfile::tempdir().expect("tempdir");
    let ws = agent.workspace(local.path(), CommandSet::default());
    transport().upload(&ws).await.expect("upload");
    let client = reqwest::Client::new();
    let url = format!("http://{}/", agent.addr);

    // Update without type/path.
    let response = client
        .put(&url)
        .multipart(Form::new().text("id", ws.id.clone()))
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"], "missing form fields");

    // Path escaping the workspace.
    let response = client
        .put(&url)
        .multipart(
            Form::new()
                .text("id", ws.id.clone())
                .text("type", "delete")
                .text("path", "../../etc"),
        )
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    // Upload without an id.
    let response = client
        .post(&url)
        .multipart(Form::new().text("build", "make"))
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    // Unknown id on update.
    let response = client
        .put(&url)
        .multipart(
            Form::new()
                .text("id", "nope")
                .text("type", "delete")
                .text("path", "x"),
        )
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["error"], INVALID_WORKSPACE_ID);
    agent.shutdown().await;
}

#[tokio::test]
async fn remove_is_idempotent() {
    let agent = Agent::start().await;
    let local = tempfile::tempdir().expect("tempdir");
    let ws = agent.workspace(local.path(), CommandSet::default());
    let transport = transport();
    transport.upload(&ws).await.expect("upload");

    transport.remove(&ws).await.expect("remove");
    assert!(agent.state.registry.ids().await.is_empty());
    transport.remove(&ws).await.expect("remove unknown");
    agent.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn upload_runs_build_with_workspace_env() {
    let agent = Agent::start().await;
    let local = tempfile::tempdir().expect("tempdir");
    fs::write(
        local.path().join("env.sh"),
        "printf '%s' \"$GREETING\" > env.txt\n",
    )
    .expect("write");
    let mut ws = agent.workspace(local.path(), CommandSet::new("", "sh env.sh", "", ""));
    ws.env = BTreeMap::from([("GREETING".to_owned(), "hi there".to_owned())]);

    // The upload answers only after the build finished.
    transport().upload(&ws).await.expect("upload");
    assert_eq!(
        fs::read_to_string(agent.remote(&ws).join("env.txt")).expect("env.txt"),
        "hi there"
    );
    agent.shutdown().await;
}

#[tokio::test]
async fn remote_path_places_workspace_under_home() {
    let agent = Agent::start().await;
    let local = tempfile::tempdir().expect("tempdir");
    fs::write(local.path().join("x.txt"), "x").expect("write");
    let mut ws = agent.workspace(local.path(), CommandSet::default());
    ws.remote_path = Some("~/apps/demo".into());

    transport().upload(&ws).await.expect("upload");
    let orch = agent.state.registry.get(&ws.id).await.expect("registered");
    assert!(orch.root().ends_with("home/apps/demo"));
    assert!(orch.root().join("x.txt").exists());
    agent.shutdown().await;
}
