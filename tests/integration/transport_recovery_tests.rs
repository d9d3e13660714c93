//! Integration tests for upload retries and invalid-id recovery.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use tether::errors::INVALID_WORKSPACE_ID;
use tether::models::{ChangeKind, ChangeRecord, CommandSet, Workspace};
use tether::sync::transport::ApiFuture;
use tether::sync::{AgentApi, ChangeSink, NoIgnore, TransportSink, UploadTransport};
use tether::AppError;

/// Scripted agent: fails the first `upload_failures` uploads and answers
/// "invalid workspace id" to updates until an upload succeeds.
#[derive(Default)]
struct FakeAgent {
    upload_failures: usize,
    uploads: AtomicUsize,
    updates: AtomicUsize,
    known: Mutex<bool>,
    archives: Mutex<Vec<usize>>,
    payloads: Mutex<Vec<Option<Bytes>>>,
}

impl FakeAgent {
    fn rejected(workspace: &Workspace, message: &str) -> AppError {
        AppError::Rejected {
            workspace_id: workspace.id.clone(),
            status: "failed".into(),
            message: message.into(),
        }
    }
}

impl AgentApi for FakeAgent {
    fn upload<'a>(&'a self, workspace: &'a Workspace, archive: Vec<u8>) -> ApiFuture<'a> {
        Box::pin(async move {
            let attempt = self.uploads.fetch_add(1, Ordering::SeqCst);
            self.archives.lock().unwrap().push(archive.len());
            if attempt < self.upload_failures {
                return Err(AppError::Transport {
                    workspace_id: workspace.id.clone(),
                    message: "connection refused".into(),
                });
            }
            *self.known.lock().unwrap() = true;
            Ok(())
        })
    }

    fn update<'a>(
        &'a self,
        workspace: &'a Workspace,
        _change: &'a ChangeRecord,
        contents: Option<Bytes>,
    ) -> ApiFuture<'a> {
        Box::pin(async move {
            self.updates.fetch_add(1, Ordering::SeqCst);
            self.payloads.lock().unwrap().push(contents);
            if *self.known.lock().unwrap() {
                Ok(())
            } else {
                Err(Self::rejected(workspace, INVALID_WORKSPACE_ID))
            }
        })
    }

    fn remove<'a>(&'a self, _workspace: &'a Workspace) -> ApiFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn health<'a>(&'a self, _address: &'a str) -> ApiFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

fn workspace(root: PathBuf) -> Workspace {
    Workspace::new(root, "127.0.0.1:1", CommandSet::new("", "", "", "./run"))
}

fn transport(agent: &Arc<FakeAgent>, attempts: u32) -> UploadTransport {
    UploadTransport::with_policy(
        Arc::clone(agent) as Arc<dyn AgentApi>,
        Arc::new(NoIgnore),
        attempts,
        Duration::from_millis(1),
    )
}

fn file_change(ws: &Workspace, path: &str) -> ChangeRecord {
    ChangeRecord {
        workspace_id: ws.id.clone(),
        path: PathBuf::from(path),
        kind: ChangeKind::Update,
        is_dir: false,
        mode: 0o644,
    }
}

#[tokio::test]
async fn invalid_id_triggers_one_upload_and_one_retry() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("main.go"), "package main").expect("write");
    let ws = workspace(dir.path().to_path_buf());
    let agent = Arc::new(FakeAgent::default());

    transport(&agent, 5)
        .update(&ws, &file_change(&ws, "main.go"))
        .await
        .expect("update recovers");

    assert_eq!(agent.uploads.load(Ordering::SeqCst), 1);
    assert_eq!(agent.updates.load(Ordering::SeqCst), 2);
    let payloads = agent.payloads.lock().unwrap().clone();
    assert!(payloads
        .iter()
        .all(|p| p.as_deref() == Some(&b"package main"[..])));
}

#[tokio::test]
async fn other_rejections_are_not_retried() {
    struct Refusing;
    impl AgentApi for Refusing {
        fn upload<'a>(&'a self, _ws: &'a Workspace, _archive: Vec<u8>) -> ApiFuture<'a> {
            Box::pin(async { panic!("no upload expected") })
        }
        fn update<'a>(
            &'a self,
            ws: &'a Workspace,
            _change: &'a ChangeRecord,
            _contents: Option<Bytes>,
        ) -> ApiFuture<'a> {
            Box::pin(async move { Err(FakeAgent::rejected(ws, "missing form fields")) })
        }
        fn remove<'a>(&'a self, _ws: &'a Workspace) -> ApiFuture<'a> {
            Box::pin(async { Ok(()) })
        }
        fn health<'a>(&'a self, _address: &'a str) -> ApiFuture<'a> {
            Box::pin(async { Ok(()) })
        }
    }

    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("a.txt"), "x").expect("write");
    let ws = workspace(dir.path().to_path_buf());
    let transport = UploadTransport::with_policy(
        Arc::new(Refusing),
        Arc::new(NoIgnore),
        3,
        Duration::from_millis(1),
    );
    let err = transport
        .update(&ws, &file_change(&ws, "a.txt"))
        .await
        .expect_err("rejected");
    assert!(!err.is_invalid_workspace());
}

#[tokio::test]
async fn upload_retries_until_success() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("a.txt"), "hello").expect("write");
    let ws = workspace(dir.path().to_path_buf());
    let agent = Arc::new(FakeAgent {
        upload_failures: 3,
        ..FakeAgent::default()
    });

    transport(&agent, 10).upload(&ws).await.expect("upload");
    assert_eq!(agent.uploads.load(Ordering::SeqCst), 4);
    // Every attempt re-reads the whole staged archive.
    let sizes = agent.archives.lock().unwrap().clone();
    assert!(sizes[0] > 0);
    assert!(sizes.iter().all(|size| *size == sizes[0]));
}

#[tokio::test]
async fn upload_gives_up_with_last_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ws = workspace(dir.path().to_path_buf());
    let agent = Arc::new(FakeAgent {
        upload_failures: usize::MAX,
        ..FakeAgent::default()
    });

    let err = transport(&agent, 3).upload(&ws).await.expect_err("gives up");
    assert!(matches!(err, AppError::Transport { ref workspace_id, .. } if *workspace_id == ws.id));
    assert_eq!(agent.uploads.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn missing_local_file_is_vanished() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ws = workspace(dir.path().to_path_buf());
    let agent = Arc::new(FakeAgent::default());

    let err = transport(&agent, 1)
        .update(&ws, &file_change(&ws, "deleted.txt"))
        .await
        .expect_err("vanished");
    assert!(matches!(err, AppError::Vanished(_)));
    assert_eq!(agent.updates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn deletes_and_directories_carry_no_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir(dir.path().join("pkg")).expect("mkdir");
    let ws = workspace(dir.path().to_path_buf());
    let agent = Arc::new(FakeAgent::default());
    *agent.known.lock().unwrap() = true;
    let sink = TransportSink::new(Arc::new(transport(&agent, 1)), ws.clone());

    let mut delete = file_change(&ws, "gone.txt");
    delete.kind = ChangeKind::Delete;
    sink.deliver(&delete).await.expect("delete");

    let mut mkdir = file_change(&ws, "pkg");
    mkdir.kind = ChangeKind::Create;
    mkdir.is_dir = true;
    sink.deliver(&mkdir).await.expect("mkdir");

    let payloads = agent.payloads.lock().unwrap().clone();
    assert_eq!(payloads, vec![None, None]);
}
