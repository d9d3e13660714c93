//! Integration tests for process tree enumeration and cascading kill.

#![cfg(unix)]

use std::time::Duration;

use serial_test::serial;
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tokio::process::Command;

use tether::process::tree::{PidQueryInspector, SnapshotInspector};
use tether::process::{kill_tree, ProcessInspector, ProcessNode};

use super::test_helpers::wait_until;

const LIMIT: Duration = Duration::from_secs(15);

/// Root shell with two children, one of which has a child of its own.
fn spawn_family() -> tokio::process::Child {
    Command::new("sh")
        .args(["-c", "sh -c 'sleep 30; true' & sleep 30 & wait"])
        .kill_on_drop(true)
        .spawn()
        .expect("spawn sh")
}

async fn full_tree(inspector: &dyn ProcessInspector, pid: u32) -> ProcessNode {
    let mut tree = None;
    let found = wait_until(LIMIT, || {
        let node = inspector.tree(pid).expect("inspect");
        let complete = node.len() == 4;
        tree = Some(node);
        async move { complete }
    })
    .await;
    assert!(found, "tree never reached four processes: {tree:?}");
    tree.expect("tree")
}

fn alive(pids: &[u32]) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());
    pids.iter()
        .copied()
        .filter(|pid| {
            system
                .process(sysinfo::Pid::from_u32(*pid))
                .is_some_and(|proc| !matches!(proc.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        })
        .collect()
}

async fn assert_kills_family(inspector: &dyn ProcessInspector) {
    let mut root = spawn_family();
    let pid = root.id().expect("root pid");

    let tree = full_tree(inspector, pid).await;
    assert_eq!(tree.pid, pid);
    assert_eq!(tree.children.len(), 2);
    assert_eq!(tree.children.iter().map(ProcessNode::len).sum::<usize>(), 3);
    let pids = tree.pids();

    kill_tree(&tree).expect("kill tree");
    root.wait().await.expect("reap root");

    let survivors = wait_until(LIMIT, || {
        let left = alive(&pids);
        async move { left.is_empty() }
    })
    .await;
    assert!(survivors, "processes still alive: {:?}", alive(&pids));
}

#[tokio::test]
#[serial]
async fn snapshot_inspector_kills_all_four() {
    assert_kills_family(&SnapshotInspector).await;
}

#[tokio::test]
#[serial]
async fn pid_query_inspector_kills_all_four() {
    assert_kills_family(&PidQueryInspector).await;
}

#[tokio::test]
#[serial]
async fn exited_root_yields_childless_node_and_kill_succeeds() {
    let mut child = Command::new("true").spawn().expect("spawn");
    let pid = child.id().expect("pid");
    child.wait().await.expect("wait");

    let node = SnapshotInspector.tree(pid).expect("inspect");
    assert!(node.children.is_empty());
    assert_eq!(node.len(), 1);
    kill_tree(&node).expect("killing a gone process is fine");
}
