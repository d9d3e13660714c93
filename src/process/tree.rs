//! Process tree enumeration and cascading kill.
//!
//! Two inspectors build the same [`ProcessNode`] shape. The pid-query
//! strategy asks `ps` for every pid's parent one process at a time; the
//! snapshot strategy reads the whole process table once through `sysinfo`
//! and assembles the tree in memory.

use std::collections::{HashMap, HashSet};
use std::process::Command;
use std::sync::Arc;

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

use crate::{AppError, Result};

/// A process and its descendants, built fresh for every kill request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessNode {
    /// Process id.
    pub pid: u32,
    /// Parent process id (0 when unknown).
    pub ppid: u32,
    /// Direct children, sorted by pid.
    pub children: Vec<ProcessNode>,
}

impl ProcessNode {
    /// Every pid in the tree, root first (pre-order).
    #[must_use]
    pub fn pids(&self) -> Vec<u32> {
        let mut out = vec![self.pid];
        for child in &self.children {
            out.extend(child.pids());
        }
        out
    }

    /// Number of processes in the tree, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(ProcessNode::len).sum::<usize>()
    }

    /// Always false: a tree holds at least its root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Strategy for enumerating the descendants of a process.
pub trait ProcessInspector: Send + Sync {
    /// Build the process tree rooted at `pid`.
    ///
    /// A root that no longer exists yields a childless node.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kill` if the process table cannot be read.
    fn tree(&self, pid: u32) -> Result<ProcessNode>;
}

/// Queries `ps` for each pid's parent individually.
#[derive(Debug, Default, Clone, Copy)]
pub struct PidQueryInspector;

impl ProcessInspector for PidQueryInspector {
    fn tree(&self, pid: u32) -> Result<ProcessNode> {
        let listing = Command::new("ps")
            .args(["-A", "-o", "pid="])
            .output()
            .map_err(|err| AppError::Kill(format!("failed to list processes: {err}")))?;
        if !listing.status.success() {
            return Err(AppError::Kill(format!(
                "ps exited with {}",
                listing.status
            )));
        }

        let mut pairs = Vec::new();
        for candidate in parse_pids(&String::from_utf8_lossy(&listing.stdout)) {
            // A pid that exited since the listing has no parent to report.
            if let Some(ppid) = query_parent(candidate) {
                pairs.push((candidate, ppid));
            }
        }
        Ok(assemble(pid, &pairs))
    }
}

fn parse_pids(raw: &str) -> Vec<u32> {
    raw.lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect()
}

fn query_parent(pid: u32) -> Option<u32> {
    let output = Command::new("ps")
        .args(["-o", "ppid=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

/// Reads the process table once through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotInspector;

impl ProcessInspector for SnapshotInspector {
    fn tree(&self, pid: u32) -> Result<ProcessNode> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new(),
        );
        let pairs: Vec<(u32, u32)> = system
            .processes()
            .iter()
            .map(|(child, process)| {
                (
                    child.as_u32(),
                    process.parent().map_or(0, sysinfo::Pid::as_u32),
                )
            })
            .collect();
        Ok(assemble(pid, &pairs))
    }
}

/// Inspector suited to the current platform: per-pid queries on macOS,
/// a single table snapshot elsewhere.
#[must_use]
pub fn default_inspector() -> Arc<dyn ProcessInspector> {
    if cfg!(target_os = "macos") {
        Arc::new(PidQueryInspector)
    } else {
        Arc::new(SnapshotInspector)
    }
}

/// Assemble the tree rooted at `root` from `(pid, ppid)` pairs.
pub(crate) fn assemble(root: u32, pairs: &[(u32, u32)]) -> ProcessNode {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    let mut parents: HashMap<u32, u32> = HashMap::new();
    for &(pid, ppid) in pairs {
        parents.insert(pid, ppid);
        if pid != ppid {
            children.entry(ppid).or_default().push(pid);
        }
    }
    for list in children.values_mut() {
        list.sort_unstable();
    }

    let mut visited = HashSet::new();
    build_node(root, &parents, &children, &mut visited)
}

fn build_node(
    pid: u32,
    parents: &HashMap<u32, u32>,
    children: &HashMap<u32, Vec<u32>>,
    visited: &mut HashSet<u32>,
) -> ProcessNode {
    visited.insert(pid);
    let kids = children
        .get(&pid)
        .map(|list| {
            list.iter()
                .filter(|child| !visited.contains(child))
                .copied()
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
        .into_iter()
        .map(|child| build_node(child, parents, children, visited))
        .collect();

    ProcessNode {
        pid,
        ppid: parents.get(&pid).copied().unwrap_or(0),
        children: kids,
    }
}

/// Kill `node` then, recursively, each of its children.
///
/// A process that has already exited is not an error.
///
/// # Errors
///
/// Returns `AppError::Kill` if a signal cannot be delivered for any other
/// reason. Remaining processes are still attempted first.
pub fn kill_tree(node: &ProcessNode) -> Result<()> {
    let mut first_error = kill_pid(node.pid).err();
    for child in &node.children {
        if let Err(err) = kill_tree(child) {
            first_error.get_or_insert(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if pid == 0 || pid == std::process::id() {
        return Ok(());
    }
    let raw = i32::try_from(pid).map_err(|_| AppError::Kill(format!("pid {pid} out of range")))?;
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => {
            debug!(pid, "process killed");
            Ok(())
        }
        Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(AppError::Kill(format!("failed to kill pid {pid}: {err}"))),
    }
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) -> Result<()> {
    if pid == 0 || pid == std::process::id() {
        return Ok(());
    }
    let status = Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .output()
        .map_err(|err| AppError::Kill(format!("failed to run taskkill for {pid}: {err}")))?
        .status;
    taskkill_result(pid, status.code())
}

/// Exit code taskkill uses when the pid does not exist.
#[cfg(any(not(unix), test))]
const TASKKILL_NOT_FOUND: i32 = 128;

#[cfg(any(not(unix), test))]
fn taskkill_result(pid: u32, code: Option<i32>) -> Result<()> {
    match code {
        Some(0) => {
            debug!(pid, "process killed");
            Ok(())
        }
        Some(TASKKILL_NOT_FOUND) => Ok(()),
        Some(code) => Err(AppError::Kill(format!(
            "taskkill for pid {pid} exited with {code}"
        ))),
        None => Err(AppError::Kill(format!("taskkill for pid {pid} was terminated"))),
    }
}
