//! Per-workspace process orchestration.
//!
//! Each workspace owns one [`ProcessOrchestrator`]. A restart takes the
//! workspace's restart lock, kills the running process trees, and launches
//! the pipeline: bootstrap scripts, build (to completion), test, init (only
//! when the init is being reset) and start. The lock is held through the
//! spawn decisions and released before waiting on the background commands,
//! so restarts of one workspace are totally ordered.

pub mod registry;
pub mod token;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{info, info_span, warn, Instrument};

use crate::models::CommandSet;
use crate::process::{kill_tree, parse_command, CommandRunner, ParsedCommand, ProcessInspector, Role};
use crate::relay::Relay;
use crate::{AppError, Result};

pub use registry::WorkspaceRegistry;
pub use token::{restart_token, RestartOutcome, RestartResolver, RestartToken};

/// Lifecycle phase of a workspace pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing launched, or the last build failed.
    Idle,
    /// A restart holds the lock.
    Restarting,
    /// Build succeeded and the background commands were launched.
    Running,
}

/// Parameters of one restart.
#[derive(Debug, Clone, Default)]
pub struct RestartRequest {
    /// Kill and relaunch the init process.
    pub init_reset: bool,
    /// Replace the stored command set with `commands`.
    pub reset: bool,
    /// New command set, used when `reset` is set.
    pub commands: CommandSet,
    /// Variables merged into the workspace environment.
    pub env: BTreeMap<String, String>,
}

struct PipelineState {
    commands: CommandSet,
    env: BTreeMap<String, String>,
    init_pid: Option<u32>,
    /// Set by [`ProcessOrchestrator::stop`]; no restart runs afterwards.
    stopped: bool,
}

/// Pids of processes this workspace launched that have not been reaped yet.
type LiveSet = Arc<Mutex<HashMap<u32, Role>>>;

/// Command-set lifecycle for one workspace.
pub struct ProcessOrchestrator {
    workspace_id: String,
    root: PathBuf,
    bootstrap_dir: PathBuf,
    state: Arc<Mutex<PipelineState>>,
    live: LiveSet,
    phase: watch::Sender<Phase>,
    inspector: Arc<dyn ProcessInspector>,
    runner: CommandRunner,
}

impl ProcessOrchestrator {
    /// Create an idle orchestrator whose commands run in `root`.
    #[must_use]
    pub fn new(
        workspace_id: impl Into<String>,
        root: PathBuf,
        bootstrap_dir: PathBuf,
        relay: Relay,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Self {
        let workspace_id = workspace_id.into();
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            runner: CommandRunner::new(workspace_id.as_str(), relay),
            workspace_id,
            root,
            bootstrap_dir,
            state: Arc::new(Mutex::new(PipelineState {
                commands: CommandSet::default(),
                env: BTreeMap::new(),
                init_pid: None,
                stopped: false,
            })),
            live: Arc::new(Mutex::new(HashMap::new())),
            phase,
            inspector,
        }
    }

    /// Workspace identifier.
    #[must_use]
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Directory the workspace's commands run in.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Watch phase changes.
    #[must_use]
    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Stored command set. Waits for any in-flight restart to release the lock.
    pub async fn commands(&self) -> CommandSet {
        self.state.lock().await.commands.clone()
    }

    /// Accumulated environment. Waits for any in-flight restart.
    pub async fn env(&self) -> BTreeMap<String, String> {
        self.state.lock().await.env.clone()
    }

    /// Pid of the tracked init process while it is still running.
    pub async fn init_pid(&self) -> Option<u32> {
        let state = self.state.lock().await;
        let pid = state.init_pid?;
        self.live.lock().await.contains_key(&pid).then_some(pid)
    }

    /// Every launched process not yet reaped, sorted by pid.
    pub async fn live_processes(&self) -> Vec<(u32, Role)> {
        let mut procs: Vec<(u32, Role)> = self
            .live
            .lock()
            .await
            .iter()
            .map(|(pid, role)| (*pid, *role))
            .collect();
        procs.sort_unstable_by_key(|(pid, _)| *pid);
        procs
    }

    /// Restart the pipeline.
    ///
    /// Returns once the kill step is done and the launch is under way; the
    /// token reports whether the build succeeded and start was launched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` once the workspace has been stopped, and
    /// `AppError::Kill` if the running processes cannot be killed. The lock
    /// is released and nothing is launched in either case.
    pub async fn restart(self: &Arc<Self>, request: RestartRequest) -> Result<RestartToken> {
        let mut state = Arc::clone(&self.state).lock_owned().await;
        if state.stopped {
            warn!(workspace_id = %self.workspace_id, "restart refused after stop");
            return Err(AppError::NotFound(format!(
                "workspace {} was stopped",
                self.workspace_id
            )));
        }
        self.phase.send_replace(Phase::Restarting);
        info!(
            workspace_id = %self.workspace_id,
            init_reset = request.init_reset,
            reset = request.reset,
            "restart beginning"
        );

        state.env.extend(request.env);

        // ── Kill existing processes ─────────────────────
        let keep = if request.init_reset {
            None
        } else {
            state.init_pid
        };
        if let Err(err) = self.kill_tracked(keep).await {
            warn!(workspace_id = %self.workspace_id, %err, "restart aborted");
            self.runner.error_line(format!("restart aborted: {err}")).await;
            self.phase.send_replace(Phase::Idle);
            return Err(err);
        }
        if request.init_reset {
            state.init_pid = None;
        }

        // ── Update commands ─────────────────────────────
        if request.reset {
            let mut commands = request.commands;
            if !request.init_reset {
                commands.init.clone_from(&state.commands.init);
            }
            state.commands = commands;
        }

        let (resolver, token) = restart_token();
        let this = Arc::clone(self);
        let span = info_span!("restart", workspace_id = %self.workspace_id);
        tokio::spawn(
            async move { this.launch(state, request.init_reset, resolver).await }.instrument(span),
        );
        Ok(token)
    }

    /// Kill every tracked process tree, init included. Later restarts are
    /// refused.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kill` if a tree cannot be killed.
    pub async fn stop(&self) -> Result<()> {
        // Kill first so a build holding the lock fails and releases it.
        self.kill_tracked(None).await?;
        let mut state = self.state.lock().await;
        state.stopped = true;
        self.kill_tracked(None).await?;
        state.init_pid = None;
        self.phase.send_replace(Phase::Idle);
        info!(workspace_id = %self.workspace_id, "workspace stopped");
        Ok(())
    }

    async fn launch(
        self: Arc<Self>,
        mut state: OwnedMutexGuard<PipelineState>,
        init_reset: bool,
        mut resolver: RestartResolver,
    ) {
        let commands = state.commands.clone();
        let env = state.env.clone();

        // ── Bootstrap scripts ───────────────────────────
        for script in bootstrap_scripts(&self.bootstrap_dir) {
            let parsed = ParsedCommand {
                env: Vec::new(),
                program: script.to_string_lossy().into_owned(),
                args: Vec::new(),
            };
            self.spawn_background(Role::Bootstrap, &parsed, &self.bootstrap_dir, &env)
                .await;
        }

        // ── Build ───────────────────────────────────────
        if let Err(message) = self.run_build(&commands.build, &env).await {
            self.runner.error_line(message.clone()).await;
            let keep = if init_reset { None } else { state.init_pid };
            if let Err(err) = self.kill_tracked(keep).await {
                warn!(%err, "cleanup after failed build incomplete");
                self.runner.error_line(err.to_string()).await;
            }
            self.phase.send_replace(Phase::Idle);
            resolver.resolve(RestartOutcome::BuildFailed(message));
            info!("restart ended with failed build");
            return;
        }

        // ── Background commands ─────────────────────────
        if let Some(parsed) = parse_command(&commands.test) {
            self.spawn_background(Role::Test, &parsed, &self.root, &env)
                .await;
        }
        if init_reset {
            if let Some(parsed) = parse_command(&commands.init) {
                state.init_pid = self
                    .spawn_background(Role::Init, &parsed, &self.root, &env)
                    .await;
            }
        }
        if let Some(parsed) = parse_command(&commands.start) {
            self.spawn_background(Role::Start, &parsed, &self.root, &env)
                .await;
        }

        self.phase.send_replace(Phase::Running);
        resolver.resolve(RestartOutcome::Started);
        drop(state);
        info!("restart completed");
    }

    async fn run_build(
        &self,
        raw: &str,
        env: &BTreeMap<String, String>,
    ) -> std::result::Result<(), String> {
        let Some(parsed) = parse_command(raw) else {
            return Ok(());
        };
        let mut child = self
            .runner
            .spawn(Role::Build, &parsed, &self.root, env)
            .map_err(|err| err.to_string())?;

        let pid = child.id();
        if let Some(pid) = pid {
            self.live.lock().await.insert(pid, Role::Build);
        }
        let waited = child.wait().await;
        if let Some(pid) = pid {
            self.live.lock().await.remove(&pid);
        }

        match waited {
            Ok(status) if status.success() => {
                self.runner.notice(format!("build exited: {status}")).await;
                Ok(())
            }
            Ok(status) => Err(format!("build failed: {status}")),
            Err(err) => Err(format!("build wait failed: {err}")),
        }
    }

    /// Launch a background command with its own wait task.
    async fn spawn_background(
        &self,
        role: Role,
        command: &ParsedCommand,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Option<u32> {
        let mut child = match self.runner.spawn(role, command, cwd, env) {
            Ok(child) => child,
            Err(err) => {
                self.runner.error_line(err.to_string()).await;
                return None;
            }
        };
        let pid = child.id()?;
        self.live.lock().await.insert(pid, role);

        let live = Arc::clone(&self.live);
        let runner = self.runner.clone();
        let span = info_span!("wait", workspace_id = %self.workspace_id, role = role.as_str(), pid);
        tokio::spawn(
            async move {
                let waited = child.wait().await;
                live.lock().await.remove(&pid);
                match waited {
                    Ok(status) => {
                        info!(%status, "process exited");
                        runner.notice(format!("{role} exited: {status}")).await;
                    }
                    Err(err) => {
                        warn!(%err, "process wait failed");
                        runner.error_line(format!("{role} wait failed: {err}")).await;
                    }
                }
            }
            .instrument(span),
        );
        Some(pid)
    }

    /// Kill the tree of every live process except `keep`.
    async fn kill_tracked(&self, keep: Option<u32>) -> Result<()> {
        let pids: Vec<u32> = self
            .live
            .lock()
            .await
            .keys()
            .copied()
            .filter(|pid| Some(*pid) != keep)
            .collect();
        if pids.is_empty() {
            return Ok(());
        }

        let inspector = Arc::clone(&self.inspector);
        tokio::task::spawn_blocking(move || -> Result<()> {
            for pid in pids {
                let tree = inspector.tree(pid)?;
                kill_tree(&tree)?;
            }
            Ok(())
        })
        .await
        .map_err(|err| AppError::Kill(format!("kill task failed: {err}")))?
    }
}

/// Regular files in the bootstrap directory, sorted by name. A missing
/// directory yields nothing.
fn bootstrap_scripts(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut scripts: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    scripts.sort();
    scripts
}
