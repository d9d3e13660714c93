#![forbid(unsafe_code)]

//! `tether`: local CLI for managing and syncing workspaces.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tether::config::ClientConfig;
use tether::models::{CommandSet, Workspace};
use tether::persistence::{db, WorkspaceRepo};
use tether::relay::tcp::LogStream;
use tether::relay::{LogLine, OutputStream, Relay};
use tether::sync::{
    AgentApi, FileIgnoreProvider, HttpAgentApi, IgnoreProvider, Syncer, TransportSink,
    UploadTransport,
};
use tether::{AppError, Result};

#[derive(Debug, Parser)]
#[command(name = "tether", about = "Edit locally, run remotely", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a local directory with a remote agent.
    Add {
        /// Local directory to watch.
        #[arg(long)]
        local: PathBuf,
        /// Agent HTTP address (`host:port`).
        #[arg(long)]
        address: String,
        /// Directory on the agent host.
        #[arg(long)]
        remote: Option<String>,
        /// Long-running command started only on a full upload.
        #[arg(long, default_value = "")]
        init: String,
        /// Build command.
        #[arg(long, default_value = "")]
        build: String,
        /// Test command.
        #[arg(long, default_value = "")]
        test: String,
        /// Start command.
        #[arg(long, default_value = "")]
        start: String,
        /// Environment variable passed to remote commands (`KEY=VALUE`).
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
    },

    /// List registered workspaces.
    List,

    /// Forget a workspace locally and on its agent.
    Remove {
        /// Workspace id.
        id: String,
    },

    /// Check that an agent is reachable.
    Health {
        /// Agent HTTP address (`host:port`).
        address: String,
    },

    /// Upload every workspace, then mirror changes until interrupted.
    Sync,
}

fn parse_env_pair(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = match &args.config {
        Some(path) => ClientConfig::load_from_path(path)?,
        None => ClientConfig::default(),
    };
    let pool = Arc::new(db::connect(&config.db_path).await?);
    let repo = WorkspaceRepo::new(pool);

    match args.command {
        Command::Add {
            local,
            address,
            remote,
            init,
            build,
            test,
            start,
            env,
        } => {
            let local = local.canonicalize().map_err(|err| {
                AppError::Config(format!("invalid local path {}: {err}", local.display()))
            })?;
            let mut workspace =
                Workspace::new(local, address, CommandSet::new(init, build, test, start));
            workspace.remote_path = remote;
            workspace.env = env.into_iter().collect::<BTreeMap<_, _>>();
            let created = repo.create(&workspace).await?;
            println!("{}", created.id);
        }
        Command::List => {
            for workspace in repo.list().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    workspace.id,
                    workspace.local_path.display(),
                    workspace.address,
                    workspace.remote_path.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::Remove { id } => {
            let workspace = repo.get_by_id(&id).await?;
            if let Err(err) = HttpAgentApi::new().remove(&workspace).await {
                warn!(workspace_id = %id, %err, "agent did not confirm removal");
            }
            repo.delete(&id).await?;
            println!("removed {id}");
        }
        Command::Health { address } => {
            HttpAgentApi::new().health(&address).await?;
            println!("ok");
        }
        Command::Sync => sync(&config, repo.list().await?).await?,
    }
    Ok(())
}

async fn sync(config: &ClientConfig, workspaces: Vec<Workspace>) -> Result<()> {
    if workspaces.is_empty() {
        return Err(AppError::Config("no workspaces registered".into()));
    }

    let ct = CancellationToken::new();
    let ignore: Arc<dyn IgnoreProvider> =
        Arc::new(FileIgnoreProvider::new(config.ignore_file.clone()));
    let transport = Arc::new(UploadTransport::new(
        Arc::new(HttpAgentApi::new()),
        Arc::clone(&ignore),
        config,
    ));

    // ── Full upload of every workspace ──────────────────
    for workspace in &workspaces {
        transport.upload(workspace).await?;
        println!("uploaded {} -> {}", workspace.local_path.display(), workspace.address);
    }

    // ── Log streams, one per agent host ─────────────────
    let (relay, relay_handle) = Relay::spawn(256, ct.clone());
    let mut printer = relay.subscribe().await?;
    let hosts: BTreeSet<String> = workspaces.iter().map(|ws| ws.host().to_owned()).collect();
    let streams: Vec<_> = hosts
        .into_iter()
        .map(|host| {
            LogStream::new(
                format!("{host}:{}", config.log_port),
                config.stream_retry(),
                relay.clone(),
            )
            .spawn(ct.clone())
        })
        .collect();

    // ── Watchers ────────────────────────────────────────
    let (mut syncer, mut events, mut errors) =
        Syncer::new(Arc::clone(&ignore), config.poll_interval(), 64);
    for workspace in &workspaces {
        let sink = Arc::new(TransportSink::new(Arc::clone(&transport), workspace.clone()));
        syncer.watch(workspace, sink);
    }
    info!(count = workspaces.len(), "watching workspaces");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            Some(change) = events.recv() => {
                println!("{} {}", change.kind.as_str(), change.wire_path());
            }
            Some(failure) = errors.recv() => {
                error!(workspace_id = %failure.workspace_id, err = %failure.error, "sync error");
            }
            raw = printer.recv() => match raw {
                Some(raw) => print_log(&raw),
                None => {
                    // The relay drops subscribers that fall behind.
                    warn!("log output fell behind, lines were dropped");
                    printer = relay.subscribe().await?;
                }
            },
        }
    }

    info!("shutting down");
    syncer.close();
    ct.cancel();
    for stream in streams {
        let _ = stream.await;
    }
    let _ = relay_handle.await;
    Ok(())
}

fn print_log(raw: &[u8]) {
    match LogLine::decode(raw) {
        Ok(line) => match line.stream {
            OutputStream::Stdout => println!("[{}] {}", line.workspace, line.message),
            OutputStream::Stderr => eprintln!("[{}] {}", line.workspace, line.message),
        },
        Err(err) => warn!(%err, "undecodable log line"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))
}
