//! Process supervisor.
//!
//! Starts every worker as its own OS process by re-invoking the current
//! executable with a hidden `worker` subcommand: one discovery process per
//! tenant and a fixed pool of consumers. Workers share nothing but the
//! broker. On SIGINT or SIGTERM every child is killed and reaped; messages
//! a consumer held at that moment stay pending and are reclaimed later.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;

/// Which workers a supervisor starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    Discovery,
    Consumers,
    All,
}

/// A single child process's role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Discovery { tenant: String },
    Consumer { ordinal: usize },
}

impl Role {
    /// Arguments after the global options that start this role.
    pub fn args(&self) -> Vec<String> {
        match self {
            Role::Discovery { tenant } => vec![
                "worker".to_string(),
                "discover".to_string(),
                "--tenant".to_string(),
                tenant.clone(),
            ],
            Role::Consumer { ordinal } => vec![
                "worker".to_string(),
                "consume".to_string(),
                "--ordinal".to_string(),
                ordinal.to_string(),
            ],
        }
    }

    pub fn label(&self) -> String {
        match self {
            Role::Discovery { tenant } => format!("discovery[{}]", tenant),
            Role::Consumer { ordinal } => format!("consumer[{}]", ordinal),
        }
    }
}

/// The roles to start for a workload, discovery first.
pub fn plan(config: &Config, workload: Workload) -> Vec<Role> {
    let mut roles = Vec::new();
    if matches!(workload, Workload::Discovery | Workload::All) {
        roles.extend(
            config
                .producer
                .tenants
                .iter()
                .map(|t| Role::Discovery { tenant: t.clone() }),
        );
    }
    if matches!(workload, Workload::Consumers | Workload::All) {
        roles.extend((0..config.consumer.workers).map(|ordinal| Role::Consumer { ordinal }));
    }
    roles
}

struct Supervised {
    label: String,
    kill: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Spawn the workload and block until a shutdown signal arrives or every
/// child has exited on its own.
pub async fn run_supervisor(config: &Config, config_path: &Path, workload: Workload) -> Result<()> {
    let program = std::env::current_exe().context("Cannot locate current executable")?;
    let roles = plan(config, workload);
    if roles.is_empty() {
        warn!("Nothing to supervise");
        return Ok(());
    }

    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
    let mut children = Vec::with_capacity(roles.len());
    for role in &roles {
        let child = spawn_child(&program, config_path, role)?;
        children.push(watch(role.label(), child, exit_tx.clone()));
    }
    drop(exit_tx);
    info!(count = children.len(), "All workers spawned. Press Ctrl+C to stop.");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut running = children.len();
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal?;
                break;
            }
            exited = exit_rx.recv() => {
                let Some((label, status)) = exited else { break };
                running -= 1;
                log_exit(&label, status);
                if running == 0 {
                    warn!("All workers exited");
                    return Ok(());
                }
            }
        }
    }

    info!("Terminating all workers...");
    let mut handles = Vec::with_capacity(children.len());
    for child in children {
        let _ = child.kill.send(());
        handles.push((child.label, child.handle));
    }
    for (label, handle) in handles {
        if let Err(e) = handle.await {
            error!(worker = %label, error = %e, "Worker watcher panicked");
        }
    }
    while let Ok((label, status)) = exit_rx.try_recv() {
        log_exit(&label, status);
    }
    info!("All workers stopped");
    Ok(())
}

fn spawn_child(program: &Path, config_path: &Path, role: &Role) -> Result<Child> {
    let child = Command::new(program)
        .arg("--config")
        .arg(config_path)
        .args(role.args())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn {}", role.label()))?;
    info!(worker = %role.label(), pid = child.id().unwrap_or_default(), "Worker started");
    Ok(child)
}

fn watch(
    label: String,
    mut child: Child,
    exits: mpsc::UnboundedSender<(String, std::io::Result<ExitStatus>)>,
) -> Supervised {
    let (kill, killed) = oneshot::channel::<()>();
    let task_label = label.clone();
    let handle = tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = killed => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let _ = exits.send((task_label, status));
    });
    Supervised {
        label,
        kill,
        handle,
    }
}

fn log_exit(label: &str, status: std::io::Result<ExitStatus>) {
    match status {
        Ok(status) if status.success() => info!(worker = %label, "Worker exited"),
        Ok(status) => warn!(worker = %label, status = %status, "Worker exited"),
        Err(e) => error!(worker = %label, error = %e, "Failed to wait on worker"),
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.context("Failed to install Ctrl+C handler")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;

    info!("Shutdown signal received...");
    Ok(())
}

/// Path used to hand the same configuration to every child.
pub fn resolve_config_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
