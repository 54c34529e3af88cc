use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use helm_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

mod child;
mod control;

use child::{ChildOutcome, ForwardedSignals, KILL_GRACE};
use control::ControlState;

const CONTROL_PORT_OFFSET: u16 = 100;

#[derive(Parser, Debug)]
#[command(name = "helm-procctl")]
#[command(about = "Runs one child process behind a loopback shutdown/health endpoint")]
struct Cli {
    /// Control port; defaults to the companion port plus 100.
    #[arg(long, env = "HELM_PROCCTL_PORT")]
    port: Option<u16>,
    #[arg(long, env = "HELM_BRIDGE_PORT", default_value_t = 3002)]
    companion_port: u16,
    #[arg(long)]
    logs_dir: Option<PathBuf>,
    /// Program and arguments to run, after `--`.
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl Cli {
    fn control_port(&self) -> u16 {
        self.port
            .unwrap_or_else(|| self.companion_port.saturating_add(CONTROL_PORT_OFFSET))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let logs_dir = cli.logs_dir.clone().unwrap_or_else(|| {
        let root = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("helm");
        canonical_logs_dir_from_root(&root)
    });
    let (log_guard, _) = init_process_logging(ProcessKind::Procctl, &logs_dir, 14, None)?;

    let outcome = run(&cli).await?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Procctl,
        ObservabilityEvent {
            status: Some(match outcome {
                ChildOutcome::Code(0) => "ok",
                ChildOutcome::Code(_) => "failed",
                ChildOutcome::Signal(_) => "signaled",
            }),
            ..ObservabilityEvent::new("child.exited", "procctl")
        },
    );
    drop(log_guard);
    outcome.exit()
}

async fn run(cli: &Cli) -> anyhow::Result<ChildOutcome> {
    let (program, args) = cli
        .command
        .split_first()
        .context("no program given after `--`")?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn `{program}`"))?;
    let pid = child.id().context("child exited before its pid was read")?;
    tracing::info!(pid, program = %program, "child started");

    let child_alive = Arc::new(AtomicBool::new(true));
    let shutdown = CancellationToken::new();
    let server_stop = CancellationToken::new();
    let server = control::serve(
        cli.control_port(),
        ControlState {
            pid,
            child_alive: child_alive.clone(),
            shutdown: shutdown.clone(),
        },
        server_stop.clone(),
    )
    .await;
    let mut signals = ForwardedSignals::install().context("failed to install signal handlers")?;

    let outcome = loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.context("failed to wait on child")?;
                child_alive.store(false, Ordering::SeqCst);
                let outcome = ChildOutcome::from_status(status);
                tracing::info!(pid, ?outcome, "child exited");
                break outcome;
            }
            _ = shutdown.cancelled() => {
                let status = child::terminate(&mut child, &child_alive, KILL_GRACE)
                    .await
                    .context("failed to stop child")?;
                tracing::info!(pid, outcome = ?ChildOutcome::from_status(status), "child stopped on request");
                break ChildOutcome::Code(0);
            }
            sig = signals.recv() => {
                tracing::info!(pid, sig, "forwarding signal to child");
                #[cfg(unix)]
                child::send_signal(pid, sig, &child_alive);
                #[cfg(not(unix))]
                {
                    child_alive.store(false, Ordering::SeqCst);
                    if let Err(e) = child.start_kill() {
                        tracing::warn!("failed to stop child: {}", e);
                    }
                }
            }
        }
    };

    server_stop.cancel();
    if let Some(server) = server {
        if let Err(e) = server.await {
            tracing::warn!("control endpoint task failed: {}", e);
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_port_defaults_to_companion_offset() {
        let cli = Cli::try_parse_from(["helm-procctl", "--companion-port", "4000", "--", "node", "bridge.js"])
            .unwrap();
        assert_eq!(cli.control_port(), 4100);
        assert_eq!(cli.command, vec!["node".to_string(), "bridge.js".to_string()]);

        let cli = Cli::try_parse_from(["helm-procctl", "--port", "5555", "--", "node"]).unwrap();
        assert_eq!(cli.control_port(), 5555);
    }

    #[test]
    fn program_is_required() {
        assert!(Cli::try_parse_from(["helm-procctl", "--port", "5555"]).is_err());
    }
}
