/// Stop-and-wait protocol run once a launch has been denied.
///
/// Launches the configured stop command in the background, then waits for
/// whichever comes first: a SIGTERM to this process (the supervisor acting on
/// the stop request) or a fixed timeout. Either way the caller exits non-zero.
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

/// How long to wait for the supervisor's TERM after requesting a stop.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How the wait after a denial ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No stop command configured; nothing to wait for.
    NotConfigured,
    /// A termination signal arrived before the timeout.
    Signalled,
    /// The timeout elapsed first.
    TimedOut,
}

/// Runs the stop command and races the resulting signal against a timeout.
#[derive(Debug, Clone)]
pub struct StopOrchestrator<'a> {
    command: Option<&'a [String]>,
    timeout: Duration,
}

impl<'a> StopOrchestrator<'a> {
    /// `command` is program + arguments, already split.
    pub fn new(command: Option<&'a [String]>) -> Self {
        Self {
            command: command.filter(|c| !c.is_empty()),
            timeout: STOP_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Wait for SIGTERM. The listener is installed before the stop command
    /// starts so an immediate signal is not missed.
    pub async fn run(&self) -> StopOutcome {
        if self.command.is_none() {
            return StopOutcome::NotConfigured;
        }

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                self.run_with(async move {
                    term.recv().await;
                })
                .await
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "failed to listen for SIGTERM, waiting for timeout only"
                );
                self.run_with(std::future::pending::<()>()).await
            }
        }
    }

    /// Same as [`run`](Self::run) with an arbitrary "stopped" event.
    pub async fn run_with<F>(&self, stopped: F) -> StopOutcome
    where
        F: Future<Output = ()>,
    {
        let Some(command) = self.command else {
            return StopOutcome::NotConfigured;
        };

        // Left running if we exit first; it belongs to the supervisor now.
        let _watcher = spawn_stop_command(command);

        tokio::select! {
            _ = stopped => {
                tracing::info!(command = %command[0], "received TERM after stop request");
                StopOutcome::Signalled
            }
            _ = tokio::time::sleep(self.timeout) => {
                tracing::warn!(
                    command = %command[0],
                    timeout_secs = self.timeout.as_secs_f64(),
                    "timed out while waiting for TERM from {}",
                    command[0]
                );
                StopOutcome::TimedOut
            }
        }
    }
}

/// Spawn the stop command in its own process group and watch it from a
/// background task, which logs its output if it fails.
fn spawn_stop_command(command: &[String]) -> Option<JoinHandle<()>> {
    tracing::info!(command = ?command, "requesting service stop");

    let child = Command::new(&command[0])
        .args(&command[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(
                error = %e,
                command = %command[0],
                "failed to launch stop command"
            );
            return None;
        }
    };

    let program = command[0].clone();
    Some(tokio::spawn(async move {
        match child.wait_with_output().await {
            Ok(output) if output.status.success() => {
                tracing::debug!(command = %program, "stop command finished");
            }
            Ok(output) => {
                tracing::warn!(
                    command = %program,
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "command exited abnormally with output {}",
                    String::from_utf8_lossy(&output.stdout).trim()
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, command = %program, "failed to wait for stop command");
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_not_configured_returns_immediately() {
        let orchestrator = StopOrchestrator::new(None);
        assert_eq!(orchestrator.run().await, StopOutcome::NotConfigured);
    }

    #[tokio::test]
    async fn test_empty_command_is_not_configured() {
        let empty: Vec<String> = Vec::new();
        let orchestrator = StopOrchestrator::new(Some(empty.as_slice()));
        assert_eq!(
            orchestrator.run_with(std::future::pending()).await,
            StopOutcome::NotConfigured
        );
    }

    #[tokio::test]
    async fn test_stopped_before_timeout() {
        let command = cmd(&["true"]);
        let orchestrator =
            StopOrchestrator::new(Some(command.as_slice())).with_timeout(Duration::from_secs(5));
        let start = Instant::now();
        let outcome = orchestrator
            .run_with(tokio::time::sleep(Duration::from_millis(50)))
            .await;
        assert_eq!(outcome, StopOutcome::Signalled);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_times_out_without_signal() {
        let command = cmd(&["true"]);
        let orchestrator =
            StopOrchestrator::new(Some(command.as_slice()))
                .with_timeout(Duration::from_millis(100));
        let start = Instant::now();
        let outcome = orchestrator.run_with(std::future::pending()).await;
        assert_eq!(outcome, StopOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_stop_command_is_launched() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("stopped");
        let command = cmd(&["touch", marker.to_str().unwrap()]);
        let orchestrator =
            StopOrchestrator::new(Some(command.as_slice())).with_timeout(Duration::from_secs(5));

        let watch = marker.clone();
        let outcome = orchestrator
            .run_with(async move {
                while !watch.exists() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await;
        assert_eq!(outcome, StopOutcome::Signalled);
    }

    #[tokio::test]
    async fn test_failing_stop_command_still_times_out() {
        let command = cmd(&["sh", "-c", "echo going down; exit 3"]);
        let orchestrator =
            StopOrchestrator::new(Some(command.as_slice()))
                .with_timeout(Duration::from_millis(200));
        assert_eq!(
            orchestrator.run_with(std::future::pending()).await,
            StopOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn test_missing_stop_command_still_times_out() {
        let command = cmd(&["nonexistent-binary-xyz", "down"]);
        let orchestrator =
            StopOrchestrator::new(Some(command.as_slice()))
                .with_timeout(Duration::from_millis(100));
        assert_eq!(
            orchestrator.run_with(std::future::pending()).await,
            StopOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_returns_none() {
        assert!(spawn_stop_command(&cmd(&["nonexistent-binary-xyz"])).is_none());
    }

    #[tokio::test]
    async fn test_watcher_observes_exit() {
        let handle = spawn_stop_command(&cmd(&["sh", "-c", "exit 1"])).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_real_sigterm_wins_race() {
        let pid = std::process::id().to_string();
        let command = cmd(&["kill", "-TERM", &pid]);
        let orchestrator = StopOrchestrator::new(Some(command.as_slice()));
        let start = Instant::now();
        assert_eq!(orchestrator.run().await, StopOutcome::Signalled);
        assert!(start.elapsed() < STOP_TIMEOUT);
    }
}
