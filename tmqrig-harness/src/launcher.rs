//! Consumer launcher: starts the external `tmq_sim` process and keeps a
//! supervised handle to it.
//!
//! A supervisor task owns the child and publishes its exit on a watch
//! channel. Dropping the [`SimulatorProcess`] while the child still runs
//! kills it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tmqrig_core::{HarnessConfig, HarnessError, HarnessResult};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Poll delay passed with `-y` when none is configured.
pub const DEFAULT_POLL_DELAY: u64 = 100;

const VALGRIND: &str = "valgrind";

/// Arguments passed to valgrind ahead of the simulator binary.
const VALGRIND_FLAGS: &[&str] = &[
    "--tool=memcheck",
    "--leak-check=full",
    "--show-reachable=no",
    "--track-origins=yes",
    "--show-leak-kinds=all",
    "--num-callers=20",
    "-v",
    "--workaround-gcc296-bugs=yes",
];

// ============================================================================
// COMMAND
// ============================================================================

/// How to invoke the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorCommand {
    pub binary: PathBuf,
    pub config_dir: PathBuf,
    pub poll_delay: u64,
    pub db_name: String,
    pub show_messages: bool,
    pub show_rows: bool,
    pub cdb_name: String,
    pub under_valgrind: bool,
    pub valgrind_log: PathBuf,
}

impl SimulatorCommand {
    pub fn new(binary: impl Into<PathBuf>, config_dir: impl Into<PathBuf>, db_name: impl Into<String>) -> Self {
        let config_dir = config_dir.into();
        let valgrind_log = config_dir.join("..").join("log").join("valgrind-tmq.log");
        Self {
            binary: binary.into(),
            config_dir,
            poll_delay: DEFAULT_POLL_DELAY,
            db_name: db_name.into(),
            show_messages: true,
            show_rows: true,
            cdb_name: tmqrig_core::COORDINATION_DB.to_string(),
            under_valgrind: false,
            valgrind_log,
        }
    }

    /// Binary, config dir and coordination database from the harness config.
    pub fn from_config(config: &HarnessConfig, db_name: impl Into<String>) -> Self {
        Self::new(config.sim_binary_path(), config.client_cfg_dir(), db_name)
            .with_cdb(config.coordination_db.clone())
    }

    pub fn with_poll_delay(mut self, poll_delay: u64) -> Self {
        self.poll_delay = poll_delay;
        self
    }

    pub fn with_show_messages(mut self, show: bool) -> Self {
        self.show_messages = show;
        self
    }

    pub fn with_show_rows(mut self, show: bool) -> Self {
        self.show_rows = show;
        self
    }

    pub fn with_cdb(mut self, cdb_name: impl Into<String>) -> Self {
        self.cdb_name = cdb_name.into();
        self
    }

    pub fn with_valgrind(mut self, under_valgrind: bool) -> Self {
        self.under_valgrind = under_valgrind;
        self
    }

    pub fn with_valgrind_log(mut self, log: impl Into<PathBuf>) -> Self {
        self.valgrind_log = log.into();
        self
    }

    /// Simulator arguments: `-c <cfg> -y <delay> -d <db> -g <0|1> -r <0|1> -w <cdb>`.
    pub fn args(&self) -> Vec<String> {
        vec![
            "-c".to_string(),
            self.config_dir.display().to_string(),
            "-y".to_string(),
            self.poll_delay.to_string(),
            "-d".to_string(),
            self.db_name.clone(),
            "-g".to_string(),
            flag(self.show_messages),
            "-r".to_string(),
            flag(self.show_rows),
            "-w".to_string(),
            self.cdb_name.clone(),
        ]
    }

    /// Program actually executed.
    pub fn program(&self) -> &Path {
        if self.under_valgrind {
            Path::new(VALGRIND)
        } else {
            &self.binary
        }
    }

    /// Arguments handed to [`Self::program`].
    pub fn program_args(&self) -> Vec<String> {
        if !self.under_valgrind {
            return self.args();
        }
        let mut args = vec![format!("--log-file={}", self.valgrind_log.display())];
        args.extend(VALGRIND_FLAGS.iter().map(|f| f.to_string()));
        args.push(self.binary.display().to_string());
        args.extend(self.args());
        args
    }

    /// Printable command line, for logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program().display().to_string();
        for arg in self.program_args() {
            line.push(' ');
            line.push_str(&arg);
        }
        line
    }
}

fn flag(on: bool) -> String {
    String::from(if on { "1" } else { "0" })
}

// ============================================================================
// PROCESS HANDLE
// ============================================================================

/// How the simulator ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
    /// Killed by the harness rather than exiting on its own
    pub killed: bool,
}

/// Supervised handle to a running simulator.
#[derive(Debug)]
pub struct SimulatorProcess {
    pid: Option<u32>,
    program: String,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<()>,
}

impl SimulatorProcess {
    /// OS process id, `None` if the child was reaped before it was read.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Completion channel; holds `Some` once the child has exited.
    pub fn exited(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Exit info if the child already finished.
    pub fn try_status(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Wait for the child to exit, however long it takes.
    pub async fn wait(&mut self) -> HarnessResult<ExitInfo> {
        let status = match self.exit_rx.wait_for(Option::is_some).await {
            Ok(status) => *status,
            Err(_) => None,
        };
        status.ok_or_else(|| HarnessError::WorkerFailed {
            worker: self.program.clone(),
            reason: "supervisor stopped without reporting an exit".to_string(),
        })
    }

    /// Kill the child if it is still running and wait for the supervisor to
    /// record the exit.
    pub async fn kill(&mut self) -> HarnessResult<ExitInfo> {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        self.wait().await
    }

    /// Wait up to `timeout` for the child to exit; kill it on expiry.
    pub async fn join(mut self, timeout: Duration) -> HarnessResult<ExitInfo> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => {
                if let Ok(info) = &result {
                    tracing::info!(pid = ?self.pid, code = ?info.code, success = info.success, "Simulator exited");
                }
                result
            }
            Err(_) => {
                tracing::warn!(pid = ?self.pid, timeout = ?timeout, "Simulator did not exit in time, killing");
                self.kill().await?;
                Err(HarnessError::wait_exceeded(
                    format!("{} exit", self.program),
                    timeout,
                ))
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }
}

impl Drop for SimulatorProcess {
    fn drop(&mut self) {
        if self.try_status().is_none() {
            if let Some(tx) = self.kill_tx.take() {
                tracing::warn!(pid = ?self.pid, program = %self.program, "Killing simulator on drop");
                let _ = tx.send(());
            }
        }
    }
}

// ============================================================================
// LAUNCH
// ============================================================================

/// Start the simulator with all standard streams discarded.
///
/// Must be called from within a tokio runtime.
pub fn launch(command: &SimulatorCommand) -> HarnessResult<SimulatorProcess> {
    let program = command.program().display().to_string();
    let mut child = Command::new(command.program())
        .args(command.program_args())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| HarnessError::Launch {
            program: program.clone(),
            reason: e.to_string(),
        })?;

    let pid = child.id();
    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    let supervisor = tokio::spawn(async move {
        let info = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => ExitInfo {
                    code: status.code(),
                    success: status.success(),
                    killed: false,
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to wait on simulator");
                    ExitInfo { code: None, success: false, killed: false }
                }
            },
            // Fires on an explicit kill and when the handle is dropped.
            _ = kill_rx => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill simulator");
                }
                ExitInfo { code: None, success: false, killed: true }
            }
        };
        exit_tx.send_replace(Some(info));
    });

    tracing::info!(pid = ?pid, cmd = %command.command_line(), "Simulator launched");
    Ok(SimulatorProcess {
        pid,
        program,
        exit_rx,
        kill_tx: Some(kill_tx),
        supervisor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_exact_order() {
        let cmd = SimulatorCommand::new("/opt/td/build/bin/tmq_sim", "/opt/sim/psim/cfg", "dbt")
            .with_poll_delay(20)
            .with_show_rows(false);
        assert_eq!(
            cmd.args(),
            vec!["-c", "/opt/sim/psim/cfg", "-y", "20", "-d", "dbt", "-g", "1", "-r", "0", "-w", "cdb"]
        );
        assert_eq!(cmd.program(), Path::new("/opt/td/build/bin/tmq_sim"));
    }

    #[test]
    fn test_valgrind_wraps_binary() {
        let cmd = SimulatorCommand::new("/bin/tmq_sim", "/cfg", "dbt")
            .with_valgrind(true)
            .with_valgrind_log("/tmp/vg.log");
        let args = cmd.program_args();
        assert_eq!(cmd.program(), Path::new("valgrind"));
        assert_eq!(args[0], "--log-file=/tmp/vg.log");
        assert_eq!(args[1], "--tool=memcheck");
        assert_eq!(args[9], "/bin/tmq_sim");
        assert_eq!(&args[10..], cmd.args().as_slice());
        assert!(cmd.command_line().starts_with("valgrind --log-file=/tmp/vg.log --tool=memcheck"));
    }

    #[test]
    fn test_from_config_uses_build_tree() {
        let config = HarnessConfig {
            build_dir: PathBuf::from("/src/td/debug"),
            ..HarnessConfig::default()
        };
        let cmd = SimulatorCommand::from_config(&config, "dbt");
        assert_eq!(cmd.binary, config.sim_binary_path());
        assert_eq!(cmd.config_dir, config.client_cfg_dir());
        assert_eq!(cmd.cdb_name, "cdb");
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let cmd = SimulatorCommand::new("/nonexistent/tmq_sim", "/cfg", "dbt");
        let err = launch(&cmd).unwrap_err();
        assert!(matches!(err, HarnessError::Launch { .. }));
    }

    // `/bin/sh -c <cfg> ...` runs the config dir argument as a script.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_join_reports_exit_code() {
        let cmd = SimulatorCommand::new("/bin/sh", "exit 3", "dbt");
        let process = launch(&cmd).unwrap();
        assert!(process.pid().is_some());
        let info = process.join(Duration::from_secs(10)).await.unwrap();
        assert_eq!(info.code, Some(3));
        assert!(!info.success);
        assert!(!info.killed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_join_timeout_kills_child() {
        let cmd = SimulatorCommand::new("/bin/sh", "sleep 30", "dbt");
        let process = launch(&cmd).unwrap();
        let mut exited = process.exited();

        let err = process.join(Duration::from_millis(200)).await.unwrap_err();
        assert!(err.is_wait_exceeded());
        let info = *exited.wait_for(Option::is_some).await.unwrap();
        assert!(info.unwrap().killed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_drop_kills_running_child() {
        let cmd = SimulatorCommand::new("/bin/sh", "sleep 30", "dbt");
        let process = launch(&cmd).unwrap();
        let mut exited = process.exited();
        assert!(process.try_status().is_none());
        drop(process);

        let info = *tokio::time::timeout(Duration::from_secs(10), exited.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap();
        assert!(info.unwrap().killed);
    }
}
