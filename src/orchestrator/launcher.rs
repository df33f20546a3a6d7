use std::env;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};

use crate::error_handling::types::OrchestratorError;
use crate::probe::engine::{ProbeEngine, ProbeSpec};

/// Control handle for one launched probe instance.
///
/// `signal_stop` is the only lever: the instance drains and terminates on
/// its own schedule, and the exit receiver fires once it has.
pub struct ProbeHandle {
    pub test_id: String,
    stop_tx: watch::Sender<bool>,
    exit: Option<oneshot::Receiver<()>>,
}

impl ProbeHandle {
    pub fn new(
        test_id: String,
        stop_tx: watch::Sender<bool>,
        exit: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            test_id,
            stop_tx,
            exit: Some(exit),
        }
    }

    /// Asks the instance to stop. Idempotent; the instance may already be
    /// gone, which is fine.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Takes the exit receiver, once. Whoever takes it owns waiting for the
    /// instance to finish.
    pub fn take_exit(&mut self) -> Option<oneshot::Receiver<()>> {
        self.exit.take()
    }
}

/// Seam between the manager and however probe instances actually run.
pub trait ProbeLauncher: Send + Sync {
    fn launch(&self, spec: &ProbeSpec) -> Result<ProbeHandle, OrchestratorError>;
}

/// Runs each probe as a child process of this binary (`pathprobe probe ...`),
/// so an instance survives a manager restart and a wedged instance cannot
/// take the manager down with it.
pub struct ProcessLauncher {
    stop_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(stop_timeout: Duration) -> Self {
        Self { stop_timeout }
    }
}

impl ProbeLauncher for ProcessLauncher {
    fn launch(&self, spec: &ProbeSpec) -> Result<ProbeHandle, OrchestratorError> {
        let exe = env::current_exe()
            .map_err(|e| OrchestratorError::LaunchFailed(format!("current_exe: {}", e)))?;

        let mut command = Command::new(exe);
        command
            .arg("probe")
            .arg("--target")
            .arg(&spec.target)
            .arg("--port")
            .arg(spec.port.to_string())
            .arg("--rate")
            .arg(spec.rate_pps.to_string())
            .arg("--id")
            .arg(&spec.test_id)
            .arg("--stats-file")
            .arg(&spec.stats_file)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(label) = &spec.label {
            command.arg("--label").arg(label);
        }

        let mut child = command
            .spawn()
            .map_err(|e| OrchestratorError::LaunchFailed(format!("spawn: {}", e)))?;

        let test_id = spec.test_id.clone();
        info!(
            "Launched probe {} as pid {:?}",
            test_id,
            child.id()
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(relay_output(test_id.clone(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_output(test_id.clone(), "stderr", stderr));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = oneshot::channel();
        let stop_timeout = self.stop_timeout;
        let monitor_id = test_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => info!("Probe {} exited: {}", monitor_id, status),
                        Err(e) => warn!("Probe {} wait failed: {}", monitor_id, e),
                    }
                }
                _ = wait_for_stop(stop_rx) => {
                    if let Some(pid) = child.id() {
                        terminate(pid);
                    }
                    match tokio::time::timeout(stop_timeout, child.wait()).await {
                        Ok(Ok(status)) => info!("Probe {} stopped: {}", monitor_id, status),
                        Ok(Err(e)) => warn!("Probe {} wait failed: {}", monitor_id, e),
                        Err(_) => {
                            warn!(
                                "Probe {} ignored SIGTERM for {:?}, killing",
                                monitor_id, stop_timeout
                            );
                            let _ = child.kill().await;
                        }
                    }
                }
            }
            let _ = exit_tx.send(());
        });

        Ok(ProbeHandle::new(test_id, stop_tx, exit_rx))
    }
}

/// Runs each probe as a task inside this process. The default for embedded
/// use and tests; a crashed manager takes its instances with it.
pub struct TaskLauncher;

impl ProbeLauncher for TaskLauncher {
    fn launch(&self, spec: &ProbeSpec) -> Result<ProbeHandle, OrchestratorError> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = oneshot::channel();
        let spec = spec.clone();
        let test_id = spec.test_id.clone();
        let task_id = test_id.clone();
        tokio::spawn(async move {
            let mut engine = ProbeEngine::new(spec);
            if let Err(e) = engine.run(stop_rx).await {
                error!("Probe {} failed: {}", task_id, e);
            }
            let _ = exit_tx.send(());
        });
        Ok(ProbeHandle::new(test_id, stop_tx, exit_rx))
    }
}

async fn relay_output<R>(test_id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[{} {}] {}", test_id, stream, line);
    }
}

/// Resolves once the stop signal fires. If the sender is dropped without
/// signaling, never resolves; the sibling `child.wait()` branch decides.
async fn wait_for_stop(mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    // SIGTERM; the probe binary drains and writes its final snapshot on it.
    let _ = std::process::Command::new("kill").arg(pid.to_string()).status();
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}
