//! Owns a single backend child process: spawns it on demand, health-gates
//! the spawn, and tears it down with a SIGTERM/SIGKILL escalation when the
//! [`wakeproxy_drain::Drainable`] decides it's time.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use wakeproxy_core::{PidFile, Timeouts, WakeproxyError};
use wakeproxy_drain::{Drainable, Status};
use wakeproxy_health::HealthProber;

const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// The operations the lifecycle state machine drives: bring the backend up
/// and gate on health, run a unit of work against it, and report whether
/// it's currently serving. A second implementation — e.g. one that
/// checkpoint/restores a frozen backend instead of exec/kill — would slot
/// in here; only the exec+kill version is needed today.
pub trait ProcessController: Send + Sync {
    /// Runs `job`, starting the backend first if it isn't already up.
    fn exec<Fut>(&self, job: Fut) -> impl Future<Output = Result<(), WakeproxyError>> + Send
    where
        Fut: Future<Output = ()> + Send + 'static;

    fn is_waked(&self) -> impl Future<Output = bool> + Send;

    /// The backend's OS pid, if it has ever been started.
    fn pid(&self) -> Option<u32>;
}

/// Starts the backend with `Command::spawn`, health-gates it, and stops it
/// with SIGTERM followed by SIGKILL after a five-second grace period.
pub struct ExecKillController {
    command: String,
    args: Vec<String>,
    health_check_target: Url,
    timeouts: Timeouts,
    pid_file: PidFile,
    prober: HealthProber,
    child: Mutex<Option<Child>>,
    pid: AtomicU32,
    /// Requests served since the last start, kept only to give `stop`'s
    /// log line the same context the original implementation logged.
    access: AtomicU64,
    drainable: OnceLock<Drainable<WakeproxyError>>,
}

impl ExecKillController {
    /// Builds the controller and wires its lifecycle to `cancellation`: a
    /// cancelled token force-stops the backend and removes the pid file
    /// unconditionally, independent of whatever the drainable's own state
    /// happens to be at that moment.
    pub fn new(
        command: String,
        args: Vec<String>,
        health_check_target: Url,
        timeouts: Timeouts,
        pid_file: PidFile,
        cancellation: CancellationToken,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            command,
            args,
            health_check_target,
            timeouts,
            pid_file,
            prober: HealthProber::new(),
            child: Mutex::new(None),
            pid: AtomicU32::new(0),
            access: AtomicU64::new(0),
            drainable: OnceLock::new(),
        });

        let start_ctl = controller.clone();
        let stop_ctl = controller.clone();
        let transition_ctl = controller.clone();
        let drainable = Drainable::new(
            move || {
                let ctl = start_ctl.clone();
                Box::pin(async move { ctl.start_process().await })
            },
            move || {
                let ctl = stop_ctl.clone();
                Box::pin(async move { ctl.stop_process().await })
            },
            timeouts.drain,
            move |status| transition_ctl.on_transition(status),
        );
        controller
            .drainable
            .set(drainable)
            .unwrap_or_else(|_| unreachable!("drainable is set exactly once, in new()"));

        let cancel_ctl = controller.clone();
        tokio::spawn(async move {
            cancellation.cancelled().await;
            if let Err(e) = cancel_ctl.stop_process().await {
                warn!(error = %e, "force-stop on shutdown failed");
            }
            cancel_ctl.pid_file.remove();
            cancel_ctl.drainable().terminate().await;
        });

        controller
    }

    fn drainable(&self) -> &Drainable<WakeproxyError> {
        self.drainable
            .get()
            .expect("drainable is always set before the controller is handed out")
    }

    fn on_transition(&self, status: Status) {
        info!(%status, "backend lifecycle transition");
        if status == Status::Failed {
            self.pid_file.remove();
        }
    }

    async fn start_process(&self) -> Result<(), WakeproxyError> {
        self.access.store(0, Ordering::SeqCst);

        let mut command = Command::new(&self.command);
        command.args(&self.args);
        command.stdout(std::process::Stdio::inherit());
        command.stderr(std::process::Stdio::inherit());

        let child = command
            .spawn()
            .map_err(|e| WakeproxyError::Spawn(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| WakeproxyError::Spawn("backend exited before it could be tracked".into()))?;
        self.pid.store(pid, Ordering::SeqCst);
        info!(pid, command = %self.command, "backend process started");
        *self.child.lock().await = Some(child);

        let healthy = self
            .prober
            .wait_until_healthy(&self.health_check_target, self.timeouts.wake)
            .await;
        if !healthy {
            return Err(WakeproxyError::HealthCheckTimeout(self.timeouts.wake));
        }

        self.pid_file.write(Some(&self.health_check_target))
    }

    async fn stop_process(&self) -> Result<(), WakeproxyError> {
        let pid = self.pid.load(Ordering::SeqCst);
        info!(pid, access = self.access.load(Ordering::SeqCst), "stopping backend process");
        self.pid_file.write(None)?;

        let mut child = {
            let mut guard = self.child.lock().await;
            match guard.take() {
                Some(child) => child,
                None => return Ok(()),
            }
        };

        let nix_pid = Pid::from_raw(pid as i32);
        if let Err(errno) = kill(nix_pid, Signal::SIGTERM) {
            if errno == nix::errno::Errno::ESRCH {
                let _ = child.wait().await;
                return Ok(());
            }
            return Err(WakeproxyError::Stop(errno.to_string()));
        }

        // The grace period is a floor, not a ceiling: however long SIGKILL
        // takes to land, the child is always reaped afterwards.
        if tokio::time::timeout(KILL_GRACE_PERIOD, child.wait())
            .await
            .is_err()
        {
            warn!(pid, "backend did not exit after SIGTERM, sending SIGKILL");
            let _ = kill(nix_pid, Signal::SIGKILL);
            let _ = child.wait().await;
        }

        Ok(())
    }
}

impl ProcessController for ExecKillController {
    async fn exec<Fut>(&self, job: Fut) -> Result<(), WakeproxyError>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.access.fetch_add(1, Ordering::SeqCst);
        self.drainable().exec(job).await
    }

    async fn is_waked(&self) -> bool {
        self.drainable().is_waked().await
    }

    fn pid(&self) -> Option<u32> {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            None
        } else {
            Some(pid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicBool;
    use wakeproxy_core::PidFile;

    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn spawns_waits_for_health_and_stops_on_cancellation() {
        // `sh -c` backend that listens nowhere: the health check is
        // directed at a port nothing will ever answer on, so `start`
        // should time out quickly rather than hang the test.
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("wakeproxy.pid");
        let port = free_port().await;
        let target = Url::parse(&format!("http://127.0.0.1:{port}/health")).unwrap();

        let cancellation = CancellationToken::new();
        let controller = ExecKillController::new(
            "sleep".to_string(),
            vec!["2".to_string()],
            target,
            Timeouts {
                wake: Duration::from_millis(300),
                drain: Duration::from_secs(60),
                health_check: Duration::from_millis(100),
            },
            PidFile::new(&pid_path),
            cancellation.clone(),
        );

        let result = controller.exec(async {}).await;
        assert!(matches!(result, Err(WakeproxyError::HealthCheckTimeout(_))));

        let _ = AtomicBool::new(false);
        cancellation.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn pid_is_none_before_first_start() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("wakeproxy.pid");
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let target = Url::parse(&format!("http://{addr}/health")).unwrap();
        let controller = ExecKillController::new(
            "true".to_string(),
            vec![],
            target,
            Timeouts {
                wake: Duration::from_millis(50),
                drain: Duration::from_secs(60),
                health_check: Duration::from_millis(50),
            },
            PidFile::new(&pid_path),
            CancellationToken::new(),
        );
        assert_eq!(controller.pid(), None);
    }
}
