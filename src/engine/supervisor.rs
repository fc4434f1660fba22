//! Single-process supervision shared by the tunnel and virtualization engines

use crate::process::{CommandSpec, Process, ProcessRunner};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long `stop` waits for a killed process to be reaped
const STOP_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Starting,
    Active,
    Exited,
    Killed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Starting => write!(f, "starting"),
            EngineState::Active => write!(f, "active"),
            EngineState::Exited => write!(f, "exited"),
            EngineState::Killed => write!(f, "killed"),
        }
    }
}

struct Inner {
    state: EngineState,
    process: Option<Arc<dyn Process>>,
    last_error: Option<String>,
    /// Bumped on every start and stop so a monitor from an older run leaves state alone
    generation: u64,
}

/// Owns at most one running process
pub struct Supervisor {
    name: &'static str,
    runner: Arc<dyn ProcessRunner>,
    inner: Arc<Mutex<Inner>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Supervisor {
    pub fn new(name: &'static str, runner: Arc<dyn ProcessRunner>) -> Self {
        Supervisor {
            name,
            runner,
            inner: Arc::new(Mutex::new(Inner {
                state: EngineState::Idle,
                process: None,
                last_error: None,
                generation: 0,
            })),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Spawn `spec` unless a process is already active
    pub async fn start(&self, spec: CommandSpec) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        {
            let mut inner = self.inner.lock();
            if inner.state == EngineState::Active {
                debug!("{} already active, start ignored", self.name);
                return Ok(());
            }
            inner.state = EngineState::Starting;
        }

        let process = match self.runner.start(&spec).await {
            Ok(p) => p,
            Err(e) => {
                let mut inner = self.inner.lock();
                inner.state = EngineState::Idle;
                inner.last_error = Some(e.to_string());
                return Err(e);
            }
        };

        let generation = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.state = EngineState::Active;
            inner.process = Some(process.clone());
            inner.last_error = None;
            inner.generation
        };
        info!("{} started (pid {:?})", self.name, process.id());

        let inner = self.inner.clone();
        let name = self.name;
        tokio::spawn(async move {
            let outcome = process.wait().await;
            let mut inner = inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.state = EngineState::Exited;
            inner.process = None;
            let message = match outcome {
                Ok(()) => Error::ProcessExit(format!("{} exited", name)).to_string(),
                Err(Error::ProcessExit(msg)) => Error::ProcessExit(msg).to_string(),
                Err(e) => Error::ProcessExit(e.to_string()).to_string(),
            };
            warn!("{} {}", name, message);
            inner.last_error = Some(message);
        });

        Ok(())
    }

    /// Kill the active process. No-op when nothing is running.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let process = {
            let mut inner = self.inner.lock();
            if inner.state != EngineState::Active {
                return Ok(());
            }
            inner.generation += 1;
            inner.state = EngineState::Killed;
            inner.process.take()
        };

        let Some(process) = process else {
            return Ok(());
        };
        info!("Stopping {} (pid {:?})", self.name, process.id());
        process.kill()?;
        if timeout(STOP_REAP_TIMEOUT, process.wait()).await.is_err() {
            warn!("{} did not exit within {:?} of kill", self.name, STOP_REAP_TIMEOUT);
        }
        Ok(())
    }

    pub fn state(&self) -> EngineState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == EngineState::Active
    }

    /// Spawn failure or exit reason of the latest run
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::mock::MockRunner;

    fn spec() -> CommandSpec {
        CommandSpec::new("warp-plus", vec!["--bind".into(), "127.0.0.1:0".into()])
    }

    #[tokio::test]
    async fn test_double_start_spawns_once() {
        let runner = MockRunner::new();
        let sup = Supervisor::new("warp-plus", Arc::new(runner.clone()));

        sup.start(spec()).await.unwrap();
        sup.start(spec()).await.unwrap();

        assert_eq!(runner.start_count(), 1);
        assert!(sup.is_active());
        sup.stop().await.unwrap();
        assert_eq!(sup.state(), EngineState::Killed);
    }

    #[tokio::test]
    async fn test_stop_while_idle() {
        let sup = Supervisor::new("sb-helper", Arc::new(MockRunner::new()));
        sup.stop().await.unwrap();
        sup.stop().await.unwrap();
        assert_eq!(sup.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_spawn_failure_recorded() {
        let runner = MockRunner::new().fail_when(|_| true);
        let sup = Supervisor::new("warp-plus", Arc::new(runner));
        let err = sup.start(spec()).await.unwrap_err();
        assert!(matches!(err, Error::SpawnFailed { .. }));
        assert!(!sup.is_active());
        assert!(sup.last_error().is_some());
    }

    #[tokio::test]
    async fn test_monitor_records_exit() {
        let runner = MockRunner::new();
        let sup = Supervisor::new("warp-plus", Arc::new(runner.clone()));
        sup.start(spec()).await.unwrap();

        runner.processes()[0].exit(Err("exit status: 1".into()));
        for _ in 0..50 {
            if !sup.is_active() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sup.state(), EngineState::Exited);
        assert!(sup.last_error().unwrap().contains("exit status: 1"));
    }

    #[tokio::test]
    async fn test_stale_monitor_does_not_clear_new_run() {
        let runner = MockRunner::new();
        let sup = Supervisor::new("warp-plus", Arc::new(runner.clone()));

        sup.start(spec()).await.unwrap();
        sup.stop().await.unwrap();
        sup.start(spec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(sup.is_active());
        assert_eq!(runner.processes()[0].kill_count(), 1);
        assert_eq!(runner.processes()[1].kill_count(), 0);
    }
}
