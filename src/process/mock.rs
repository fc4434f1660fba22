//! In-memory process runner for tests
//!
//! [`MockRunner`] records every command it is asked to start. A started
//! [`MockProcess`] can optionally open a TCP listener on the address passed
//! after `--bind`, which is what the readiness wait looks for, so the search
//! logic can be exercised end to end without real engine binaries.
//!
//! ```ignore
//! let runner = MockRunner::new().listen_when(|spec| {
//!     spec.arg_value("--test-url") == Some("http://b/")
//! });
//! ```

use super::{CommandSpec, Process, ProcessRunner};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::TcpListener;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

type Predicate = Arc<dyn Fn(&CommandSpec) -> bool + Send + Sync>;
type ExitState = Option<std::result::Result<(), String>>;

/// Records starts and hands out [`MockProcess`]es
#[derive(Clone)]
pub struct MockRunner {
    started: Arc<Mutex<Vec<CommandSpec>>>,
    processes: Arc<Mutex<Vec<Arc<MockProcess>>>>,
    listen_when: Predicate,
    fail_when: Predicate,
    exit_when: Predicate,
    next_pid: Arc<AtomicU32>,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    /// Runner whose processes never open their bind address
    pub fn new() -> Self {
        MockRunner {
            started: Arc::new(Mutex::new(Vec::new())),
            processes: Arc::new(Mutex::new(Vec::new())),
            listen_when: Arc::new(|_| false),
            fail_when: Arc::new(|_| false),
            exit_when: Arc::new(|_| false),
            next_pid: Arc::new(AtomicU32::new(1000)),
        }
    }

    /// Processes matching `pred` bind a listener on their `--bind` address
    pub fn listen_when<F>(mut self, pred: F) -> Self
    where
        F: Fn(&CommandSpec) -> bool + Send + Sync + 'static,
    {
        self.listen_when = Arc::new(pred);
        self
    }

    /// Starts matching `pred` fail as if the binary were missing
    pub fn fail_when<F>(mut self, pred: F) -> Self
    where
        F: Fn(&CommandSpec) -> bool + Send + Sync + 'static,
    {
        self.fail_when = Arc::new(pred);
        self
    }

    /// Processes matching `pred` spawn and then exit at once with a failure
    pub fn exit_when<F>(mut self, pred: F) -> Self
    where
        F: Fn(&CommandSpec) -> bool + Send + Sync + 'static,
    {
        self.exit_when = Arc::new(pred);
        self
    }

    /// Every command passed to `start`, including failed spawns
    pub fn started(&self) -> Vec<CommandSpec> {
        self.started.lock().clone()
    }

    /// Number of start calls
    pub fn start_count(&self) -> usize {
        self.started.lock().len()
    }

    /// Successfully spawned processes, in start order
    pub fn processes(&self) -> Vec<Arc<MockProcess>> {
        self.processes.lock().clone()
    }
}

#[async_trait]
impl ProcessRunner for MockRunner {
    async fn start(&self, spec: &CommandSpec) -> Result<Arc<dyn Process>> {
        self.started.lock().push(spec.clone());

        if (self.fail_when)(spec) {
            return Err(Error::spawn_failed(spec.program.clone(), "mock spawn failure"));
        }

        let listener = if (self.listen_when)(spec) {
            spec.arg_value("--bind").and_then(|addr| match TcpListener::bind(addr) {
                Ok(l) => Some(l),
                Err(e) => {
                    debug!("mock process could not bind {}: {}", addr, e);
                    None
                }
            })
        } else {
            None
        };

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let process = Arc::new(MockProcess::new(pid, spec.clone(), listener));
        if (self.exit_when)(spec) {
            process.exit(Err("exit status: 1".to_string()));
        }
        self.processes.lock().push(process.clone());
        Ok(process)
    }
}

/// A fake child process
pub struct MockProcess {
    pid: u32,
    spec: CommandSpec,
    listener: Mutex<Option<TcpListener>>,
    exit_tx: watch::Sender<ExitState>,
    killed: AtomicU32,
}

impl MockProcess {
    fn new(pid: u32, spec: CommandSpec, listener: Option<TcpListener>) -> Self {
        let (exit_tx, _) = watch::channel(None);
        MockProcess {
            pid,
            spec,
            listener: Mutex::new(listener),
            exit_tx,
            killed: AtomicU32::new(0),
        }
    }

    /// Command this process was started with
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Whether a listener is open on the bind address
    pub fn is_listening(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Number of kill calls received
    pub fn kill_count(&self) -> u32 {
        self.killed.load(Ordering::SeqCst)
    }

    /// Simulate the process exiting on its own
    pub fn exit(&self, outcome: std::result::Result<(), String>) {
        self.listener.lock().take();
        self.exit_tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(outcome);
                true
            } else {
                false
            }
        });
    }

    pub fn has_exited(&self) -> bool {
        self.exit_tx.borrow().is_some()
    }
}

#[async_trait]
impl Process for MockProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&self) -> Result<()> {
        let mut rx = self.exit_tx.subscribe();
        let state = rx
            .wait_for(|s| s.is_some())
            .await
            .map_err(|_| Error::internal("mock process dropped"))?
            .clone();
        match state {
            Some(Ok(())) => Ok(()),
            Some(Err(msg)) => Err(Error::ProcessExit(msg)),
            None => Err(Error::internal("mock process state missing")),
        }
    }

    fn kill(&self) -> Result<()> {
        self.killed.fetch_add(1, Ordering::SeqCst);
        self.exit(Err("killed".to_string()));
        Ok(())
    }
}
