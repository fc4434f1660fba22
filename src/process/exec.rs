//! `tokio::process` backed runner

use super::{CommandSpec, Process, ProcessRunner};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

type ExitState = Option<std::result::Result<(), String>>;

/// Spawns real child processes
#[derive(Debug, Default, Clone)]
pub struct ExecRunner;

impl ExecRunner {
    pub fn new() -> Self {
        ExecRunner
    }
}

#[async_trait]
impl ProcessRunner for ExecRunner {
    async fn start(&self, spec: &CommandSpec) -> Result<Arc<dyn Process>> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match &spec.log_path {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    if !dir.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(dir).await?;
                    }
                }
                let mut log = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                log.write_all(
                    format!("tunnelkeeper: starting {}\n", spec.command_line()).as_bytes(),
                )
                .await?;
                log.flush().await?;

                let stdout = log.into_std().await;
                let stderr = stdout.try_clone()?;
                cmd.stdout(Stdio::from(stdout))
                    .stderr(Stdio::from(stderr))
                    .env_clear()
                    .envs(sanitize_env(std::env::vars()));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::spawn_failed(spec.program.clone(), e))?;
        let pid = child.id();
        info!("Started {} (pid {:?})", spec.program, pid);

        Ok(Arc::new(ExecProcess::supervise(child, spec.program.clone())))
    }
}

/// Drop variables some engine CLIs misread as flags (`IDENTITY`, `*_IDENTITY`)
pub fn sanitize_env<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(key, _)| {
            let upper = key.to_ascii_uppercase();
            upper != "IDENTITY" && !upper.ends_with("_IDENTITY")
        })
        .collect()
}

/// Handle to a child owned by a background reaper task
pub struct ExecProcess {
    pid: Option<u32>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<ExitState>,
}

impl ExecProcess {
    fn supervise(mut child: tokio::process::Child, program: String) -> Self {
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel::<ExitState>(None);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    debug!("Killing {} (pid {:?})", program, pid);
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let outcome = match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(format!("{} exited: {}", program, status)),
                Err(e) => Err(format!("{} wait failed: {}", program, e)),
            };
            exit_tx.send_replace(Some(outcome));
        });

        ExecProcess {
            pid,
            kill_tx: Mutex::new(Some(kill_tx)),
            exit_rx,
        }
    }
}

#[async_trait]
impl Process for ExecProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&self) -> Result<()> {
        let mut rx = self.exit_rx.clone();
        let state = rx
            .wait_for(|s| s.is_some())
            .await
            .map_err(|_| Error::internal("process reaper vanished"))?
            .clone();
        match state {
            Some(Ok(())) => Ok(()),
            Some(Err(msg)) => Err(Error::ProcessExit(msg)),
            None => Err(Error::internal("process state missing")),
        }
    }

    fn kill(&self) -> Result<()> {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}
