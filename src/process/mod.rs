//! External process abstraction
//!
//! Engines never touch `tokio::process` directly. They hand a [`CommandSpec`]
//! to a [`ProcessRunner`] and get back a [`Process`] they can wait on or kill,
//! which lets the supervision and search logic run against the scripted
//! `mock::MockRunner` in tests (enabled by the `testing` feature outside this
//! crate's own unit tests).

mod exec;
#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub use exec::{sanitize_env, ExecProcess, ExecRunner};

use crate::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// What to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable path or name looked up in PATH
    pub program: String,
    /// Arguments, not including the program
    pub args: Vec<String>,
    /// Append stdout/stderr to this file instead of discarding them
    pub log_path: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args,
            log_path: None,
        }
    }

    pub fn with_log(mut self, path: Option<PathBuf>) -> Self {
        self.log_path = path;
        self
    }

    /// Value following `flag` in the argument list
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// Program and arguments joined for logging
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// A started child process
#[async_trait]
pub trait Process: Send + Sync {
    /// OS process id, if known
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit. A non-zero exit or a kill is `Error::ProcessExit`.
    async fn wait(&self) -> Result<()>;

    /// Forcibly terminate the process. Killing an exited process is not an error.
    fn kill(&self) -> Result<()>;
}

/// Starts processes
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn start(&self, spec: &CommandSpec) -> Result<Arc<dyn Process>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_value() {
        let spec = CommandSpec::new(
            "warp-plus",
            vec!["--bind".into(), "127.0.0.1:8086".into(), "--gool".into()],
        );
        assert_eq!(spec.arg_value("--bind"), Some("127.0.0.1:8086"));
        assert_eq!(spec.arg_value("--gool"), None);
        assert_eq!(spec.arg_value("--key"), None);
        assert_eq!(spec.command_line(), "warp-plus --bind 127.0.0.1:8086 --gool");
    }
}
