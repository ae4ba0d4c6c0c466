//! Exec and attach session types.
//!
//! Shared by the synchronous exec path (a single bounded RPC) and the
//! streaming bridge.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default ExecSync timeout: 5 seconds.
pub const DEFAULT_EXEC_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Whole seconds for a CRI timeout field, rounded up and at least 1.
///
/// CRI timeouts are integral seconds where 0 means "no timeout", so a
/// sub-second duration must not truncate to 0.
pub fn wire_timeout_secs(timeout: Duration) -> i64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

/// Type of interactive streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Exec,
    Attach,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exec => write!(f, "exec"),
            Self::Attach => write!(f, "attach"),
        }
    }
}

/// Parameters of an exec or attach session against one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSession {
    pub kind: SessionKind,
    /// Target container ID.
    pub container_id: String,
    /// Command and arguments (exec only; ignored for attach).
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Allocate a pseudo-terminal; stdout and stderr are combined.
    #[serde(default)]
    pub tty: bool,
    /// Forward local stdin to the session.
    #[serde(default)]
    pub stdin: bool,
    /// Timeout for synchronous exec. `None` means no command timeout.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl ExecSession {
    /// An exec session running `cmd` with stdout/stderr only.
    pub fn exec(container_id: impl Into<String>, cmd: Vec<String>) -> Self {
        Self {
            kind: SessionKind::Exec,
            container_id: container_id.into(),
            cmd,
            tty: false,
            stdin: false,
            timeout: None,
        }
    }

    /// An attach session to the container's main process.
    pub fn attach(container_id: impl Into<String>) -> Self {
        Self {
            kind: SessionKind::Attach,
            container_id: container_id.into(),
            cmd: vec![],
            tty: false,
            stdin: false,
            timeout: None,
        }
    }

    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    pub fn with_stdin(mut self, stdin: bool) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The command timeout in whole seconds, as sent on the wire (0 = none).
    pub fn timeout_secs(&self) -> i64 {
        self.timeout.map(wire_timeout_secs).unwrap_or(0)
    }
}

/// Output captured by a synchronous exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSyncOutput {
    /// Captured stdout bytes.
    pub stdout: Vec<u8>,
    /// Captured stderr bytes.
    pub stderr: Vec<u8>,
    /// Process exit code.
    pub exit_code: i32,
}
