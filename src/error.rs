use std::io;

use thiserror::Error;

/// Everything that can go wrong inside the daemon, split by how far the
/// damage reaches: `Transport` kills a connection or a worker, `Protocol`
/// is logged and skipped, `Startup` aborts the process.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{what} (error code: {code})")]
    Transport { what: String, code: i32 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{what} (error code: {code})")]
    Startup { what: String, code: i32 },
}

impl BridgeError {
    pub fn transport(what: impl Into<String>, err: &io::Error) -> Self {
        BridgeError::Transport {
            what: what.into(),
            code: err.raw_os_error().unwrap_or(0),
        }
    }

    pub fn startup(what: impl Into<String>, err: &io::Error) -> Self {
        BridgeError::Startup {
            what: what.into(),
            code: err.raw_os_error().unwrap_or(0),
        }
    }

    /// The OS error number carried by this error, if any. Used as the
    /// process exit code when conductor construction fails.
    pub fn os_code(&self) -> i32 {
        match self {
            BridgeError::Transport { code, .. } | BridgeError::Startup { code, .. } => *code,
            BridgeError::Protocol(_) => 0,
        }
    }
}
