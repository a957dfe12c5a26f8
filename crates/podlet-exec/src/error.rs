//! Error types for process execution

/// Result type for exec operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for exec operations
///
/// Every variant that concerns a launched command carries the full command
/// line (name plus space-joined arguments) so failures can be traced back to
/// the exact invocation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Empty command line
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Process could not be launched
    #[error("cmd start: {command}: {source}")]
    Start {
        /// Command line that failed to launch
        command: String,
        /// Underlying launch error
        #[source]
        source: std::io::Error,
    },

    /// Process launched but did not exit successfully
    #[error("cmd wait: {command}: {reason}{}", stderr_suffix(.stderr))]
    Wait {
        /// Command line that failed
        command: String,
        /// Exit status or wait failure description
        reason: String,
        /// Exit code, when the process exited normally
        exit_code: Option<i32>,
        /// Captured stderr, only when the caller supplied no error stream
        stderr: Option<String>,
    },

    /// The execution context was cancelled while the process was running
    #[error("cmd cancelled: {command}")]
    Cancelled {
        /// Command line that was interrupted
        command: String,
    },

    /// Pseudo-terminal allocation or wiring failed
    #[error("pty error: {message}")]
    Pty {
        /// Description of what failed
        message: String,
    },

    /// I/O error outside of a specific command
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Exit code of the process, if it exited with a non-zero code
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::Wait { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    /// Whether this error is the result of context cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    pub(crate) fn pty(message: impl Into<String>) -> Self {
        Error::Pty {
            message: message.into(),
        }
    }
}

fn stderr_suffix(stderr: &Option<String>) -> String {
    match stderr {
        Some(text) => format!("\n{}", text),
        None => String::new(),
    }
}

/// Render a command line the way it appears in error messages
pub(crate) fn command_line(name: &str, args: &[String]) -> String {
    if args.is_empty() {
        name.to_string()
    } else {
        format!("{} {}", name, args.join(" "))
    }
}
