//! Scoped execution context
//!
//! An [`ExecContext`] is an immutable value describing how a command should be
//! launched: working directory, environment overlay, stdio wiring and whether
//! stdin is piped. Every `with_*` call returns a new context holding its own
//! copy of the option set, so a derived scope can never change what its parent
//! (or a sibling derived from the same parent) sees.
//!
//! ```ignore
//! let base = ExecContext::new(cancel).with_dir("/work").with_env(["A=1"]);
//! let quiet = base.with_write_to(Output::writer(tokio::io::sink()));
//! podlet_exec::run(&quiet, "make", ["build"]).await?;
//! ```
//!
//! The context also carries the [`CancellationToken`] of the call chain.
//! Cancelling it kills any process started from the context.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Input stream shared between the context and the process it launches
pub type SharedReader = Arc<Mutex<Box<dyn AsyncRead + Send + Unpin>>>;

/// Output stream shared between the context and the process it launches
pub type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Source for a command's stdin
#[derive(Clone)]
pub enum Input {
    /// This process's own stdin
    Stdin,
    /// Arbitrary async reader
    Reader(SharedReader),
}

impl Input {
    /// Wrap an async reader as a command input
    pub fn reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Input::Reader(Arc::new(Mutex::new(Box::new(reader))))
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::Stdin => f.write_str("Input::Stdin"),
            Input::Reader(_) => f.write_str("Input::Reader(..)"),
        }
    }
}

/// Destination for a command's stdout or stderr
#[derive(Clone)]
pub enum Output {
    /// This process's own stdout
    Stdout,
    /// This process's own stderr
    Stderr,
    /// Arbitrary async writer
    Writer(SharedWriter),
}

impl Output {
    /// Wrap an async writer as a command output
    pub fn writer<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Output::Writer(Arc::new(Mutex::new(Box::new(writer))))
    }

    /// Write a chunk and flush it
    ///
    /// The writer lock is held only for the chunk, so two producers sharing
    /// one output interleave at chunk granularity.
    pub async fn write_chunk(&self, chunk: &[u8]) -> std::io::Result<()> {
        match self {
            Output::Stdout => {
                let mut out = tokio::io::stdout();
                out.write_all(chunk).await?;
                out.flush().await
            }
            Output::Stderr => {
                let mut out = tokio::io::stderr();
                out.write_all(chunk).await?;
                out.flush().await
            }
            Output::Writer(writer) => {
                let mut writer = writer.lock().await;
                writer.write_all(chunk).await?;
                writer.flush().await
            }
        }
    }

    /// Shut down the underlying writer, signalling EOF to its reader
    pub async fn shutdown(&self) -> std::io::Result<()> {
        match self {
            Output::Writer(writer) => writer.lock().await.shutdown().await,
            Output::Stdout | Output::Stderr => Ok(()),
        }
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Stdout => f.write_str("Output::Stdout"),
            Output::Stderr => f.write_str("Output::Stderr"),
            Output::Writer(_) => f.write_str("Output::Writer(..)"),
        }
    }
}

/// Standard streams for a command
///
/// `None` means the stream is not connected: stdin and stdout go to the null
/// device, and stderr is captured for error reporting.
#[derive(Clone, Debug, Default)]
pub struct IoStreams {
    /// Command stdin
    pub stdin: Option<Input>,
    /// Command stdout
    pub stdout: Option<Output>,
    /// Command stderr
    pub stderr: Option<Output>,
}

/// Effective options for launching a command
#[derive(Clone, Debug, Default)]
pub struct ExecOptions {
    dir: Option<PathBuf>,
    env: Vec<String>,
    streams: IoStreams,
    pipe_stdin: bool,
}

impl ExecOptions {
    /// Working directory override; `None` inherits the caller's directory
    pub fn dir(&self) -> Option<&Path> {
        self.dir
            .as_deref()
            .filter(|dir| !dir.as_os_str().is_empty())
    }

    /// Environment overlay entries in `KEY=VALUE` form, in insertion order
    pub fn env(&self) -> &[String] {
        &self.env
    }

    /// Standard stream wiring
    pub fn streams(&self) -> &IoStreams {
        &self.streams
    }

    /// Whether stdin is copied in a detached task instead of being awaited
    pub fn pipe_stdin(&self) -> bool {
        self.pipe_stdin
    }

    /// Overlay entries split into key/value pairs
    ///
    /// Entries without `=` cannot be expressed as a variable and are skipped.
    pub(crate) fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|entry| match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    Some((key.to_string(), value.to_string()))
                }
                _ => {
                    debug!(entry = %entry, "Skipping malformed environment entry");
                    None
                }
            })
            .collect()
    }
}

/// Immutable, cancellable execution scope
#[derive(Clone, Debug, Default)]
pub struct ExecContext {
    options: ExecOptions,
    cancel: CancellationToken,
}

impl ExecContext {
    /// Create an empty context bound to a cancellation token
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            options: ExecOptions::default(),
            cancel,
        }
    }

    /// Effective options of this scope
    pub fn options(&self) -> &ExecOptions {
        &self.options
    }

    /// Cancellation token of the call chain
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the call chain was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the call chain is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    fn derive(&self, change: impl FnOnce(&mut ExecOptions)) -> Self {
        let mut options = self.options.clone();
        change(&mut options);
        Self {
            options,
            cancel: self.cancel.clone(),
        }
    }

    /// Scope the context under a different cancellation token
    pub fn with_cancel_token(&self, cancel: CancellationToken) -> Self {
        Self {
            options: self.options.clone(),
            cancel,
        }
    }

    /// Set the working directory
    pub fn with_dir(&self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.derive(|opts| opts.dir = Some(dir))
    }

    /// Append entries to the environment overlay
    pub fn with_env<I, S>(&self, env: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let delta: Vec<String> = env.into_iter().map(Into::into).collect();
        self.derive(|opts| opts.env.extend(delta))
    }

    /// Replace the stdio wiring
    pub fn with_io_streams(&self, streams: IoStreams) -> Self {
        self.derive(|opts| opts.streams = streams)
    }

    /// Set whether stdin is piped through a detached copy task
    pub fn with_pipe_stdin(&self, pipe_stdin: bool) -> Self {
        self.derive(|opts| opts.pipe_stdin = pipe_stdin)
    }

    /// Wire the command to this process's stdin, stdout and stderr
    pub fn with_std_io(&self) -> Self {
        self.with_io_streams(IoStreams {
            stdin: Some(Input::Stdin),
            stdout: Some(Output::Stdout),
            stderr: Some(Output::Stderr),
        })
    }

    /// Use one duplex object as both stdin and stdout
    pub fn with_read_writer<T>(&self, rw: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(rw);
        self.with_io_streams(IoStreams {
            stdin: Some(Input::reader(read_half)),
            stdout: Some(Output::writer(write_half)),
            stderr: None,
        })
    }

    /// Send both stdout and stderr to one output
    pub fn with_all_write_to(&self, out: Output) -> Self {
        self.with_io_streams(IoStreams {
            stdin: None,
            stdout: Some(out.clone()),
            stderr: Some(out),
        })
    }

    /// Send stdout to an output, capturing stderr
    pub fn with_write_to(&self, out: Output) -> Self {
        self.with_io_streams(IoStreams {
            stdin: None,
            stdout: Some(out),
            stderr: None,
        })
    }

    /// Send both stdout and stderr to this process's stderr
    pub fn with_all_write_to_err_out(&self) -> Self {
        self.with_all_write_to(Output::Stderr)
    }
}
