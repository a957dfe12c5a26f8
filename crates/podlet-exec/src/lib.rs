//! Local process execution for podlet
//!
//! Runs the commands behind container exec requests as local processes.
//!
//! # Layers
//!
//! ```text
//! ExecContext ──► ContainerExec ──► process::run ──► child process
//! (dir/env/io)    (tty or plain)    (stdio wiring, error mapping)
//! ```
//!
//! - [`ExecContext`]: immutable, cancellable option set. Derivations copy.
//! - [`run`]: launch, wire stdio, wait, map failures into [`Error`].
//! - [`ContainerExec`]: choose a pseudo-terminal or plain stdio, with a
//!   logged fallback when the host has no pseudo-terminal support.
//! - [`write_to_path`]: capture a command's output into a file.

#![deny(missing_docs)]

pub mod context;
pub mod error;
pub mod file;
pub mod process;
pub mod tty;

pub use context::{ExecContext, ExecOptions, Input, IoStreams, Output, SharedReader, SharedWriter};
pub use error::{Error, Result};
pub use file::write_to_path;
pub use process::run;
pub use tty::{ContainerExec, PtyCapability, TerminalSize};
