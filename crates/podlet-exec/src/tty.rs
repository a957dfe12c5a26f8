//! TTY-aware container exec
//!
//! [`ContainerExec`] runs the command of an "exec into a container" request,
//! either attached to a pseudo-terminal (with terminal resize support) or with
//! plain stdio through [`crate::process::run`].
//!
//! Whether pseudo-terminals can be used is a [`PtyCapability`] decided once
//! when the adapter is built, so the fallback path is the same code on every
//! platform and can be exercised in tests by injecting `Unavailable`.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::{ExecContext, Input, IoStreams, Output};
use crate::error::{command_line, Error, Result};
use crate::process;

/// Bounded depth of the PTY byte queues
const PTY_QUEUE_DEPTH: usize = 64;

/// How long to keep draining terminal output after the process exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Terminal dimensions, in the JSON shape kubectl sends on the resize channel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Columns
    #[serde(rename = "Width")]
    pub width: u16,
    /// Rows
    #[serde(rename = "Height")]
    pub height: u16,
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        PtySize {
            rows: size.height,
            cols: size.width,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Whether this host can allocate pseudo-terminals
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PtyCapability {
    /// Pseudo-terminals can be allocated
    Available,
    /// No pseudo-terminal support; TTY requests fall back to plain exec
    Unavailable,
}

impl PtyCapability {
    /// Probe the host by opening (and discarding) a pseudo-terminal
    ///
    /// The result is computed once per process.
    pub fn probe() -> Self {
        static PROBE: OnceCell<PtyCapability> = OnceCell::new();
        *PROBE.get_or_init(|| match native_pty_system().openpty(PtySize::default()) {
            Ok(_) => PtyCapability::Available,
            Err(e) => {
                debug!(error = %e, "Pseudo-terminal probe failed");
                PtyCapability::Unavailable
            }
        })
    }
}

/// Runs container exec commands with or without a terminal
#[derive(Clone, Copy, Debug)]
pub struct ContainerExec {
    capability: PtyCapability,
}

impl ContainerExec {
    /// Build an adapter using the host's probed capability
    pub fn detect() -> Self {
        Self::with_capability(PtyCapability::probe())
    }

    /// Build an adapter with an explicit capability
    pub fn with_capability(capability: PtyCapability) -> Self {
        Self { capability }
    }

    /// Capability this adapter was built with
    pub fn capability(&self) -> PtyCapability {
        self.capability
    }

    /// Run a command with plain stdio
    ///
    /// Stdin is piped so a client that never closes its input does not keep
    /// the exec alive after the process exits.
    pub async fn exec(
        &self,
        ctx: &ExecContext,
        cmd: &[String],
        stdin: Option<Input>,
        stdout: Option<Output>,
        stderr: Option<Output>,
    ) -> Result<()> {
        let (name, args) = split_command(cmd)?;
        let ctx = ctx
            .with_io_streams(IoStreams {
                stdin,
                stdout,
                stderr,
            })
            .with_pipe_stdin(true);
        process::run(&ctx, name, args.iter().cloned()).await
    }

    /// Run a command attached to a terminal
    ///
    /// Resize events are applied until the source closes or the process
    /// exits. Without pseudo-terminal support the command runs with plain
    /// stdio and stdout/stderr merged into `stdout`; the caller only learns
    /// about the downgrade from the log.
    pub async fn exec_with_tty(
        &self,
        ctx: &ExecContext,
        cmd: &[String],
        stdin: Option<Input>,
        stdout: Output,
        resize: Option<mpsc::Receiver<TerminalSize>>,
    ) -> Result<()> {
        match self.capability {
            PtyCapability::Available => run_pty(ctx, cmd, stdin, stdout, resize).await,
            PtyCapability::Unavailable => {
                warn!(
                    command = %cmd.join(" "),
                    "Exec with TTY is not supported on this host, falling back to exec without TTY"
                );
                drop(resize);
                self.exec(ctx, cmd, stdin, Some(stdout.clone()), Some(stdout))
                    .await
            }
        }
    }
}

fn split_command(cmd: &[String]) -> Result<(&str, &[String])> {
    cmd.split_first()
        .map(|(name, args)| (name.as_str(), args))
        .ok_or_else(|| Error::InvalidCommand("empty command line".to_string()))
}

async fn run_pty(
    ctx: &ExecContext,
    cmd: &[String],
    stdin: Option<Input>,
    stdout: Output,
    resize: Option<mpsc::Receiver<TerminalSize>>,
) -> Result<()> {
    let (name, args) = split_command(cmd)?;
    let command = command_line(name, args);
    if ctx.is_cancelled() {
        return Err(Error::Cancelled { command });
    }
    let options = ctx.options();

    let pair = native_pty_system()
        .openpty(PtySize::default())
        .map_err(|e| Error::pty(format!("failed to open pty: {}", e)))?;

    let mut builder = CommandBuilder::new(name);
    builder.args(args);
    let cwd = match options.dir() {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir()?,
    };
    builder.cwd(cwd);
    for (key, value) in options.env_pairs() {
        builder.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(|e| Error::Start {
            command: command.clone(),
            source: io::Error::other(e.to_string()),
        })?;
    // Only the child keeps the slave side open, so reads see EOF when it exits.
    drop(pair.slave);
    debug!(command = %command, pid = ?child.process_id(), "Process started on pty");

    let mut killer = child.clone_killer();
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| Error::pty(format!("failed to clone pty reader: {}", e)))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| Error::pty(format!("failed to take pty writer: {}", e)))?;
    let master: Arc<Mutex<Box<dyn MasterPty + Send>>> = Arc::new(Mutex::new(pair.master));

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(PTY_QUEUE_DEPTH);
    tokio::task::spawn_blocking(move || read_pty(reader, out_tx));
    let output_task: JoinHandle<io::Result<()>> = tokio::spawn(async move {
        while let Some(chunk) = out_rx.recv().await {
            stdout.write_chunk(&chunk).await?;
        }
        Ok(())
    });

    let input_task = match stdin {
        Some(input) => {
            let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(PTY_QUEUE_DEPTH);
            tokio::task::spawn_blocking(move || write_pty(writer, in_rx));
            Some(tokio::spawn(forward_input(input, in_tx)))
        }
        None => {
            drop(writer);
            None
        }
    };

    let resize_task = resize.map(|mut events| {
        let master = master.clone();
        tokio::spawn(async move {
            while let Some(size) = events.recv().await {
                debug!(width = size.width, height = size.height, "Resizing pty");
                if let Err(e) = master.lock().resize(size.into()) {
                    warn!(error = %e, "Failed to resize pty");
                }
            }
        })
    });

    let mut wait = tokio::task::spawn_blocking(move || child.wait());
    let waited = tokio::select! {
        joined = &mut wait => Some(joined),
        _ = ctx.cancelled() => None,
    };

    if let Some(task) = input_task {
        task.abort();
    }
    if let Some(task) = resize_task {
        task.abort();
    }

    let status = match waited {
        Some(joined) => joined
            .map_err(|e| Error::pty(format!("wait task failed: {}", e)))?
            .map_err(|e| Error::Wait {
                command: command.clone(),
                reason: e.to_string(),
                exit_code: None,
                stderr: None,
            })?,
        None => {
            if let Err(e) = killer.kill() {
                debug!(command = %command, error = %e, "Failed to kill cancelled process");
            }
            let _ = wait.await;
            output_task.abort();
            return Err(Error::Cancelled { command });
        }
    };

    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, output_task).await {
        Ok(Ok(Err(e))) => debug!(command = %command, error = %e, "Terminal output copy failed"),
        Ok(_) => {}
        Err(_) => debug!(command = %command, "Terminal output still open after exit"),
    }
    drop(master);

    if !status.success() {
        let code = status.exit_code();
        return Err(Error::Wait {
            command,
            reason: format!("exit status: {}", code),
            exit_code: Some(code as i32),
            stderr: None,
        });
    }

    debug!(command = %command, "Process on pty exited successfully");
    Ok(())
}

/// Blocking pump from the pty master into the output queue
fn read_pty(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // EIO once the slave side is gone
            Err(_) => break,
        }
    }
}

/// Blocking pump from the input queue into the pty master
fn write_pty(mut writer: Box<dyn Write + Send>, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(chunk) = rx.blocking_recv() {
        if writer.write_all(&chunk).and_then(|_| writer.flush()).is_err() {
            break;
        }
    }
}

async fn forward_input(input: Input, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; 4096];
    match input {
        Input::Stdin => {
            let mut stdin = tokio::io::stdin();
            while let Ok(n) = stdin.read(&mut buf).await {
                if n == 0 || tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
        Input::Reader(reader) => {
            let mut reader = reader.lock().await;
            while let Ok(n) = reader.read(&mut buf).await {
                if n == 0 || tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}
