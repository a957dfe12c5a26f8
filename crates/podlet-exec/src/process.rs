//! Process execution bridge
//!
//! Launches a local process according to an [`ExecContext`], wires its stdio,
//! waits for it and maps failures into [`Error`].
//!
//! Stream handling:
//! - stdin from a reader is copied into the child's pipe. With `pipe_stdin`
//!   the copy is detached and best-effort; otherwise the run waits for it.
//! - stdout/stderr writers are fed by copy tasks that finish before `run`
//!   returns.
//! - without an explicit stderr, stderr is captured and attached to the
//!   failure so the message explains what went wrong.

use std::io;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::context::{ExecContext, Input, Output, SharedReader};
use crate::error::{command_line, Error, Result};

const COPY_BUFFER_SIZE: usize = 8192;

/// Run a command to completion
///
/// Returns `Ok(())` only when the process exits with status 0.
pub async fn run<I, S>(ctx: &ExecContext, name: &str, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    let command = command_line(name, &args);
    if ctx.is_cancelled() {
        return Err(Error::Cancelled { command });
    }

    let options = ctx.options();
    let streams = options.streams();

    let mut cmd = Command::new(name);
    cmd.args(&args).kill_on_drop(true);
    if !options.env().is_empty() {
        // Command starts from the ambient environment; overlay entries win.
        cmd.envs(options.env_pairs());
    }
    if let Some(dir) = options.dir() {
        cmd.current_dir(dir);
    }

    cmd.stdin(match &streams.stdin {
        None => Stdio::null(),
        Some(Input::Stdin) => Stdio::inherit(),
        Some(Input::Reader(_)) => Stdio::piped(),
    });
    cmd.stdout(output_stdio(streams.stdout.as_ref()).unwrap_or_else(Stdio::null));
    cmd.stderr(output_stdio(streams.stderr.as_ref()).unwrap_or_else(Stdio::piped));

    let mut child = cmd.spawn().map_err(|source| Error::Start {
        command: command.clone(),
        source,
    })?;
    debug!(command = %command, pid = ?child.id(), "Process started");

    let mut attached: Vec<JoinHandle<io::Result<()>>> = Vec::new();

    if let (Some(Input::Reader(reader)), Some(stdin)) = (&streams.stdin, child.stdin.take()) {
        let copy = tokio::spawn(copy_input(reader.clone(), stdin));
        if options.pipe_stdin() {
            let command = command.clone();
            tokio::spawn(async move {
                if let Ok(Err(e)) = copy.await {
                    trace!(command = %command, error = %e, "Piped stdin copy ended with error");
                }
            });
        } else {
            attached.push(copy);
        }
    }

    if let (Some(out @ Output::Writer(_)), Some(stdout)) = (&streams.stdout, child.stdout.take())
    {
        attached.push(tokio::spawn(copy_output(stdout, out.clone())));
    }

    let mut captured = None;
    match (&streams.stderr, child.stderr.take()) {
        (None, Some(stderr)) => captured = Some(tokio::spawn(capture(stderr))),
        (Some(out @ Output::Writer(_)), Some(stderr)) => {
            attached.push(tokio::spawn(copy_output(stderr, out.clone())));
        }
        _ => {}
    }

    let status = tokio::select! {
        status = child.wait() => status,
        _ = ctx.cancelled() => {
            if let Err(e) = child.kill().await {
                debug!(command = %command, error = %e, "Failed to kill cancelled process");
            }
            return Err(Error::Cancelled { command });
        }
    };

    let status = status.map_err(|e| Error::Wait {
        command: command.clone(),
        reason: e.to_string(),
        exit_code: None,
        stderr: None,
    })?;

    let mut copy_error = None;
    for handle in attached {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::other(e.to_string())),
        };
        if let Err(e) = result {
            copy_error.get_or_insert(e);
        }
    }

    let stderr = match captured {
        Some(handle) => handle
            .await
            .ok()
            .and_then(|result| result.ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .filter(|text| !text.is_empty()),
        None => None,
    };

    if !status.success() {
        debug!(command = %command, status = %status, "Process failed");
        return Err(Error::Wait {
            command,
            reason: status.to_string(),
            exit_code: status.code(),
            stderr,
        });
    }

    if let Some(e) = copy_error {
        return Err(Error::Wait {
            command,
            reason: e.to_string(),
            exit_code: None,
            stderr,
        });
    }

    debug!(command = %command, "Process exited successfully");
    Ok(())
}

fn output_stdio(output: Option<&Output>) -> Option<Stdio> {
    output.map(|out| match out {
        Output::Stdout => Stdio::from(io::stdout()),
        Output::Stderr => Stdio::from(io::stderr()),
        Output::Writer(_) => Stdio::piped(),
    })
}

/// Copy a shared reader into the child's stdin, closing it on EOF
///
/// A child that exits without consuming all input is not an error.
async fn copy_input(reader: SharedReader, mut stdin: ChildStdin) -> io::Result<()> {
    let mut reader = reader.lock().await;
    match tokio::io::copy(&mut *reader, &mut stdin).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
        Err(e) => return Err(e),
    }
    match stdin.shutdown().await {
        Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(e),
        _ => Ok(()),
    }
}

async fn copy_output<R>(mut reader: R, out: Output) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        out.write_chunk(&buf[..n]).await?;
    }
}

async fn capture<R>(mut reader: R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}
