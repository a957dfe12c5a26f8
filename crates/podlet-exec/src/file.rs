//! Capture command output to a file

use std::path::Path;

use tracing::error;

use crate::context::{ExecContext, Output};
use crate::error::{Error, Result};
use crate::process::run;

/// Run `command` with stdout and stderr written to `path`
///
/// The file is created (mode 0640 on unix) or truncated. If the output cannot
/// be synced to disk after the run, the file is removed. A command that fails
/// after launch may leave partial output behind.
pub async fn write_to_path(ctx: &ExecContext, path: impl AsRef<Path>, command: &[String]) -> Result<()> {
    let (name, args) = command
        .split_first()
        .ok_or_else(|| Error::InvalidCommand("empty command line".to_string()))?;
    let path = path.as_ref();

    let mut open = tokio::fs::OpenOptions::new();
    open.create(true).write(true).truncate(true);
    #[cfg(unix)]
    open.mode(0o640);
    let file = open.open(path).await?;
    let sync_handle = file.try_clone().await?;

    let result = run(
        &ctx.with_all_write_to(Output::writer(file)),
        name,
        args.iter().cloned(),
    )
    .await;

    if let Err(e) = sync_handle.sync_all().await {
        error!(path = %path.display(), error = %e, "Failed to sync output file");
        if let Err(e) = tokio::fs::remove_file(path).await {
            error!(path = %path.display(), error = %e, "Failed to remove output file");
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_write_to_path_captures_stdout_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");

        write_to_path(
            &ExecContext::default(),
            &path,
            &command(&["sh", "-c", "echo one; echo two >&2"]),
        )
        .await
        .unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("one\n"));
        assert!(content.contains("two\n"));
    }

    #[tokio::test]
    async fn test_write_to_path_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        tokio::fs::write(&path, "stale content that is long").await.unwrap();

        write_to_path(&ExecContext::default(), &path, &command(&["printf", "new"]))
            .await
            .unwrap();

        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "new");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_to_path_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mode.log");
        write_to_path(&ExecContext::default(), &path, &command(&["true"]))
            .await
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        // umask may clear bits but never adds any
        assert_eq!(mode & !0o640, 0);
    }

    #[tokio::test]
    async fn test_write_to_path_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_to_path(&ExecContext::default(), dir.path().join("x"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCommand(_)));
    }

    #[tokio::test]
    async fn test_write_to_path_propagates_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fail.log");
        let err = write_to_path(
            &ExecContext::default(),
            &path,
            &command(&["sh", "-c", "echo partial; exit 4"]),
        )
        .await
        .unwrap_err();

        assert_eq!(err.exit_code(), Some(4));
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "partial\n");
    }
}
