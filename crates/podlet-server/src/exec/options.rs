//! Exec request options

use crate::error::{Error, Result};

/// Streams and command requested by an exec call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecRequest {
    /// Command and arguments
    pub command: Vec<String>,
    /// Attach stdin
    pub stdin: bool,
    /// Attach stdout
    pub stdout: bool,
    /// Attach stderr; always off with a terminal
    pub stderr: bool,
    /// Allocate a terminal
    pub tty: bool,
}

impl ExecRequest {
    /// Parse exec query parameters
    ///
    /// `command` may repeat, one argument per occurrence. Stream flags accept
    /// `1` or `true`.
    pub fn from_query(query: Option<&str>) -> Result<Self> {
        let mut request = ExecRequest::default();
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            match key.as_ref() {
                "command" => request.command.push(value.into_owned()),
                "stdin" => request.stdin = is_set(&value),
                "stdout" => request.stdout = is_set(&value),
                "stderr" => request.stderr = is_set(&value),
                "tty" => request.tty = is_set(&value),
                _ => {}
            }
        }

        if request.command.is_empty() {
            return Err(Error::BadRequest(
                "query parameter \"command\" is required".to_string(),
            ));
        }
        if request.tty {
            request.stderr = false;
        }
        if !request.stdin && !request.stdout && !request.stderr {
            return Err(Error::BadRequest(
                "you must specify at least 1 of stdin, stdout, stderr".to_string(),
            ));
        }
        Ok(request)
    }
}

fn is_set(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
