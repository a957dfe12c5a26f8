//! Port-forward request options

use crate::error::{Error, Result};

/// Most ports one connection may forward; two channels each must fit a byte
pub const MAX_PORTS: usize = 128;

/// Ports requested for one port-forward session, in request order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortForwardOptions {
    /// Requested ports; duplicates are kept
    pub ports: Vec<u16>,
}

impl PortForwardOptions {
    /// Parse the `port` query parameters of a request
    ///
    /// Each occurrence may hold a comma-separated list. Every entry must be a
    /// port number in 1..=65535.
    pub fn from_query(query: Option<&str>) -> Result<Self> {
        let values: Vec<String> = url::form_urlencoded::parse(query.unwrap_or("").as_bytes())
            .filter(|(key, _)| key == "port")
            .map(|(_, value)| value.into_owned())
            .collect();

        if values.is_empty() {
            return Err(Error::BadRequest("query parameter \"port\" is required".to_string()));
        }

        let mut ports = Vec::with_capacity(values.len());
        for value in &values {
            if value.is_empty() {
                return Err(Error::BadRequest(
                    "query parameter \"port\" cannot be empty".to_string(),
                ));
            }
            for port in value.split(',') {
                ports.push(parse_port(port)?);
            }
        }

        if ports.len() > MAX_PORTS {
            return Err(Error::BadRequest(format!(
                "too many ports requested: {} (at most {MAX_PORTS})",
                ports.len()
            )));
        }

        Ok(Self { ports })
    }
}

fn parse_port(port: &str) -> Result<u16> {
    let parsed: u16 = port
        .parse()
        .map_err(|e| Error::BadRequest(format!("unable to parse {port:?} as a port: {e}")))?;
    if parsed == 0 {
        return Err(Error::BadRequest(format!("port {port:?} must be > 0")));
    }
    Ok(parsed)
}
