//! Command-line and environment configuration

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::{Error, Result};

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// JSON objects with span context
    Json,
}

/// A `PORT=HOST:PORT` forwarding rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardTarget {
    /// Pod port clients request
    pub port: u16,
    /// Address the port is forwarded to
    pub addr: String,
}

/// podlet: exec and port-forward endpoints for simulated pods
#[derive(Debug, Parser)]
#[command(name = "podlet", version, about)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "PODLET_LISTEN", default_value = "0.0.0.0:10250")]
    pub listen: SocketAddr,

    /// TLS certificate (PEM); serves plain HTTP when unset
    #[arg(long, env = "PODLET_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "PODLET_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Close streaming connections after this many idle seconds
    #[arg(long, env = "PODLET_IDLE_TIMEOUT_SECS", default_value = "14400")]
    pub idle_timeout_secs: u64,

    /// Forward a pod port to an address, as PORT=HOST:PORT (repeatable)
    #[arg(long = "forward", env = "PODLET_FORWARD", value_delimiter = ',', value_parser = parse_forward_target)]
    pub forwards: Vec<ForwardTarget>,

    /// Host to forward ports without an explicit rule to
    #[arg(long, env = "PODLET_FORWARD_DEFAULT_HOST")]
    pub forward_default_host: Option<String>,

    /// Working directory for exec commands
    #[arg(long, env = "PODLET_EXEC_DIR")]
    pub exec_dir: Option<PathBuf>,

    /// Extra environment for exec commands, as KEY=VALUE (repeatable)
    #[arg(long = "exec-env", env = "PODLET_EXEC_ENV", value_parser = parse_env_entry)]
    pub exec_env: Vec<String>,

    /// Log output format
    #[arg(long, env = "PODLET_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

fn parse_forward_target(s: &str) -> std::result::Result<ForwardTarget, String> {
    let (port, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid forward rule '{}', expected PORT=HOST:PORT", s))?;
    let port: u16 = port
        .trim()
        .parse()
        .map_err(|e| format!("invalid port in forward rule '{}': {}", s, e))?;
    if port == 0 {
        return Err(format!("invalid port in forward rule '{}': must be > 0", s));
    }
    let addr = addr.trim();
    match addr.rsplit_once(':') {
        Some((host, target_port)) if !host.is_empty() && target_port.parse::<u16>().is_ok() => {}
        _ => {
            return Err(format!(
                "invalid address in forward rule '{}', expected HOST:PORT",
                s
            ))
        }
    }
    Ok(ForwardTarget {
        port,
        addr: addr.to_string(),
    })
}

fn parse_env_entry(s: &str) -> std::result::Result<String, String> {
    match s.split_once('=') {
        Some((key, _)) if !key.is_empty() => Ok(s.to_string()),
        _ => Err(format!("invalid environment entry '{}', expected KEY=VALUE", s)),
    }
}

/// TLS certificate and key paths
#[derive(Clone, Debug)]
pub struct TlsConfig {
    /// Certificate chain (PEM)
    pub cert: PathBuf,
    /// Private key (PEM)
    pub key: PathBuf,
}

/// Typed server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind
    pub addr: SocketAddr,
    /// TLS material; plain HTTP when `None`
    pub tls: Option<TlsConfig>,
    /// Idle timeout for streaming connections
    pub idle_timeout: Duration,
    /// Explicit port-forward targets
    pub forward_targets: HashMap<u16, String>,
    /// Fallback host for port forwarding
    pub forward_default_host: Option<String>,
    /// Working directory for exec commands
    pub exec_dir: Option<PathBuf>,
    /// Environment overlay for exec commands
    pub exec_env: Vec<String>,
}

impl ServerConfig {
    /// Build the server configuration from parsed arguments
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        if cli.idle_timeout_secs == 0 {
            return Err(Error::Config("idle timeout must be > 0".to_string()));
        }
        let tls = match (&cli.tls_cert, &cli.tls_key) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert: cert.clone(),
                key: key.clone(),
            }),
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "TLS certificate and key must be set together".to_string(),
                ))
            }
        };

        Ok(Self {
            addr: cli.listen,
            tls,
            idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
            forward_targets: cli
                .forwards
                .iter()
                .map(|target| (target.port, target.addr.clone()))
                .collect(),
            forward_default_host: cli.forward_default_host.clone(),
            exec_dir: cli.exec_dir.clone(),
            exec_env: cli.exec_env.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("podlet").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&[]).unwrap();
        let config = ServerConfig::from_cli(&cli).unwrap();
        assert_eq!(config.addr, "0.0.0.0:10250".parse().unwrap());
        assert_eq!(config.idle_timeout, Duration::from_secs(4 * 60 * 60));
        assert!(config.tls.is_none());
        assert!(config.forward_targets.is_empty());
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn test_forward_rules() {
        let cli = parse(&[
            "--forward",
            "80=127.0.0.1:8080",
            "--forward",
            "443=backend.local:8443,22=[::1]:2222",
            "--forward-default-host",
            "localhost",
        ])
        .unwrap();
        let config = ServerConfig::from_cli(&cli).unwrap();
        assert_eq!(config.forward_targets.len(), 3);
        assert_eq!(config.forward_targets[&80], "127.0.0.1:8080");
        assert_eq!(config.forward_targets[&22], "[::1]:2222");
        assert_eq!(config.forward_default_host.as_deref(), Some("localhost"));
    }

    #[test]
    fn test_invalid_forward_rules() {
        assert!(parse(&["--forward", "80"]).is_err());
        assert!(parse(&["--forward", "0=localhost:80"]).is_err());
        assert!(parse(&["--forward", "http=localhost:80"]).is_err());
        assert!(parse(&["--forward", "80=localhost"]).is_err());
    }

    #[test]
    fn test_exec_env_entries() {
        let cli = parse(&["--exec-env", "A=1", "--exec-env", "B="]).unwrap();
        assert_eq!(cli.exec_env, vec!["A=1", "B="]);
        assert!(parse(&["--exec-env", "=1"]).is_err());
        assert!(parse(&["--exec-env", "NOVALUE"]).is_err());
    }

    #[test]
    fn test_exec_env_value_keeps_commas() {
        let cli = parse(&["--exec-env", "PATH=/a,/b", "--exec-env", "LANG=C"]).unwrap();
        assert_eq!(cli.exec_env, vec!["PATH=/a,/b", "LANG=C"]);
    }

    #[test]
    fn test_tls_requires_pair() {
        assert!(parse(&["--tls-cert", "cert.pem"]).is_err());
        let cli = parse(&["--tls-cert", "cert.pem", "--tls-key", "key.pem"]).unwrap();
        let config = ServerConfig::from_cli(&cli).unwrap();
        assert!(config.tls.is_some());
    }

    #[test]
    fn test_zero_idle_timeout_rejected() {
        let cli = parse(&["--idle-timeout-secs", "0"]).unwrap();
        assert!(matches!(ServerConfig::from_cli(&cli), Err(Error::Config(_))));
    }

    #[test]
    fn test_json_log_format() {
        let cli = parse(&["--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
