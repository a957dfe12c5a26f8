//! Streaming endpoint stories
//!
//! - `portforward`: forwarding several ports over one connection, per-port
//!   failures, protocol negotiation and idle timeouts
//! - `exec`: running commands with stdio, exit statuses and the TTY fallback

mod exec;
mod helpers;
mod portforward;
