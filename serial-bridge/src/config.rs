//! Configuration types for bridges and for the supervisor itself.
//!
//! `BridgeConfig` mirrors the `configuration` object of a socat profile and
//! deserializes from the same camelCase layout.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Hosts that make socat listen on every interface.
const WILDCARD_HOSTS: &[&str] = &["", "*", "0.0.0.0", "::", "[::]"];

/// Whether `host` means "all interfaces".
pub fn is_wildcard_host(host: &str) -> bool {
    WILDCARD_HOSTS.contains(&host.trim())
}

/// Spellings of the loopback interface socat binds the same way.
const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];

/// Comparable form of `host`: trimmed, lowercased, brackets stripped,
/// IP literals in canonical form and loopback spellings folded together.
fn canonical_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host.as_str());
    let bare = match bare.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => bare.to_string(),
    };
    if LOOPBACK_HOSTS.contains(&bare.as_str()) {
        "localhost".to_string()
    } else {
        bare
    }
}

/// Whether two listeners on the same port would collide.
///
/// A wildcard listener collides with any other host on that port. Other
/// names are not resolved; only loopback spellings and equivalent IP
/// literals are treated as the same host.
pub fn hosts_overlap(a: &str, b: &str) -> bool {
    is_wildcard_host(a) || is_wildcard_host(b) || canonical_host(a) == canonical_host(b)
}

/// Options for one socat bridge process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub tcp_host: String,
    pub tcp_port: u16,
    /// `-v`: write transferred data to stderr
    pub verbose: bool,
    /// `-x`: hex dump of transferred data
    pub hex_dump: bool,
    /// `-b`: transfer block size in bytes
    pub block_size: Option<u32>,
    /// Number of `-d` flags
    pub debug_level: u8,
    /// `fork`: accept more than one TCP client over the bridge lifetime
    pub allow_fork: bool,
    pub reuse_address: bool,
    pub raw_mode: bool,
    /// `echo=0` on the serial side
    pub no_echo: bool,
    /// Additional global socat flags, passed before the addresses
    pub extra_flags: Vec<String>,
    /// Additional `TCP-LISTEN` address options
    pub tcp_options: Vec<String>,
    /// Additional serial address options
    pub serial_options: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tcp_host: "localhost".to_string(),
            tcp_port: 1238,
            verbose: true,
            hex_dump: true,
            block_size: Some(4),
            debug_level: 2,
            allow_fork: true,
            reuse_address: true,
            raw_mode: true,
            no_echo: true,
            extra_flags: Vec::new(),
            tcp_options: Vec::new(),
            serial_options: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Default configuration listening on `port`.
    pub fn on_port(port: u16) -> Self {
        Self {
            tcp_port: port,
            ..Default::default()
        }
    }
}

/// Settings of the supervisor, shared by every bridge it starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Bridge executable, looked up in `PATH` when not absolute
    pub executable: PathBuf,
    /// Default time a bridge gets to exit after SIGTERM
    pub grace_period_ms: u64,
    /// Time to wait for the exit after SIGKILL before giving up
    pub kill_timeout_ms: u64,
    /// Capacity of the lifecycle event broadcast channel
    pub event_capacity: usize,
    /// Capacity of the exit notification queue
    pub exit_queue_capacity: usize,
    /// Also refuse ports that another program on this host is listening on
    pub probe_os_port: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("socat"),
            grace_period_ms: 5_000,
            kill_timeout_ms: 5_000,
            event_capacity: 256,
            exit_queue_capacity: 64,
            probe_os_port: false,
        }
    }
}

impl SupervisorSettings {
    pub fn with_executable(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Default::default()
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}
