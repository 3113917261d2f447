//! Snapshot types describing supervised bridges.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

/// Opaque handle of a supervised bridge.
///
/// Assigned by the registry before the process is spawned, so a bridge has an
/// id even while its TCP port is only reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BridgeId(pub(crate) u64);

impl BridgeId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for BridgeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle status of a bridge.
///
/// `Starting -> Running -> Stopping -> Stopped`, or `Running -> Failed`.
/// Transitions only move forward; `Stopped` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    /// Port reserved, process not spawned yet
    Starting,
    Running,
    /// Termination requested
    Stopping,
    Stopped,
    /// Exited on its own with a non-zero or abnormal status, or never spawned
    Failed,
}

impl BridgeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BridgeStatus::Stopped | BridgeStatus::Failed)
    }

    /// Whether the bridge still claims its TCP port.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    fn rank(self) -> u8 {
        match self {
            BridgeStatus::Starting => 0,
            BridgeStatus::Running => 1,
            BridgeStatus::Stopping => 2,
            BridgeStatus::Stopped | BridgeStatus::Failed => 3,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    pub fn can_transition_to(self, next: BridgeStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeStatus::Starting => "starting",
            BridgeStatus::Running => "running",
            BridgeStatus::Stopping => "stopping",
            BridgeStatus::Stopped => "stopped",
            BridgeStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// RFC 3339 timestamp wrapper for SystemTime with proper serde serialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub SystemTime);

impl Timestamp {
    pub fn now() -> Self {
        Self(SystemTime::now())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_rfc3339_millis(self.0))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_rfc3339_nanos(self.0))
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        humantime::parse_rfc3339(&s)
            .map(Timestamp)
            .map_err(D::Error::custom)
    }
}

/// Point-in-time copy of a bridge's registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: BridgeId,
    /// OS process id, known once the process has been spawned
    pub pid: Option<u32>,
    pub tcp_host: String,
    pub tcp_port: u16,
    pub serial_device: PathBuf,
    /// Shell-escaped command line of the bridge process
    pub command_line: String,
    /// Name of the profile the configuration came from
    pub profile: Option<String>,
    pub status: BridgeStatus,
    pub started_at: Timestamp,
    pub exited_at: Option<Timestamp>,
    /// Exit code once terminal; signal deaths are reported as `128 + signal`
    pub exit_code: Option<i32>,
}

impl ProcessRecord {
    /// A fresh `Starting` record reserving `tcp_host:tcp_port`.
    pub fn reserved(
        id: BridgeId,
        tcp_host: impl Into<String>,
        tcp_port: u16,
        serial_device: impl Into<PathBuf>,
        command_line: impl Into<String>,
    ) -> Self {
        Self {
            id,
            pid: None,
            tcp_host: tcp_host.into(),
            tcp_port,
            serial_device: serial_device.into(),
            command_line: command_line.into(),
            profile: None,
            status: BridgeStatus::Starting,
            started_at: Timestamp::now(),
            exited_at: None,
            exit_code: None,
        }
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    /// TCP endpoint in `host:port` form, as shown to users.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.tcp_host, self.tcp_port)
    }
}
