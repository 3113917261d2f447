//! Supervision of socat bridge processes.
//!
//! A bridge forwards a local serial device onto a TCP listener by running an
//! external `socat` process. This crate starts, monitors and tears down those
//! processes while keeping a registry of what is running:
//!
//! - at most one active bridge owns a given TCP host/port pair,
//! - the serial device is validated before anything is spawned,
//! - explicit stops and process exits race safely and settle each bridge once,
//! - lifecycle transitions are published on a broadcast stream.
//!
//! The entry point is [`BridgeSupervisor`].

pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod output;
pub mod ports;
pub mod process;
pub mod profile;
mod reconciler;
pub mod record;
pub mod registry;
pub mod sink;
pub mod supervisor;

pub use command::BridgeCommand;
pub use config::{BridgeConfig, SupervisorSettings};
pub use device::validate_device;
pub use error::{BridgeError, BridgeResult};
pub use events::LifecycleEvent;
pub use output::OutputStream;
pub use process::ExitOutcome;
pub use profile::{Profile, find_profile, load_profiles};
pub use record::{BridgeId, BridgeStatus, ProcessRecord, Timestamp};
pub use registry::ProcessRegistry;
pub use sink::{LogSink, Severity, TracingLogSink};
pub use supervisor::BridgeSupervisor;

// Re-exported so callers do not need a direct tokio-util dependency
pub use tokio_util::sync::CancellationToken;
