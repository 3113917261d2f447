//! Destination for bridge output and lifecycle events.

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::events::LifecycleEvent;
use crate::output::OutputStream;
use crate::record::BridgeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Receives bridge output lines and lifecycle events.
///
/// Called from output reader tasks and from the exit worker, never while the
/// registry lock is held. Implementations must not block for long.
pub trait LogSink: Send + Sync {
    fn output(&self, id: BridgeId, stream: OutputStream, line: &str);

    fn lifecycle(&self, severity: Severity, event: &LifecycleEvent);
}

/// Forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn output(&self, id: BridgeId, stream: OutputStream, line: &str) {
        info!(target: "serial_bridge::output", bridge = %id, %stream, "{}", line);
    }

    fn lifecycle(&self, severity: Severity, event: &LifecycleEvent) {
        let id = event.id;
        let status = event.status;
        match severity {
            Severity::Debug => debug!(bridge = %id, %status, "{}", event),
            Severity::Info => info!(bridge = %id, %status, "{}", event),
            Severity::Warn => warn!(bridge = %id, %status, "{}", event),
            Severity::Error => error!(bridge = %id, %status, "{}", event),
        }
    }
}
