//! Lifecycle notifications published to subscribers.

use serde::Serialize;
use std::fmt;

use crate::record::{BridgeId, BridgeStatus, ProcessRecord, Timestamp};
use crate::sink::Severity;

/// One bridge state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub id: BridgeId,
    pub status: BridgeStatus,
    pub tcp_host: String,
    pub tcp_port: u16,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub at: Timestamp,
}

impl LifecycleEvent {
    pub(crate) fn from_record(record: &ProcessRecord) -> Self {
        Self {
            id: record.id,
            status: record.status,
            tcp_host: record.tcp_host.clone(),
            tcp_port: record.tcp_port,
            pid: record.pid,
            exit_code: record.exit_code,
            at: Timestamp::now(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self.status {
            BridgeStatus::Starting | BridgeStatus::Stopping => Severity::Debug,
            BridgeStatus::Running | BridgeStatus::Stopped => Severity::Info,
            BridgeStatus::Failed => Severity::Warn,
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bridge {} on {}:{} is {}",
            self.id, self.tcp_host, self.tcp_port, self.status
        )?;
        if let Some(pid) = self.pid {
            write!(f, " (PID {})", pid)?;
        }
        if let Some(code) = self.exit_code {
            write!(f, ", exit code {}", code)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_severity() {
        let mut record =
            ProcessRecord::reserved(BridgeId(4), "localhost", 5000, "/dev/ttyUSB0", "socat");
        record.status = BridgeStatus::Failed;
        record.pid = Some(42);
        record.exit_code = Some(137);

        let event = LifecycleEvent::from_record(&record);
        assert_eq!(
            event.to_string(),
            "Bridge #4 on localhost:5000 is failed (PID 42), exit code 137"
        );
        assert_eq!(event.severity(), Severity::Warn);
    }
}
