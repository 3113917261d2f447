//! Shared test utilities for serial-bridge integration tests.

// Each test file compiles separately, so not all helpers are used in each binary
#![allow(dead_code)]

use serial_bridge::{
    BridgeConfig, BridgeId, BridgeStatus, BridgeSupervisor, LifecycleEvent, LogSink,
    OutputStream, Severity, SupervisorSettings,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::fs;
use tokio::sync::broadcast;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const SHORT_GRACE: Duration = Duration::from_millis(300);

/// Test context that owns a temp directory with a fake serial device
pub struct TestContext {
    pub temp_dir: TempDir,
    pub device: PathBuf,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let device = temp_dir.path().join("ttyFAKE0");
        std::fs::write(&device, b"").expect("Failed to create fake device");
        Self { temp_dir, device }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Create an executable script in the temp directory
    pub async fn create_script(&self, name: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        fs::write(&path, content)
            .await
            .expect("Failed to write script");
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .await
            .expect("Failed to set permissions");
        path
    }

    /// A supervisor running `executable` in place of socat
    pub fn supervisor(&self, executable: &Path, sink: Arc<RecordingSink>) -> BridgeSupervisor {
        let settings = SupervisorSettings {
            grace_period_ms: SHORT_GRACE.as_millis() as u64,
            kill_timeout_ms: 5_000,
            ..SupervisorSettings::with_executable(executable)
        };
        BridgeSupervisor::new(settings, sink)
    }
}

// ============================================================================
// Fake bridge executables
// ============================================================================

/// Prints one line per stream, then sleeps until killed
pub const LONG_RUNNING: &str = "#!/bin/sh\necho \"bridge ready\"\necho \"listening\" >&2\nexec sleep 3600\n";

/// Ignores SIGTERM, so only SIGKILL ends it
pub const IGNORES_TERM: &str = "#!/bin/sh\ntrap '' TERM\nwhile true; do sleep 1; done\n";

/// Exits on its own with `code`
pub fn exits_with(code: i32) -> String {
    format!("#!/bin/sh\nexit {}\n", code)
}

/// Touches `marker` before sleeping, so tests can tell whether it ran
pub fn touches(marker: &Path) -> String {
    format!(
        "#!/bin/sh\ntouch '{}'\nexec sleep 3600\n",
        marker.display()
    )
}

pub fn config(port: u16) -> BridgeConfig {
    BridgeConfig::on_port(port)
}

// ============================================================================
// Recording sink
// ============================================================================

#[derive(Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<(BridgeId, OutputStream, String)>>,
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<(BridgeId, OutputStream, String)> {
        self.lines.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Statuses reported for `id`, in order
    pub fn statuses(&self, id: BridgeId) -> Vec<BridgeStatus> {
        self.events()
            .into_iter()
            .filter(|event| event.id == id)
            .map(|event| event.status)
            .collect()
    }

    pub fn terminal_count(&self, id: BridgeId) -> usize {
        self.statuses(id)
            .into_iter()
            .filter(|status| status.is_terminal())
            .count()
    }
}

impl LogSink for RecordingSink {
    fn output(&self, id: BridgeId, stream: OutputStream, line: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((id, stream, line.to_string()));
    }

    fn lifecycle(&self, _severity: Severity, event: &LifecycleEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ============================================================================
// Waiting helpers
// ============================================================================

/// Wait for a condition to become true, with timeout
pub async fn wait_for_condition<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Receive events until `id` reaches a terminal status
pub async fn next_terminal(
    events: &mut broadcast::Receiver<LifecycleEvent>,
    id: BridgeId,
) -> LifecycleEvent {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if event.id == id && event.status.is_terminal() {
                return event;
            }
        }
    })
    .await
    .expect("Timed out waiting for a terminal event")
}
