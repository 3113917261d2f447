//! Registry of supervised bridges.
//!
//! All state lives in `Entries` behind a single mutex. The mutex is only held
//! around in-memory map operations, never across an `.await` or any call that
//! can block on a process.
//!
//! Port checks come in two tiers:
//! - [`ProcessRegistry::is_port_in_use`] takes the lock and delegates.
//! - `Entries::port_claimed` assumes the lock is held. It is a method on the
//!   guarded map, which is private to this module, so it can only be reached
//!   through a live guard and it never locks by itself.
//!
//! Code holding the guard must use the second form. `std::sync::Mutex` is not
//! reentrant: calling the public check from inside a locked section hangs the
//! caller forever.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::hosts_overlap;
use crate::error::{BridgeError, BridgeResult};
use crate::output::OutputMonitor;
use crate::process::{ExitOutcome, ExitWatch};
use crate::record::{BridgeId, BridgeStatus, ProcessRecord, Timestamp};

struct Entry {
    record: ProcessRecord,
    /// Reserved by a start that has not attached a process yet
    launching: bool,
    exited: Option<ExitWatch>,
    monitor: Option<OutputMonitor>,
    /// Cancelled once the bridge has been removed and its event published
    finalized: CancellationToken,
}

#[derive(Default)]
struct Entries {
    map: BTreeMap<BridgeId, Entry>,
}

impl Entries {
    /// Active bridge claiming `host:port`. Assumes the registry lock is held.
    fn port_claimed(&self, host: &str, port: u16) -> Option<BridgeId> {
        self.map
            .values()
            .map(|entry| &entry.record)
            .find(|record| {
                record.status.is_active()
                    && record.tcp_port == port
                    && hosts_overlap(&record.tcp_host, host)
            })
            .map(|record| record.id)
    }

    fn claim(&mut self, record: ProcessRecord, launching: bool) -> BridgeResult<()> {
        if self.map.contains_key(&record.id) {
            return Err(BridgeError::AlreadyRegistered(record.id));
        }
        if record.status.is_active()
            && let Some(owner) = self.port_claimed(&record.tcp_host, record.tcp_port)
        {
            return Err(BridgeError::port_in_use(
                &record.tcp_host,
                record.tcp_port,
                format!(" by bridge {}", owner),
            ));
        }
        self.map.insert(
            record.id,
            Entry {
                record,
                launching,
                exited: None,
                monitor: None,
                finalized: CancellationToken::new(),
            },
        );
        Ok(())
    }

    fn transition(&mut self, id: BridgeId, status: BridgeStatus, exit_code: Option<i32>) -> bool {
        match self.map.get_mut(&id) {
            Some(entry) => apply(&mut entry.record, status, exit_code),
            None => false,
        }
    }
}

/// Move `record` to `status` if that keeps the lifecycle monotonic.
fn apply(record: &mut ProcessRecord, status: BridgeStatus, exit_code: Option<i32>) -> bool {
    if !record.status.can_transition_to(status) {
        return false;
    }
    record.status = status;
    if status.is_terminal() {
        record.exit_code = exit_code;
        record.exited_at = Some(Timestamp::now());
    }
    true
}

/// What `stop` has to do after its locked section.
pub(crate) enum StopTicket {
    /// Not tracked
    Idle,
    /// Already terminal, someone else is finishing the teardown
    Settling { finalized: CancellationToken },
    /// Still being launched; the start path finishes the teardown
    Deferred {
        record: ProcessRecord,
        transitioned: bool,
        finalized: CancellationToken,
    },
    Terminate {
        record: ProcessRecord,
        transitioned: bool,
        pid: Option<u32>,
        exited: Option<ExitWatch>,
        finalized: CancellationToken,
    },
}

/// A bridge that just reached its terminal status.
///
/// Whoever holds it publishes the terminal event and then cancels
/// `finalized`, releasing stops waiting on the teardown.
pub(crate) struct Settled {
    pub(crate) record: ProcessRecord,
    pub(crate) monitor: Option<OutputMonitor>,
    pub(crate) finalized: CancellationToken,
}

/// Map of bridge id to live bridge state, guarded by one mutex.
pub struct ProcessRegistry {
    entries: Mutex<Entries>,
    next_id: AtomicU64,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            next_id: AtomicU64::new(1),
        }
    }

    // Critical sections never leave the map half-updated, so a poisoned lock
    // still guards consistent data.
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh bridge id.
    pub fn next_id(&self) -> BridgeId {
        BridgeId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Whether an active bridge claims `host:port`.
    ///
    /// Takes the registry lock. Not to be called while the lock is held.
    pub fn is_port_in_use(&self, host: &str, port: u16) -> bool {
        self.lock().port_claimed(host, port).is_some()
    }

    /// Register `record`, failing if an active bridge already claims its port.
    pub fn insert(&self, record: ProcessRecord) -> BridgeResult<()> {
        self.lock().claim(record, false)
    }

    /// Move a bridge forward in its lifecycle.
    ///
    /// Returns `false` without changing anything if the bridge is absent,
    /// already terminal, or `status` is not a forward transition.
    pub fn update_status(
        &self,
        id: BridgeId,
        status: BridgeStatus,
        exit_code: Option<i32>,
    ) -> bool {
        self.lock().transition(id, status, exit_code)
    }

    /// Remove a terminal bridge.
    ///
    /// Active bridges are left in place; removing them would release their
    /// port while the process may still hold it.
    pub fn remove(&self, id: BridgeId) -> Option<ProcessRecord> {
        let mut entries = self.lock();
        match entries.map.get(&id) {
            Some(entry) if entry.record.status.is_terminal() => {
                entries.map.remove(&id).map(|entry| entry.record)
            }
            Some(_) => {
                debug!("Not removing bridge {}, it is still active", id);
                None
            }
            None => None,
        }
    }

    pub fn get(&self, id: BridgeId) -> Option<ProcessRecord> {
        self.lock().map.get(&id).map(|entry| entry.record.clone())
    }

    /// Copy of every record, ordered by id.
    pub fn snapshot(&self) -> Vec<ProcessRecord> {
        self.lock()
            .map
            .values()
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().map.is_empty()
    }

    /// Insert a `Starting` reservation owned by the caller's start path.
    pub(crate) fn reserve(&self, record: ProcessRecord) -> BridgeResult<()> {
        self.lock().claim(record, true)
    }

    /// Attach a spawned process to its reservation and mark it `Running`.
    ///
    /// Hands the monitor back if the reservation is gone or a stop landed on
    /// it in the meantime.
    pub(crate) fn mark_running(
        &self,
        id: BridgeId,
        pid: u32,
        exited: ExitWatch,
        monitor: OutputMonitor,
    ) -> Result<ProcessRecord, OutputMonitor> {
        let mut entries = self.lock();
        let Some(entry) = entries.map.get_mut(&id) else {
            return Err(monitor);
        };
        if entry.record.status != BridgeStatus::Starting {
            return Err(monitor);
        }
        entry.launching = false;
        entry.record.pid = Some(pid);
        entry.record.status = BridgeStatus::Running;
        entry.record.started_at = Timestamp::now();
        entry.exited = Some(exited);
        entry.monitor = Some(monitor);
        Ok(entry.record.clone())
    }

    /// First half of a stop: move the bridge to `Stopping` and return what
    /// is needed to terminate it outside the lock.
    pub(crate) fn begin_stop(&self, id: BridgeId) -> StopTicket {
        let mut entries = self.lock();
        let Some(entry) = entries.map.get_mut(&id) else {
            return StopTicket::Idle;
        };
        if entry.record.status.is_terminal() {
            return StopTicket::Settling {
                finalized: entry.finalized.clone(),
            };
        }

        let transitioned = apply(&mut entry.record, BridgeStatus::Stopping, None);
        let record = entry.record.clone();
        if entry.launching {
            StopTicket::Deferred {
                record,
                transitioned,
                finalized: entry.finalized.clone(),
            }
        } else {
            StopTicket::Terminate {
                pid: record.pid,
                record,
                transitioned,
                exited: entry.exited.clone(),
                finalized: entry.finalized.clone(),
            }
        }
    }

    /// Apply the terminal transition for an ended process, exactly once.
    ///
    /// Returns `None` if another caller already settled the bridge, if it is
    /// absent, or if it is still owned by a start in progress.
    pub(crate) fn settle(&self, id: BridgeId, outcome: ExitOutcome) -> Option<Settled> {
        let mut entries = self.lock();
        let entry = entries.map.get_mut(&id)?;
        if entry.launching || entry.record.status.is_terminal() {
            return None;
        }
        let status = outcome.terminal_status(entry.record.status);
        apply(&mut entry.record, status, outcome.exit_code());
        Some(Settled {
            record: entry.record.clone(),
            monitor: entry.monitor.take(),
            finalized: entry.finalized.clone(),
        })
    }

    /// Terminal transition and removal in one locked section.
    ///
    /// Used to roll back reservations whose start was abandoned.
    pub(crate) fn retire(
        &self,
        id: BridgeId,
        status: BridgeStatus,
        exit_code: Option<i32>,
    ) -> Option<Settled> {
        let mut entries = self.lock();
        let entry = entries.map.get_mut(&id)?;
        if !apply(&mut entry.record, status, exit_code) {
            return None;
        }
        entries.map.remove(&id).map(|entry| Settled {
            record: entry.record,
            monitor: entry.monitor,
            finalized: entry.finalized,
        })
    }

    /// PIDs of bridges that still have a process attached.
    pub(crate) fn active_pids(&self) -> Vec<u32> {
        self.lock()
            .map
            .values()
            .filter(|entry| entry.record.status.is_active())
            .filter_map(|entry| entry.record.pid)
            .collect()
    }
}
