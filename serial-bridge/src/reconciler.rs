//! Exit reconciliation.
//!
//! Every running bridge has a watcher task that owns its child handle and
//! reaps it. The watcher publishes the outcome on the bridge's watch channel
//! (so a concurrent stop sees it) and queues an [`ExitNotice`]. A single
//! worker drains the queue and settles each bridge through [`finalize`],
//! the same path explicit stops use, so a bridge is settled exactly once
//! whichever side gets there first.

use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::process::ExitOutcome;
use crate::record::{BridgeId, BridgeStatus, ProcessRecord};
use crate::supervisor::Shared;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ExitNotice {
    pub(crate) id: BridgeId,
    pub(crate) outcome: ExitOutcome,
}

/// Reap `child` and report how it ended.
pub(crate) fn spawn_exit_watcher(
    id: BridgeId,
    mut child: Child,
    exited: watch::Sender<Option<ExitOutcome>>,
    notices: mpsc::Sender<ExitNotice>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = match child.wait().await {
            Ok(status) => ExitOutcome::from_status(status),
            Err(e) => {
                warn!("Failed to wait for bridge {}: {}", id, e);
                ExitOutcome::Unknown
            }
        };
        debug!("Bridge {} exited: {:?}", id, outcome);

        exited.send_replace(Some(outcome));
        if notices.send(ExitNotice { id, outcome }).await.is_err() {
            // Supervisor is gone; nobody is left to settle the record
            trace!("Exit queue closed, dropping notice for bridge {}", id);
        }
    })
}

/// Settle bridges whose processes ended on their own.
pub(crate) fn spawn_worker(
    shared: Arc<Shared>,
    mut notices: mpsc::Receiver<ExitNotice>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(ExitNotice { id, outcome }) = notices.recv().await {
            let Some(record) = finalize(&shared, id, outcome).await else {
                trace!("Bridge {} was already settled", id);
                continue;
            };
            if record.status == BridgeStatus::Failed {
                warn!(
                    "Bridge {} on {} exited unexpectedly with code {:?}",
                    id,
                    record.endpoint(),
                    record.exit_code
                );
            }
        }
        debug!("Exit queue closed, reconciler stopping");
    })
}

/// Apply the terminal transition for `id`, tear down its output monitor,
/// remove it from the registry and publish the event.
///
/// Returns `None` if someone else already settled the bridge. That caller
/// cancels the bridge's `finalized` token once it is done.
pub(crate) async fn finalize(
    shared: &Shared,
    id: BridgeId,
    outcome: ExitOutcome,
) -> Option<ProcessRecord> {
    let settled = shared.registry.settle(id, outcome)?;
    if let Some(monitor) = settled.monitor {
        monitor.shutdown().await;
    }
    shared.registry.remove(id);
    shared.emit(&settled.record);
    settled.finalized.cancel();
    Some(settled.record)
}
