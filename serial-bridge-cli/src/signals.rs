use std::io;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Turns the first SIGINT or SIGTERM into a cancelled token.
pub struct SignalHandler {
    cancellation_token: CancellationToken,
    _handle: tokio::task::JoinHandle<()>,
}

impl SignalHandler {
    pub fn start() -> io::Result<Self> {
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {
                    debug!("Received SIGINT, stopping the bridge");
                    token.cancel();
                }
                _ = sigterm.recv() => {
                    debug!("Received SIGTERM, stopping the bridge");
                    token.cancel();
                }
            }
        });

        Ok(Self {
            cancellation_token,
            _handle: handle,
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }
}
