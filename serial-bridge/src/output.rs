//! Output monitor: forwards a bridge's stdout/stderr lines to the log sink.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::record::BridgeId;
use crate::sink::LogSink;

/// How long a cancelled reader keeps draining buffered output.
const DRAIN_WINDOW: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Reader tasks attached to one bridge process.
pub(crate) struct OutputMonitor {
    cancel: CancellationToken,
    readers: Vec<JoinHandle<()>>,
}

impl OutputMonitor {
    pub(crate) fn attach(
        id: BridgeId,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = stdout {
            readers.push(spawn_reader(
                id,
                OutputStream::Stdout,
                stdout,
                sink.clone(),
                cancel.clone(),
            ));
        }
        if let Some(stderr) = stderr {
            readers.push(spawn_reader(
                id,
                OutputStream::Stderr,
                stderr,
                sink,
                cancel.clone(),
            ));
        }
        Self { cancel, readers }
    }

    /// Tell the readers to stop and wait for them.
    ///
    /// Readers drain what is already buffered for a short window so the
    /// last lines before an exit are not lost.
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        for reader in self.readers {
            if let Err(e) = reader.await
                && e.is_panic()
            {
                warn!("Output reader panicked: {}", e);
            }
        }
    }
}

fn spawn_reader<R>(
    id: BridgeId,
    stream: OutputStream,
    reader: R,
    sink: Arc<dyn LogSink>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // Split on raw bytes: socat's verbose output is not guaranteed to be UTF-8
        let mut segments = BufReader::new(reader).split(b'\n');
        // Fixed when cancellation is observed; a writer that keeps going
        // (e.g. a forked child holding the pipe) cannot extend it
        let mut drain_until: Option<Instant> = None;

        loop {
            let next = match drain_until {
                None => tokio::select! {
                    biased;
                    next = segments.next_segment() => next,
                    _ = cancel.cancelled() => {
                        drain_until = Some(Instant::now() + DRAIN_WINDOW);
                        continue;
                    }
                },
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, segments.next_segment()).await {
                        Ok(next) => next,
                        Err(_) => {
                            debug!("Stopped draining {} of bridge {}", stream, id);
                            break;
                        }
                    }
                }
            };

            match next {
                Ok(Some(segment)) => {
                    let line = String::from_utf8_lossy(&segment);
                    sink.output(id, stream, line.trim_end_matches('\r'));
                }
                Ok(None) => {
                    debug!("{} of bridge {} closed", stream, id);
                    break;
                }
                Err(e) => {
                    debug!("Error reading {} of bridge {}: {}", stream, id, e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LifecycleEvent;
    use crate::sink::Severity;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Lines(Mutex<Vec<(OutputStream, String)>>);

    impl LogSink for Lines {
        fn output(&self, _id: BridgeId, stream: OutputStream, line: &str) {
            self.0.lock().unwrap().push((stream, line.to_string()));
        }

        fn lifecycle(&self, _severity: Severity, _event: &LifecycleEvent) {}
    }

    #[tokio::test]
    async fn test_reader_forwards_lines_until_eof() {
        let sink = Arc::new(Lines::default());
        let input: &[u8] = b"first\r\nsecond\n\xfflast";
        let handle = spawn_reader(
            BridgeId(1),
            OutputStream::Stderr,
            input,
            sink.clone(),
            CancellationToken::new(),
        );
        handle.await.unwrap();

        let lines = sink.0.lock().unwrap().clone();
        assert_eq!(
            lines,
            vec![
                (OutputStream::Stderr, "first".to_string()),
                (OutputStream::Stderr, "second".to_string()),
                (OutputStream::Stderr, "\u{fffd}last".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_reader_stops_on_silent_pipe() {
        let sink = Arc::new(Lines::default());
        let (_writer, reader) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let handle = spawn_reader(
            BridgeId(2),
            OutputStream::Stdout,
            reader,
            sink,
            cancel.clone(),
        );

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reader should stop after the drain window")
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_window_is_not_extended_by_a_busy_writer() {
        let sink = Arc::new(Lines::default());
        let (mut writer, reader) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let handle = spawn_reader(
            BridgeId(3),
            OutputStream::Stdout,
            reader,
            sink.clone(),
            cancel.clone(),
        );

        // Keeps writing long after cancellation, like a forked child
        let chatter = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            while writer.write_all(b"tick\n").await.is_ok() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(DRAIN_WINDOW + Duration::from_secs(1), handle)
            .await
            .expect("a busy writer kept the reader alive past its drain window")
            .unwrap();
        assert!(!sink.0.lock().unwrap().is_empty());
        chatter.abort();
    }
}
