//! In-process listener and dialer.
//!
//! # Responsibilities
//! - Emulate `listen`/`accept`/`dial` without touching the OS network stack
//! - Pair each dial with exactly one accept through a bounded handoff queue
//! - Fail dials and accepts promptly once the listener is closed
//!
//! # Design Decisions
//! - A dial is a rendezvous: it returns only after an accept has taken the
//!   server end, so a formed pair is never silently dropped
//! - Queued ends whose dialer gave up (timeout, close) are discarded by the
//!   accept side instead of being served
//! - `close()` never waits on the accept loop

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::config::TransportConfig;
use crate::net::pipe::{pipe, PipeStream};
use crate::observability::metrics;

/// Error type for transport operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The listener has been closed; no further dials or accepts succeed.
    #[error("listener closed")]
    Closed,

    /// No accept paired with the dial before the timeout elapsed.
    #[error("dial to {target:?} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },
}

impl From<TransportError> for std::io::Error {
    fn from(err: TransportError) -> Self {
        let kind = match err {
            TransportError::Closed => std::io::ErrorKind::NotConnected,
            TransportError::Timeout { .. } => std::io::ErrorKind::TimedOut,
        };
        std::io::Error::new(kind, err)
    }
}

/// Synthetic address reported by every pipe listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PipeAddr;

impl PipeAddr {
    /// Network name, in the sense of `tcp`/`unix`.
    pub const NETWORK: &'static str = "rpc-pipe";

    pub fn network(&self) -> &'static str {
        Self::NETWORK
    }
}

impl std::fmt::Display for PipeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(Self::NETWORK)
    }
}

/// A server end waiting for `accept()`, with the dialer's pairing signal.
struct Pending {
    stream: PipeStream,
    paired: oneshot::Sender<()>,
}

struct Shared {
    queue_tx: mpsc::Sender<Pending>,
    queue_rx: Mutex<mpsc::Receiver<Pending>>,
    closed: watch::Sender<bool>,
    buffer_size: usize,
}

impl Shared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Close the queue and drop everything still in it.
fn drain(queue: &mut mpsc::Receiver<Pending>) {
    queue.close();
    let mut discarded = 0usize;
    while let Ok(pending) = queue.try_recv() {
        tracing::debug!(connection_id = %pending.stream.id(), "Discarding queued pipe on close");
        discarded += 1;
    }
    if discarded > 0 {
        tracing::debug!(discarded, "Handoff queue drained");
    }
}

/// Listening side of an in-process transport.
///
/// Cloning yields another handle to the same listener. Each call to
/// [`listen`] creates an independent namespace: dials on one listener are
/// never accepted by another.
#[derive(Clone)]
pub struct PipeListener {
    shared: Arc<Shared>,
}

/// Dialing side of an in-process transport.
#[derive(Clone)]
pub struct PipeDialer {
    shared: Arc<Shared>,
}

/// Create a new in-process listener.
pub fn listen(config: &TransportConfig) -> PipeListener {
    let (queue_tx, queue_rx) = mpsc::channel(config.backlog.max(1));
    let (closed, _) = watch::channel(false);

    tracing::debug!(
        backlog = config.backlog,
        buffer_size = config.buffer_size,
        "Pipe listener created"
    );

    PipeListener {
        shared: Arc::new(Shared {
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            closed,
            buffer_size: config.buffer_size,
        }),
    }
}

impl PipeListener {
    /// Wait for the next dialed connection.
    ///
    /// Returns [`TransportError::Closed`] once the listener is closed, including
    /// when the close happens while waiting.
    pub async fn accept(&self) -> Result<PipeStream, TransportError> {
        let mut closed = self.shared.closed.subscribe();

        let mut queue = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => return Err(TransportError::Closed),
            queue = self.shared.queue_rx.lock() => queue,
        };

        loop {
            tokio::select! {
                biased;
                _ = closed.wait_for(|c| *c) => {
                    drain(&mut queue);
                    return Err(TransportError::Closed);
                }
                pending = queue.recv() => match pending {
                    Some(Pending { stream, paired }) => {
                        if paired.send(()).is_ok() {
                            tracing::debug!(connection_id = %stream.id(), "Pipe accepted");
                            return Ok(stream);
                        }
                        // Dialer timed out or was cancelled after queueing.
                        tracing::debug!(connection_id = %stream.id(), "Discarding abandoned pipe");
                    }
                    None => return Err(TransportError::Closed),
                },
            }
        }
    }

    /// Close the listener.
    ///
    /// Idempotent. Pending and future accepts and dials fail with
    /// [`TransportError::Closed`]; queued server ends are discarded.
    pub fn close(&self) {
        let first = self.shared.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });

        if first {
            tracing::info!(address = %PipeAddr, "Pipe listener closed");
        }

        // A blocked accept() holds the queue and drains it when it wakes.
        if let Ok(mut queue) = self.shared.queue_rx.try_lock() {
            drain(&mut queue);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Address of this listener. Always [`PipeAddr`].
    pub fn local_addr(&self) -> PipeAddr {
        PipeAddr
    }

    /// A dialer bound to this listener.
    pub fn dialer(&self) -> PipeDialer {
        PipeDialer {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Dial this listener. See [`PipeDialer::dial`].
    pub async fn dial(&self, target: &str, timeout: Duration) -> Result<PipeStream, TransportError> {
        self.dialer().dial(target, timeout).await
    }
}

impl std::fmt::Debug for PipeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeListener")
            .field("addr", &PipeAddr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PipeDialer {
    /// Open a new connection to the listener.
    ///
    /// Creates a fresh pipe, queues its server end and waits until an
    /// `accept()` takes it. `target` is informational only; there is a single
    /// listener per dialer. Fails immediately if the listener is closed, and
    /// with [`TransportError::Closed`] if it closes before pairing.
    pub async fn dial(&self, target: &str, timeout: Duration) -> Result<PipeStream, TransportError> {
        let mut closed = self.shared.closed.subscribe();
        if *closed.borrow() {
            metrics::record_dial("closed");
            return Err(TransportError::Closed);
        }

        let (server, client) = pipe(self.shared.buffer_size);
        let id = client.id();
        let (paired_tx, mut paired_rx) = oneshot::channel();

        let handoff = async {
            self.shared
                .queue_tx
                .send(Pending {
                    stream: server,
                    paired: paired_tx,
                })
                .await
                .map_err(|_| TransportError::Closed)?;
            (&mut paired_rx).await.map_err(|_| TransportError::Closed)
        };

        let result = tokio::select! {
            biased;
            paired = tokio::time::timeout(timeout, handoff) => match paired {
                Ok(paired) => paired,
                Err(_) => Err(TransportError::Timeout {
                    target: target.to_string(),
                    timeout,
                }),
            },
            _ = closed.wait_for(|c| *c) => Err(TransportError::Closed),
        };

        // An accept may have acked between polls of the select arms. Refuse
        // any later ack first, then keep a pair that already formed.
        let result = match result {
            Err(err) => {
                paired_rx.close();
                match paired_rx.try_recv() {
                    Ok(()) => Ok(()),
                    Err(_) => Err(err),
                }
            }
            ok => ok,
        };

        match result {
            Ok(()) => {
                metrics::record_dial("ok");
                tracing::debug!(connection_id = %id, target, "Pipe dialed");
                Ok(client)
            }
            Err(err) => {
                metrics::record_dial(match err {
                    TransportError::Closed => "closed",
                    TransportError::Timeout { .. } => "timeout",
                });
                tracing::debug!(connection_id = %id, target, error = %err, "Pipe dial failed");
                Err(err)
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl std::fmt::Debug for PipeDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeDialer")
            .field("addr", &PipeAddr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
