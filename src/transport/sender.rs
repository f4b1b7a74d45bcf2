//! One outbound sender per (peer, class).

use std::fmt;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::io::BufWriter;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::proto::write_frame;
use crate::proto::Frame;
use crate::proto::NodeId;
use crate::transport::AddressResolver;

/// Delay before re-dialing after a failed connect.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(50);
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
/// Frames drained opportunistically behind the first one, per flush.
const BATCH_DRAIN: usize = 16;

/// Two sender classes per peer keep control-plane heartbeats from queueing
/// behind bulk append batches. A resolver may map them to different ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderClass {
    Heartbeat,
    Replicate,
}

impl fmt::Display for SenderClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A lazy connection with a bounded queue and a dedicated write loop.
pub(crate) struct Sender {
    tx: mpsc::Sender<Frame>,
    handle: JoinHandle<()>,
}

impl Sender {
    pub(crate) fn spawn(
        node: NodeId,
        class: SenderClass,
        queue_size: usize,
        resolver: Arc<dyn AddressResolver>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size);
        let handle = tokio::spawn(write_loop(node, class, rx, resolver));
        Self { tx, handle }
    }

    /// Queue a frame; a full queue drops it.
    pub(crate) fn send(&self, frame: Frame) {
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                tracing::debug!(to = frame.to(), "sender queue full, dropping frame");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub(crate) fn stop(&self) {
        self.handle.abort();
    }
}

async fn write_loop(
    node: NodeId,
    class: SenderClass,
    mut rx: mpsc::Receiver<Frame>,
    resolver: Arc<dyn AddressResolver>,
) {
    let mut conn: Option<BufWriter<TcpStream>> = None;

    while let Some(frame) = rx.recv().await {
        if conn.is_none() {
            conn = match dial(node, class, resolver.as_ref()).await {
                Some(c) => Some(c),
                None => {
                    // Unreachable: drop this frame and whatever queued behind
                    // it, then back off before the next attempt.
                    while rx.try_recv().is_ok() {}
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                    continue;
                }
            };
        }

        let w = conn.as_mut().expect("connection established above");
        let mut err = write_frame(w, &frame).await.err();

        // Group-send: drain a few more queued frames into the same flush.
        if err.is_none() {
            for _ in 0..BATCH_DRAIN {
                let Ok(next) = rx.try_recv() else {
                    break;
                };
                if let Some(e) = write_frame(w, &next).await.err() {
                    err = Some(e);
                    break;
                }
            }
        }

        if err.is_none() {
            err = w.flush().await.err().map(Into::into);
        }

        if let Some(e) = err {
            tracing::warn!(
                to = node,
                class = %class,
                error = %e,
                "send failed, closing connection"
            );
            conn = None;
        }
    }
}

async fn dial(node: NodeId, class: SenderClass, resolver: &dyn AddressResolver) -> Option<BufWriter<TcpStream>> {
    let Some(addr) = resolver.node_address(node, class) else {
        tracing::debug!(to = node, "no address for peer");
        return None;
    };

    match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            tracing::debug!(to = node, class = %class, addr = %addr, "connected");
            Some(BufWriter::with_capacity(16 * 1024, stream))
        }
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
            tracing::debug!(to = node, addr = %addr, "connection refused");
            None
        }
        Ok(Err(e)) => {
            tracing::warn!(to = node, addr = %addr, error = %e, "dial failed");
            None
        }
        Err(_) => {
            tracing::warn!(to = node, addr = %addr, "dial timed out");
            None
        }
    }
}
