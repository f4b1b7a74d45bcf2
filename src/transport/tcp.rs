//! TCP transport: one listener per host, two lazy senders per peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::proto::read_frame;
use crate::proto::Frame;
use crate::proto::NodeId;
use crate::transport::AddressResolver;
use crate::transport::FrameHandler;
use crate::transport::Sender;
use crate::transport::SenderClass;
use crate::transport::Transport;

/// The production transport.
///
/// Outbound frames are partitioned into a heartbeat sender and a replication
/// sender per peer so control traffic is never stuck behind a bulk append.
/// Ordering holds within one sender only, which is all the protocol needs.
pub struct TcpTransport {
    resolver: Arc<dyn AddressResolver>,
    queue_size: usize,
    senders: Mutex<HashMap<(NodeId, SenderClass), Arc<Sender>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn new(resolver: Arc<dyn AddressResolver>, queue_size: usize) -> Self {
        Self {
            resolver,
            queue_size,
            senders: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    /// Bind `addr` and route every incoming frame to `handler`.
    ///
    /// Returns the bound address, so tests may listen on port 0.
    pub async fn listen(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn FrameHandler>,
    ) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "transport listening");

        let handle = tokio::spawn(accept_loop(listener, handler));
        *self.listener.lock().unwrap() = Some(handle);
        Ok(local)
    }

    fn sender_for(&self, node: NodeId, class: SenderClass) -> Arc<Sender> {
        let mut senders = self.senders.lock().unwrap();
        senders
            .entry((node, class))
            .or_insert_with(|| {
                Arc::new(Sender::spawn(node, class, self.queue_size, self.resolver.clone()))
            })
            .clone()
    }

    /// Close every sender and stop accepting.
    pub fn stop(&self) {
        if let Some(handle) = self.listener.lock().unwrap().take() {
            handle.abort();
        }
        for (_, sender) in self.senders.lock().unwrap().drain() {
            sender.stop();
        }
    }
}

impl Transport for TcpTransport {
    fn send(&self, frame: Frame) {
        let class = match &frame {
            Frame::Heartbeats(_) => SenderClass::Heartbeat,
            Frame::Message(m) if m.is_heartbeat_class() => SenderClass::Heartbeat,
            Frame::Message(_) => SenderClass::Replicate,
        };
        self.sender_for(frame.to(), class).send(frame);
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<dyn FrameHandler>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(peer = %peer, "accepted connection");
                tokio::spawn(read_loop(stream, handler.clone()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn read_loop(stream: TcpStream, handler: Arc<dyn FrameHandler>) {
    let _ = stream.set_nodelay(true);
    let mut r = BufReader::with_capacity(16 * 1024, stream);

    loop {
        match read_frame(&mut r).await {
            Ok(Some(frame)) => {
                let from = match &frame {
                    Frame::Message(m) => m.from,
                    Frame::Heartbeats(b) => b.from,
                };
                handler.handle(from, frame);
            }
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(error = %e, "connection read failed");
                return;
            }
        }
    }
}
