//! Master client: one DEALER connection, pumped by a background task
//!
//! The client owns a single connection to `master_host:master_port` and
//! exposes three things to the runner: a non-blocking buffered `send`, a
//! stream of decoded inbound messages, and a `disconnected` signal that
//! resolves once the transport has observed a fatal error or `close()` has
//! finished flushing.
//!
//! Frame layout follows the wire contract: outgoing frames are
//! `[node-id][payload]`, incoming frames are `[master-id][payload]` and the
//! master identity frame is discarded. Reconnection is not attempted here;
//! the slave runner re-registers instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use zeromq::{Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::message::Message;

/// Minimum outbound buffer depth required by the wire contract.
pub const MIN_OUTBOUND_BUFFER: usize = 128;

/// Errors surfaced by the master client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The initial connect failed.
    #[error("failed to connect to master at {endpoint}: {source}")]
    Connect {
        /// The `tcp://host:port` endpoint that was dialed.
        endpoint: String,
        /// Underlying transport error.
        #[source]
        source: zeromq::ZmqError,
    },
}

/// Bounded outbound queue with the drop-oldest-non-heartbeat shedding
/// policy. Single consumer (the socket pump), many producers.
struct SendQueue {
    messages: Mutex<VecDeque<Message>>,
    capacity: usize,
    available: Notify,
    closed: AtomicBool,
}

impl SendQueue {
    fn new(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            available: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue without blocking. On overflow the oldest non-heartbeat
    /// message is shed so liveness beacons survive a stalled transport.
    fn push(&self, msg: Message) {
        let mut queue = match self.messages.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        if queue.len() >= self.capacity {
            let victim = queue
                .iter()
                .position(|m| !m.is_heartbeat())
                .unwrap_or(0);
            if let Some(dropped) = queue.remove(victim) {
                tracing::warn!(typ = %dropped.typ, "outbound queue full, dropping oldest frame");
            }
        }
        queue.push_back(msg);
        self.available.notify_one();
    }

    /// Dequeue, waiting for messages. Returns `None` once closed and empty.
    async fn pop(&self) -> Option<Message> {
        loop {
            let notified = self.available.notified();
            {
                let mut queue = match self.messages.lock() {
                    Ok(q) => q,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(msg) = queue.pop_front() {
                    return Some(msg);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Dequeue whatever is left without waiting. Used by the graceful-close
    /// flush.
    fn drain(&self) -> Vec<Message> {
        let mut queue = match self.messages.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.drain(..).collect()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_waiters();
    }
}

/// Handle to a running master client.
///
/// `send` never blocks and never fails; delivery is best-effort once the
/// transport dies, which is what the `disconnected` signal reports.
pub struct ClientHandle {
    queue: Arc<SendQueue>,
    incoming: mpsc::Receiver<Message>,
    disconnected: watch::Receiver<bool>,
    shutdown: Arc<Notify>,
}

impl ClientHandle {
    /// Queue a message for the master.
    pub fn send(&self, msg: Message) {
        self.queue.push(msg);
    }

    /// Receive the next decoded inbound message. `None` means the transport
    /// is gone for good.
    pub async fn recv(&mut self) -> Option<Message> {
        self.incoming.recv().await
    }

    /// A watch on the disconnected flag; flips to `true` exactly once.
    pub fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected.clone()
    }

    /// Wait until the transport has shut down (fatal error or after
    /// [`close`](Self::close) finished flushing).
    pub async fn wait_disconnected(&self) {
        let mut rx = self.disconnected.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Ask the pump to flush the outbound queue and shut the socket down.
    pub fn close(&self) {
        self.queue.close();
        self.shutdown.notify_one();
    }

    /// Build a handle from raw channel halves, bypassing the socket pump.
    ///
    /// This is the seam for in-process harnesses: the returned
    /// [`InProcessMaster`] plays the master's side of the connection.
    pub fn in_process(outbound_buffer: usize) -> (ClientHandle, InProcessMaster) {
        let queue = Arc::new(SendQueue::new(outbound_buffer.max(1)));
        let (in_tx, in_rx) = mpsc::channel(outbound_buffer.max(1));
        let (disc_tx, disc_rx) = watch::channel(false);
        let disc_tx = Arc::new(disc_tx);
        let shutdown = Arc::new(Notify::new());

        let (out_tx, out_rx) = mpsc::channel(outbound_buffer.max(1));
        let forward_queue = Arc::clone(&queue);
        let forward_disc = Arc::clone(&disc_tx);
        tokio::spawn(async move {
            while let Some(msg) = forward_queue.pop().await {
                if out_tx.send(msg).await.is_err() {
                    break;
                }
            }
            // Queue closed and flushed: the "transport" is down.
            let _ = forward_disc.send(true);
        });

        let handle = ClientHandle {
            queue,
            incoming: in_rx,
            disconnected: disc_rx,
            shutdown,
        };
        let master = InProcessMaster {
            from_slave: out_rx,
            to_slave: in_tx,
            disconnected: disc_tx,
        };
        (handle, master)
    }
}

/// The master's end of an in-process connection pair.
pub struct InProcessMaster {
    /// Messages the slave sent.
    pub from_slave: mpsc::Receiver<Message>,
    /// Sender delivering messages to the slave.
    pub to_slave: mpsc::Sender<Message>,
    /// Setting this to `true` simulates a fatal transport error.
    pub disconnected: Arc<watch::Sender<bool>>,
}

/// Connector for the real DEALER transport.
pub struct MasterClient;

impl MasterClient {
    /// Connect to `tcp://host:port` and spawn the socket pump.
    ///
    /// `outbound_buffer` is clamped up to [`MIN_OUTBOUND_BUFFER`].
    pub async fn connect(
        host: &str,
        port: u16,
        node_id: &str,
        outbound_buffer: usize,
    ) -> Result<ClientHandle, ClientError> {
        let endpoint = format!("tcp://{host}:{port}");
        let mut socket = zeromq::DealerSocket::new();
        socket
            .connect(&endpoint)
            .await
            .map_err(|source| ClientError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;
        tracing::info!(%endpoint, %node_id, "connected to master");

        let queue = Arc::new(SendQueue::new(outbound_buffer.max(MIN_OUTBOUND_BUFFER)));
        let (in_tx, in_rx) = mpsc::channel(MIN_OUTBOUND_BUFFER);
        let (disc_tx, disc_rx) = watch::channel(false);
        let shutdown = Arc::new(Notify::new());

        tokio::spawn(pump(
            socket,
            Arc::clone(&queue),
            in_tx,
            node_id.to_owned(),
            disc_tx,
            Arc::clone(&shutdown),
        ));

        Ok(ClientHandle {
            queue,
            incoming: in_rx,
            disconnected: disc_rx,
            shutdown,
        })
    }
}

enum PumpEvent {
    Shutdown,
    Outbound(Option<Message>),
    Inbound(Result<ZmqMessage, zeromq::ZmqError>),
}

/// Owns the socket. Everything that needs `&mut socket` happens here, in one
/// place, so sends and receives interleave without contention.
async fn pump(
    mut socket: zeromq::DealerSocket,
    queue: Arc<SendQueue>,
    in_tx: mpsc::Sender<Message>,
    node_id: String,
    disconnected: watch::Sender<bool>,
    shutdown: Arc<Notify>,
) {
    let mut graceful = false;
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.notified() => PumpEvent::Shutdown,
            out = queue.pop() => PumpEvent::Outbound(out),
            inbound = socket.recv() => PumpEvent::Inbound(inbound),
        };
        match event {
            PumpEvent::Shutdown => {
                graceful = true;
                break;
            }
            PumpEvent::Outbound(None) => {
                graceful = true;
                break;
            }
            PumpEvent::Outbound(Some(msg)) => {
                if !send_frame(&mut socket, &node_id, &msg).await {
                    break;
                }
            }
            PumpEvent::Inbound(Ok(frames)) => {
                if let Some(msg) = decode_frames(frames) {
                    if in_tx.send(msg).await.is_err() {
                        graceful = true;
                        break;
                    }
                }
            }
            PumpEvent::Inbound(Err(e)) => {
                tracing::error!(error = %e, "transport error, dropping master session");
                break;
            }
        }
    }

    if graceful {
        // Flush what is already queued (the quit message, typically) before
        // reporting the session closed.
        for msg in queue.drain() {
            if !send_frame(&mut socket, &node_id, &msg).await {
                break;
            }
        }
    }
    socket.close().await;
    let _ = disconnected.send(true);
}

async fn send_frame(socket: &mut zeromq::DealerSocket, node_id: &str, msg: &Message) -> bool {
    let payload = match msg.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(typ = %msg.typ, error = %e, "failed to encode message, skipping");
            return true;
        }
    };
    let mut frames = ZmqMessage::from(node_id.to_owned());
    frames.push_back(payload.into());
    match socket.send(frames).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "failed to send frame, dropping master session");
            false
        }
    }
}

/// Pull the payload out of `[master-id][payload]`. Codec errors are logged
/// and skipped; the connection stays up.
fn decode_frames(frames: ZmqMessage) -> Option<Message> {
    let frames = frames.into_vec();
    if frames.len() < 2 {
        tracing::warn!(frames = frames.len(), "short frame from master, skipping");
        return None;
    }
    let payload = &frames[frames.len() - 1];
    match Message::decode(payload) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::warn!(error = %e, "undecodable frame from master, skipping");
            None
        }
    }
}
