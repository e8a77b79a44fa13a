//! One handler per pre declared client slot. Two cooperating workers run for
//! every slot: a sender that drains the outbound queue one message at a time
//! and a receiver that reads whatever the client sends. The receiver caches
//! the last fully read message and, while the pool wide receive window is
//! open, also the last valid one. Both workers survive reconnects, the pool
//! simply binds a fresh socket into them.

use crate::error::EngineError;
use crate::framed_socket::{FrameReader, FrameWriter};
use protocol::{MAX_EXCEPTIONS, Message};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot, watch};

/// What travels towards the sender worker. The round marker lets the pool
/// observe that everything staged before it has really been written out.
enum SenderCommand {
    Deliver(Message),
    RoundComplete(oneshot::Sender<()>),
}

pub struct ClientHandler {
    id: usize,
    token: String,
    /// Messages queued for the next round. Promoted into the sender as one
    /// unit by [`flush`](Self::flush).
    staging: Mutex<Vec<Message>>,
    outbound: mpsc::UnboundedSender<SenderCommand>,
    writer_bind: mpsc::UnboundedSender<FrameWriter>,
    reader_bind: mpsc::UnboundedSender<FrameReader>,
    last_received: Arc<Mutex<Option<Message>>>,
    last_valid: Arc<Mutex<Option<Message>>>,
    connected: Arc<watch::Sender<bool>>,
    stop: Arc<watch::Sender<bool>>,
}

impl ClientHandler {
    /// Creates the handler and spawns its two workers. They idle until the
    /// first socket gets bound.
    pub fn spawn(id: usize, token: String, window_open: Arc<AtomicBool>) -> Arc<ClientHandler> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (writer_bind, writer_bind_rx) = mpsc::unbounded_channel();
        let (reader_bind, reader_bind_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(watch::channel(false).0);
        let stop = Arc::new(watch::channel(false).0);
        let last_received = Arc::new(Mutex::new(None));
        let last_valid = Arc::new(Mutex::new(None));

        tokio::spawn(sender_worker(
            id,
            outbound_rx,
            writer_bind_rx,
            stop.subscribe(),
            stop.clone(),
            connected.clone(),
        ));
        tokio::spawn(receiver_worker(
            id,
            reader_bind_rx,
            stop.subscribe(),
            stop.clone(),
            connected.clone(),
            last_received.clone(),
            last_valid.clone(),
            window_open,
        ));

        Arc::new(ClientHandler {
            id,
            token,
            staging: Mutex::new(Vec::new()),
            outbound,
            writer_bind,
            reader_bind,
            last_received,
            last_valid,
            connected,
            stop,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Installs a fresh connection. The workers drop their previous halves
    /// when they pick the new ones up, which closes the old socket.
    pub fn bind(&self, reader: FrameReader, writer: FrameWriter) {
        let _ = self.reader_bind.send(reader);
        let _ = self.writer_bind.send(writer);
        self.connected.send_replace(true);
    }

    /// Appends to the staging list. Nothing leaves the process yet.
    pub async fn queue(&self, message: Message) {
        self.staging.lock().await.push(message);
    }

    /// Atomically promotes the staged messages into the sender, followed by a
    /// round marker. The returned receiver resolves once everything staged at
    /// the moment of the call has been dispatched. It resolves with an error
    /// when the sender worker is gone, which callers treat as a vacuously
    /// finished round so a dead slot cannot wedge the turn cadence.
    pub async fn flush(&self) -> oneshot::Receiver<()> {
        let staged = {
            let mut staging = self.staging.lock().await;
            std::mem::take(&mut *staging)
        };
        for message in staged {
            let _ = self.outbound.send(SenderCommand::Deliver(message));
        }
        let (ack, ack_rx) = oneshot::channel();
        let _ = self.outbound.send(SenderCommand::RoundComplete(ack));
        ack_rx
    }

    /// The most recent message whose read completed inside the receive window.
    pub async fn received_message(&self) -> Option<Message> {
        self.last_valid.lock().await.clone()
    }

    /// The most recent message regardless of the window. Only interesting for
    /// diagnostics.
    pub async fn last_received_message(&self) -> Option<Message> {
        self.last_received.lock().await.clone()
    }

    /// Called when a new receive window opens.
    pub async fn clear_valid_cache(&self) {
        *self.last_valid.lock().await = None;
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Blocks until a socket is bound, or until the timeout passed. Returns
    /// whether the slot ended up connected.
    pub async fn wait_for_bound(&self, limit: Option<Duration>) -> bool {
        let mut connected = self.connected.subscribe();
        let bound = async {
            loop {
                if *connected.borrow_and_update() {
                    return true;
                }
                if connected.changed().await.is_err() {
                    return false;
                }
            }
        };
        match limit {
            None => bound.await,
            Some(limit) => tokio::time::timeout(limit, bound).await.unwrap_or(false),
        }
    }

    /// Stops both workers and drops the connection.
    pub fn terminate(&self) {
        self.stop.send_replace(true);
        self.connected.send_replace(false);
    }

    pub fn is_terminated(&self) -> bool {
        *self.stop.borrow()
    }
}

/// Drains the outbound queue towards the bound socket. Counts write failures
/// and terminates the whole handler when the cap is exceeded. Without a bound
/// socket the worker leaves the queue untouched and waits for a bind.
async fn sender_worker(
    id: usize,
    mut outbound_rx: mpsc::UnboundedReceiver<SenderCommand>,
    mut writer_bind_rx: mpsc::UnboundedReceiver<FrameWriter>,
    mut stop_rx: watch::Receiver<bool>,
    stop: Arc<watch::Sender<bool>>,
    connected: Arc<watch::Sender<bool>>,
) {
    let mut writer: Option<FrameWriter> = None;
    let mut failures: u32 = 0;
    loop {
        // Without a bound socket the queue stays untouched until a bind arrives.
        if writer.is_none() {
            tokio::select! {
                _ = stop_rx.changed() => return,
                bound = writer_bind_rx.recv() => match bound {
                    Some(fresh) => writer = Some(fresh),
                    None => return,
                },
            }
            continue;
        }
        tokio::select! {
            _ = stop_rx.changed() => return,
            bound = writer_bind_rx.recv() => match bound {
                Some(fresh) => writer = Some(fresh),
                None => return,
            },
            command = outbound_rx.recv() => match command {
                Some(SenderCommand::Deliver(message)) => {
                    let Some(active) = writer.as_mut() else { continue };
                    // After a torn frame every further write fails anyway,
                    // skip the socket and just count.
                    let result = if active.is_closed() {
                        Err(EngineError::TransportClosed)
                    } else {
                        active.send(&message).await
                    };
                    if let Err(err) = result {
                        failures += 1;
                        tracing::warn!(slot = id, %err, failures, "client send failed");
                        if failures > MAX_EXCEPTIONS {
                            tracing::error!(slot = id, "too many send failures, terminating slot");
                            stop.send_replace(true);
                            connected.send_replace(false);
                            return;
                        }
                    }
                }
                Some(SenderCommand::RoundComplete(ack)) => {
                    let _ = ack.send(());
                }
                None => return,
            },
        }
    }
}

/// Reads one message at a time from the bound socket. Every complete read
/// updates the last received cache, and additionally the last valid cache
/// whenever the window gate is open at the moment the read finishes. Only the
/// gate decides validity, there is no timestamp involved.
#[allow(clippy::too_many_arguments)]
async fn receiver_worker(
    id: usize,
    mut reader_bind_rx: mpsc::UnboundedReceiver<FrameReader>,
    mut stop_rx: watch::Receiver<bool>,
    stop: Arc<watch::Sender<bool>>,
    connected: Arc<watch::Sender<bool>>,
    last_received: Arc<Mutex<Option<Message>>>,
    last_valid: Arc<Mutex<Option<Message>>>,
    window_open: Arc<AtomicBool>,
) {
    /// What happened during one wait on the bound socket.
    enum Step {
        Stop,
        Rebind(Option<FrameReader>),
        Read(Result<Message, EngineError>),
    }

    let mut reader: Option<FrameReader> = None;
    let mut failures: u32 = 0;
    loop {
        if reader.is_none() {
            tokio::select! {
                _ = stop_rx.changed() => return,
                bound = reader_bind_rx.recv() => match bound {
                    Some(fresh) => reader = Some(fresh),
                    None => return,
                },
            }
            continue;
        }
        // The read borrows the reader, so the outcome gets dispatched after
        // the borrow ended.
        let step = {
            let Some(active) = reader.as_mut() else { continue };
            tokio::select! {
                _ = stop_rx.changed() => Step::Stop,
                bound = reader_bind_rx.recv() => Step::Rebind(bound),
                read = active.read_message() => Step::Read(read),
            }
        };
        match step {
            Step::Stop => return,
            Step::Rebind(Some(fresh)) => reader = Some(fresh),
            Step::Rebind(None) => return,
            Step::Read(Ok(message)) => {
                *last_received.lock().await = Some(message.clone());
                if window_open.load(Ordering::Acquire) {
                    *last_valid.lock().await = Some(message);
                }
            }
            Step::Read(Err(EngineError::Decode(err))) => {
                // The frame was consumed, the stream stays in sync.
                failures += 1;
                tracing::warn!(slot = id, %err, "undecodable client message");
                if failures > MAX_EXCEPTIONS {
                    tracing::error!(slot = id, "too many receive failures, terminating slot");
                    stop.send_replace(true);
                    connected.send_replace(false);
                    return;
                }
            }
            Step::Read(Err(err)) => {
                failures += 1;
                tracing::debug!(slot = id, %err, "client connection lost");
                reader = None;
                connected.send_replace(false);
                if failures > MAX_EXCEPTIONS {
                    tracing::error!(slot = id, "too many receive failures, terminating slot");
                    stop.send_replace(true);
                    return;
                }
            }
        }
    }
}
