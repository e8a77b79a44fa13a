//! The single spectator endpoint. One slot, hot swappable on reconnect: a new
//! successfully verified connection simply replaces the old one. Outbound
//! messages go through an unbounded deque that a single sender worker drains,
//! so messages queued while no spectator is attached are delivered as soon as
//! one shows up.

use crate::error::{EngineError, EngineResult};
use crate::framed_socket::{FramedSocket, FrameWriter};
use crate::listener::Listener;
use protocol::{MSG_TOKEN, Message, UI_VERIFY_TIMEOUT_SECS};
use serde_json::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc, oneshot, watch};
use tokio::time::Instant;

/// One queued delivery. The cancel flag and the deadline belong to the
/// deadline variant: a cancelled entry is silently skipped while it still
/// waits in the deque, and the deadline bounds the socket write itself once
/// the worker picked the entry up.
struct UiEntry {
    message: Message,
    ack: Option<oneshot::Sender<()>>,
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

/// The part of the endpoint the sender worker shares with the front side.
struct UiState {
    deque: Mutex<VecDeque<UiEntry>>,
    deque_notify: Notify,
    connected: watch::Sender<bool>,
    /// Counts successful bindings, used to wait for a reconnect.
    generation: watch::Sender<u64>,
}

pub struct UiEndpoint {
    /// Back reference to the owning Arc for the admission worker.
    me: Weak<UiEndpoint>,
    token: String,
    verify_timeout: Duration,
    state: Arc<UiState>,
    writer_tx: mpsc::UnboundedSender<FrameWriter>,
    stop: Arc<watch::Sender<bool>>,
    listener: Mutex<Option<Listener>>,
}

impl UiEndpoint {
    pub fn new(token: String) -> Arc<UiEndpoint> {
        Self::with_verify_timeout(token, Duration::from_secs(UI_VERIFY_TIMEOUT_SECS))
    }

    pub fn with_verify_timeout(token: String, verify_timeout: Duration) -> Arc<UiEndpoint> {
        let state = Arc::new(UiState {
            deque: Mutex::new(VecDeque::new()),
            deque_notify: Notify::new(),
            connected: watch::channel(false).0,
            generation: watch::channel(0).0,
        });
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let stop = Arc::new(watch::channel(false).0);
        tokio::spawn(sender_worker(state.clone(), writer_rx, stop.subscribe()));
        Arc::new_cyclic(|me| UiEndpoint {
            me: me.clone(),
            token,
            verify_timeout,
            state,
            writer_tx,
            stop,
            listener: Mutex::new(None),
        })
    }

    /// Starts accepting spectator connections. A no-op when already listening.
    pub async fn listen(&self, port: u16) -> EngineResult<()> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }
        let endpoint = self
            .me
            .upgrade()
            .ok_or(EngineError::InvalidState("ui endpoint is gone"))?;
        *listener = Some(
            Listener::spawn(port, move |socket| {
                let endpoint = endpoint.clone();
                verify_and_bind(endpoint, socket)
            })
            .await?,
        );
        Ok(())
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(|l| l.local_addr())
    }

    /// Fire and forget. The message sits in the deque until a spectator is
    /// attached and the worker gets to it.
    pub async fn send(&self, message: Message) {
        self.push_entry(UiEntry {
            message,
            ack: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
        })
        .await;
    }

    /// Resolves once the message has really been written to a spectator.
    pub async fn send_blocking(&self, message: Message) -> EngineResult<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.push_entry(UiEntry {
            message,
            ack: Some(ack),
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
        })
        .await;
        ack_rx.await.map_err(|_| EngineError::Interrupted)
    }

    /// Best effort delivery under a hard deadline that bounds the delivery
    /// itself, not just our wait: an entry still sitting in the deque at the
    /// deadline is cancelled in place, and a write that is in flight at the
    /// deadline is aborted by the worker (see [`sender_worker`]). Both sides
    /// race the same instant, so a message can not slip out after the caller
    /// already gave up and retried. Returns whether the write happened in
    /// time.
    pub async fn send_within(&self, message: Message, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let cancelled = Arc::new(AtomicBool::new(false));
        let (ack, ack_rx) = oneshot::channel();
        self.push_entry(UiEntry {
            message,
            ack: Some(ack),
            cancelled: cancelled.clone(),
            deadline: Some(deadline),
        })
        .await;
        match tokio::time::timeout_at(deadline, ack_rx).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                cancelled.store(true, Ordering::Release);
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.state.connected.borrow()
    }

    /// Blocks until a spectator is attached.
    pub async fn wait_for_client(&self, limit: Option<Duration>) -> bool {
        let mut connected = self.state.connected.subscribe();
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

    /// Blocks until a binding that happens after this call, i.e. a reconnect.
    pub async fn wait_for_new_client(&self, limit: Option<Duration>) -> bool {
        let mut generation = self.state.generation.subscribe();
        generation.borrow_and_update();
        let rebound = async { generation.changed().await.is_ok() };
        match limit {
            None => rebound.await,
            Some(limit) => tokio::time::timeout(limit, rebound).await.unwrap_or(false),
        }
    }

    /// Stops the listener and the sender worker. Queued messages are dropped.
    pub async fn terminate(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.terminate().await;
        }
        self.stop.send_replace(true);
        self.state.connected.send_replace(false);
    }

    async fn push_entry(&self, entry: UiEntry) {
        self.state.deque.lock().await.push_back(entry);
        self.state.deque_notify.notify_one();
    }
}

/// Same admission as the terminal, but against the single UI token and with a
/// short verification budget. A successful bind replaces the previous
/// spectator.
async fn verify_and_bind(endpoint: Arc<UiEndpoint>, socket: FramedSocket) -> EngineResult<()> {
    let (mut reader, mut writer) = socket.split();
    let first = tokio::time::timeout(endpoint.verify_timeout, reader.read_message())
        .await
        .map_err(|_| EngineError::AuthRejected)??;
    let presented = match (first.name.as_str(), first.args.first()) {
        (MSG_TOKEN, Some(Value::String(token))) => token.as_str(),
        _ => "",
    };
    if presented != endpoint.token {
        let _ = writer.send(&Message::wrong_token()).await;
        writer.close().await;
        return Err(EngineError::AuthRejected);
    }
    // The spectator direction is outbound only, the read half is not needed.
    drop(reader);
    let _ = endpoint.writer_tx.send(writer);
    endpoint.state.connected.send_replace(true);
    endpoint.state.generation.send_modify(|generation| *generation += 1);
    tracing::info!("spectator connected");
    Ok(())
}

/// Drains the deque towards the currently bound spectator. A failed write
/// puts the entry back at the front and waits for a reconnect, so nothing is
/// lost and nothing is reordered. A write that misses its deadline is aborted
/// together with the connection instead, because the peer may already have
/// read part of the frame.
async fn sender_worker(
    state: Arc<UiState>,
    mut writer_rx: mpsc::UnboundedReceiver<FrameWriter>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut writer: Option<FrameWriter> = None;
    loop {
        if writer.is_none() {
            tokio::select! {
                _ = stop_rx.changed() => return,
                bound = writer_rx.recv() => match bound {
                    Some(fresh) => writer = Some(fresh),
                    None => return,
                },
            }
            continue;
        }
        let Some(mut entry) = pop_pending(&state).await else {
            tokio::select! {
                _ = stop_rx.changed() => return,
                bound = writer_rx.recv() => match bound {
                    Some(fresh) => writer = Some(fresh),
                    None => return,
                },
                _ = state.deque_notify.notified() => {}
            }
            continue;
        };
        let Some(active) = writer.as_mut() else {
            state.deque.lock().await.push_front(entry);
            continue;
        };
        // The caller may have given up while the entry sat in the deque.
        if entry.cancelled.load(Ordering::Acquire) {
            continue;
        }
        // A deadline bounds the socket write itself. An aborted write leaves
        // a torn frame behind, so the connection can not be kept.
        let write_result = match entry.deadline {
            None => Some(active.send(&entry.message).await),
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, active.send(&entry.message)).await {
                    Ok(result) => Some(result),
                    Err(_) => {
                        active.close().await;
                        None
                    }
                }
            }
        };
        match write_result {
            Some(Ok(())) => {
                if let Some(ack) = entry.ack.take() {
                    let _ = ack.send(());
                }
            }
            Some(Err(err)) => {
                tracing::warn!(%err, "spectator send failed, keeping message for reconnect");
                state.deque.lock().await.push_front(entry);
                writer = None;
                state.connected.send_replace(false);
            }
            None => {
                tracing::warn!("spectator write missed its deadline, dropping the connection");
                // The entry is consumed, the caller retries against a fresh
                // connection if it still wants to.
                writer = None;
                state.connected.send_replace(false);
            }
        }
    }
}

/// Pops the first entry that has not been cancelled in the meantime.
async fn pop_pending(state: &UiState) -> Option<UiEntry> {
    let mut deque = state.deque.lock().await;
    while let Some(entry) = deque.pop_front() {
        if !entry.cancelled.load(Ordering::Acquire) {
            return Some(entry);
        }
    }
    None
}
