//! Administers the N pre declared client slots of a match: admission of
//! incoming connections by token, the barrier synchronized per turn fan out
//! and the receive window gating. The pool never touches a socket directly,
//! every socket belongs to the handler of its slot.

use crate::client_handler::ClientHandler;
use crate::error::{EngineError, EngineResult};
use crate::framed_socket::FramedSocket;
use crate::listener::Listener;
use protocol::{CLIENT_VERIFY_TIMEOUT_SECS, Event, MSG_TOKEN, Message};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Barrier, Mutex};
use tokio::time::Instant;

/// Lifecycle of the accept side. Slot definition is only legal while we are
/// not listening.
enum ListenState {
    Idle,
    Listening(Listener),
    Terminated,
}

pub struct ClientPool {
    /// Back reference to the owning Arc, needed to hand the admission worker
    /// something it may hold on to.
    me: Weak<ClientPool>,
    slots: Mutex<Vec<Arc<ClientHandler>>>,
    token_map: Mutex<HashMap<String, usize>>,
    /// The receive window gate shared with every slot receiver.
    window_open: Arc<AtomicBool>,
    listen_state: Mutex<ListenState>,
    verify_timeout: Duration,
}

impl ClientPool {
    pub fn new() -> Arc<ClientPool> {
        Self::with_verify_timeout(Duration::from_secs(CLIENT_VERIFY_TIMEOUT_SECS))
    }

    /// The verification budget is configurable so rejection paths stay
    /// testable without quarter hour waits.
    pub fn with_verify_timeout(verify_timeout: Duration) -> Arc<ClientPool> {
        Arc::new_cyclic(|me| ClientPool {
            me: me.clone(),
            slots: Mutex::new(Vec::new()),
            token_map: Mutex::new(HashMap::new()),
            window_open: Arc::new(AtomicBool::new(false)),
            listen_state: Mutex::new(ListenState::Idle),
            verify_timeout,
        })
    }

    /// Appends a new slot for the token and returns its id. Ids are dense and
    /// stable, the id equals the position in the slot list.
    pub async fn define_client(&self, token: &str) -> EngineResult<usize> {
        let state = self.listen_state.lock().await;
        if matches!(*state, ListenState::Listening(_)) {
            return Err(EngineError::InvalidState(
                "clients can not be defined while the pool is listening",
            ));
        }
        let mut token_map = self.token_map.lock().await;
        if token_map.contains_key(token) {
            return Err(EngineError::DuplicateToken(token.to_string()));
        }
        let mut slots = self.slots.lock().await;
        let id = slots.len();
        slots.push(ClientHandler::spawn(
            id,
            token.to_string(),
            self.window_open.clone(),
        ));
        token_map.insert(token.to_string(), id);
        Ok(id)
    }

    pub async fn client_count(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Starts accepting connections for the declared slots.
    pub async fn listen(&self, port: u16) -> EngineResult<()> {
        let mut state = self.listen_state.lock().await;
        if matches!(*state, ListenState::Listening(_)) {
            return Err(EngineError::InvalidState("pool already listens"));
        }
        let pool = self
            .me
            .upgrade()
            .ok_or(EngineError::InvalidState("pool is gone"))?;
        let listener = Listener::spawn(port, move |socket| {
            let pool = pool.clone();
            verify_and_bind(pool, socket)
        })
        .await?;
        *state = ListenState::Listening(listener);
        Ok(())
    }

    /// The address the pool listener is bound to, if it is listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.listen_state.lock().await {
            ListenState::Listening(listener) => Some(listener.local_addr()),
            _ => None,
        }
    }

    /// Stops accepting. The slot workers keep draining until their caps.
    pub async fn terminate(&self) {
        let mut state = self.listen_state.lock().await;
        if let ListenState::Listening(listener) =
            std::mem::replace(&mut *state, ListenState::Terminated)
        {
            listener.terminate().await;
        }
    }

    /// Terminates every slot and forgets both registries. Only legal while
    /// not listening.
    pub async fn omit_all_clients(&self) -> EngineResult<()> {
        let state = self.listen_state.lock().await;
        if matches!(*state, ListenState::Listening(_)) {
            return Err(EngineError::InvalidState(
                "clients can not be omitted while the pool is listening",
            ));
        }
        drop(state);
        // Same lock order as define_client: token map first, then the slots.
        let mut token_map = self.token_map.lock().await;
        let mut slots = self.slots.lock().await;
        for slot in slots.drain(..) {
            slot.terminate();
        }
        token_map.clear();
        Ok(())
    }

    /// Stages a message for one slot. Nothing is sent before
    /// [`send_all_blocking`](Self::send_all_blocking).
    pub async fn queue(&self, id: usize, message: Message) {
        if let Some(slot) = self.slot(id).await {
            slot.queue(message).await;
        }
    }

    /// Releases the staged queue of every slot and waits until each of them
    /// dispatched exactly this one round. Every slot task waits on the
    /// rendezvous barrier, performs its flush, then waits again; we raise the
    /// barrier twice, once to start everyone and once to rejoin. No slot can
    /// begin its next round before all slots finished the current one.
    pub async fn send_all_blocking(&self) {
        let slots: Vec<Arc<ClientHandler>> = self.slots.lock().await.clone();
        if slots.is_empty() {
            return;
        }
        let barrier = Arc::new(Barrier::new(slots.len() + 1));
        for slot in slots {
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                let round = slot.flush().await;
                // A closed channel means the slot terminated, which counts as
                // a finished round.
                let _ = round.await;
                barrier.wait().await;
            });
        }
        barrier.wait().await;
        barrier.wait().await;
    }

    /// Clears all valid caches, then opens the receive window. Everything a
    /// slot finishes reading from now on becomes its valid message.
    pub async fn start_receiving_all(&self) {
        let slots = self.slots.lock().await.clone();
        for slot in &slots {
            slot.clear_valid_cache().await;
        }
        self.window_open.store(true, Ordering::Release);
    }

    /// Closes the receive window. Later reads only update the last received
    /// cache.
    pub fn stop_receiving_all(&self) {
        self.window_open.store(false, Ordering::Release);
    }

    /// The message the slot received inside the current or most recent window.
    pub async fn get_received_message(&self, id: usize) -> Option<Message> {
        self.slot(id).await?.received_message().await
    }

    /// Decodes the first argument of the valid message as a list of events.
    /// No valid message or an undecodable payload both mean no input this turn.
    pub async fn get_received_event(&self, id: usize) -> Option<Vec<Event>> {
        let message = self.get_received_message(id).await?;
        let first = message.args.into_iter().next()?;
        match serde_json::from_value::<Vec<Event>>(first) {
            Ok(events) => Some(events),
            Err(err) => {
                tracing::warn!(slot = id, %err, "client events not decodable");
                None
            }
        }
    }

    pub async fn is_connected(&self, id: usize) -> bool {
        match self.slot(id).await {
            Some(slot) => slot.is_connected(),
            None => false,
        }
    }

    /// Blocks until the slot has a bound socket or the timeout passed.
    pub async fn wait_for_client(&self, id: usize, limit: Option<Duration>) -> bool {
        match self.slot(id).await {
            Some(slot) => slot.wait_for_bound(limit).await,
            None => false,
        }
    }

    /// Waits for every slot in order. The budget is shared: the time one slot
    /// took is subtracted from what the following slots may still use, and we
    /// give up as soon as the budget is gone.
    pub async fn wait_for_all_clients(&self, limit: Option<Duration>) -> bool {
        let slots = self.slots.lock().await.clone();
        match limit {
            None => {
                for slot in slots {
                    if !slot.wait_for_bound(None).await {
                        return false;
                    }
                }
                true
            }
            Some(total) => {
                let deadline = Instant::now() + total;
                for slot in slots {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() || !slot.wait_for_bound(Some(remaining)).await {
                        return false;
                    }
                }
                true
            }
        }
    }

    async fn slot(&self, id: usize) -> Option<Arc<ClientHandler>> {
        self.slots.lock().await.get(id).cloned()
    }
}

/// Runs the admission protocol for one accepted connection: read exactly one
/// message within the verification budget and check it against the token map.
/// A failed verification closes the socket without any feedback.
async fn verify_and_bind(pool: Arc<ClientPool>, socket: FramedSocket) -> EngineResult<()> {
    let (mut reader, writer) = socket.split();
    let first = tokio::time::timeout(pool.verify_timeout, reader.read_message())
        .await
        .map_err(|_| EngineError::AuthRejected)??;
    if first.name != MSG_TOKEN {
        return Err(EngineError::AuthRejected);
    }
    let Some(Value::String(token)) = first.args.first() else {
        return Err(EngineError::AuthRejected);
    };
    let id = {
        let token_map = pool.token_map.lock().await;
        token_map.get(token).copied()
    }
    .ok_or(EngineError::AuthRejected)?;
    let slot = pool.slot(id).await.ok_or(EngineError::AuthRejected)?;
    slot.bind(reader, writer);
    tracing::info!(slot = id, "game client connected");
    Ok(())
}
