//! The operator endpoint. Several terminals may be connected at the same
//! time, every accepted connection gets its own worker that authenticates the
//! operator and then dispatches commands and events to the registered
//! interface.

use crate::error::{EngineError, EngineResult};
use crate::framed_socket::{FramedSocket, FrameReader, FrameWriter};
use crate::listener::Listener;
use async_trait::async_trait;
use protocol::{Event, MAX_RECEIVE_EXCEPTIONS, MSG_COMMAND, MSG_EVENT, MSG_TOKEN, Message};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

/// What the terminal endpoint dispatches into. Commands may block for a long
/// time (an operator can wait for the end of a match), so the interface is
/// async.
#[async_trait]
pub trait TerminalInterface: Send + Sync {
    /// Executes one shaped command and returns the report for the operator.
    async fn run_command(&self, command: Message) -> Message;

    /// Injects one operator event into the running match. No response.
    async fn put_event(&self, event: Event);
}

pub struct TerminalEndpoint {
    /// Back reference to the owning Arc for the connection workers.
    me: Weak<TerminalEndpoint>,
    token: String,
    interface: Arc<dyn TerminalInterface>,
    listener: Mutex<Option<Listener>>,
}

impl TerminalEndpoint {
    pub fn new(token: String, interface: Arc<dyn TerminalInterface>) -> Arc<TerminalEndpoint> {
        Arc::new_cyclic(|me| TerminalEndpoint {
            me: me.clone(),
            token,
            interface,
            listener: Mutex::new(None),
        })
    }

    pub async fn listen(&self, port: u16) -> EngineResult<()> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }
        let endpoint = self
            .me
            .upgrade()
            .ok_or(EngineError::InvalidState("terminal endpoint is gone"))?;
        *listener = Some(
            Listener::spawn(port, move |socket| {
                let endpoint = endpoint.clone();
                endpoint.handle_connection(socket)
            })
            .await?,
        );
        Ok(())
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(|l| l.local_addr())
    }

    /// Stops accepting new terminals. Workers of connected terminals run
    /// until their connection ends.
    pub async fn terminate(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.terminate().await;
        }
    }

    /// The complete lifetime of one operator connection: handshake first,
    /// then the command loop until the socket dies or the operator misbehaved
    /// too often.
    async fn handle_connection(self: Arc<Self>, socket: FramedSocket) -> EngineResult<()> {
        let (mut reader, mut writer) = socket.split();

        // There is no explicit verification deadline here, the blocking read
        // is the timeout.
        let first = reader.read_message().await?;
        if !self.token_accepted(&first) {
            let _ = writer.send(&Message::wrong_token()).await;
            writer.close().await;
            return Err(EngineError::AuthRejected);
        }
        writer.send(&Message::init()).await?;
        tracing::info!("terminal connected");

        self.command_loop(&mut reader, &mut writer).await;
        writer.close().await;
        Ok(())
    }

    fn token_accepted(&self, first: &Message) -> bool {
        first.name == MSG_TOKEN
            && matches!(first.args.first(), Some(Value::String(token)) if *token == self.token)
    }

    async fn command_loop(&self, reader: &mut FrameReader, writer: &mut FrameWriter) {
        let mut failures: u32 = 0;
        loop {
            let message = match reader.read_message().await {
                Ok(message) => message,
                Err(EngineError::Decode(err)) => {
                    failures += 1;
                    tracing::warn!(%err, failures, "undecodable terminal message");
                    if failures > MAX_RECEIVE_EXCEPTIONS {
                        tracing::error!("terminal exceeded its exception cap, closing");
                        return;
                    }
                    continue;
                }
                // Socket level failures close the connection unconditionally.
                Err(err) => {
                    tracing::debug!(%err, "terminal connection lost");
                    return;
                }
            };
            match message.name.as_str() {
                MSG_COMMAND => {
                    let reply = match shape_command(&message) {
                        Ok(command) => self.interface.run_command(command).await,
                        Err(err) => {
                            failures += 1;
                            tracing::warn!(%err, failures, "malformed terminal command");
                            if failures > MAX_RECEIVE_EXCEPTIONS {
                                tracing::error!("terminal exceeded its exception cap, closing");
                                return;
                            }
                            Message::report(vec!["Malformed command.".to_string()])
                        }
                    };
                    if writer.send(&reply).await.is_err() {
                        return;
                    }
                }
                MSG_EVENT => match shape_event(&message) {
                    Ok(event) => self.interface.put_event(event).await,
                    Err(err) => {
                        failures += 1;
                        tracing::warn!(%err, failures, "malformed terminal event");
                        if failures > MAX_RECEIVE_EXCEPTIONS {
                            tracing::error!("terminal exceeded its exception cap, closing");
                            return;
                        }
                    }
                },
                other => {
                    tracing::debug!(name = other, "unknown terminal message");
                    let report = Message::report(vec!["Message is not defined.".to_string()]);
                    if writer.send(&report).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Reshapes `{"name":"command","args":[<cmd>,[<a1>,...]]}` into the command
/// message `{"name":<cmd>,"args":[<a1>,...]}` the router dispatches on.
fn shape_command(message: &Message) -> EngineResult<Message> {
    let Some(Value::String(command_name)) = message.args.first() else {
        return Err(EngineError::InvalidState("command name missing"));
    };
    let arguments = match message.args.get(1) {
        Some(Value::Array(list)) => {
            let mut arguments = Vec::with_capacity(list.len());
            for entry in list {
                let Value::String(argument) = entry else {
                    return Err(EngineError::InvalidState("command argument not a string"));
                };
                arguments.push(Value::String(argument.clone()));
            }
            arguments
        }
        None => Vec::new(),
        Some(_) => return Err(EngineError::InvalidState("command arguments not a list")),
    };
    Ok(Message::new(command_name.clone(), arguments))
}

fn shape_event(message: &Message) -> EngineResult<Event> {
    let Some(raw) = message.args.first() else {
        return Err(EngineError::InvalidState("event payload missing"));
    };
    Ok(serde_json::from_value::<Event>(raw.clone())?)
}
