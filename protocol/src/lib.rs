//! The message and event structures that travel over the wire plus the limits
//! the server and the clients have to agree on. They are used consistent across
//! all three endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The length every access token has to have.
pub const TOKEN_LENGTH: usize = 32;

/// How many transport failures a single slot worker tolerates before it terminates itself.
pub const MAX_EXCEPTIONS: u32 = 20;

/// How many command failures a terminal connection tolerates before it gets closed.
pub const MAX_RECEIVE_EXCEPTIONS: u32 = 20;

/// The maximum amount of messages the output pipeline keeps before the backlog gets discarded.
pub const QUEUE_DEFAULT_SIZE: usize = 100_000;

/// The time budget a pool client has to present its token (seconds). Clients may
/// legitimately connect long before a match starts, so this is generous.
pub const CLIENT_VERIFY_TIMEOUT_SECS: u64 = 1000;

/// The time budget the spectator UI has to present its token (seconds).
pub const UI_VERIFY_TIMEOUT_SECS: u64 = 10;

/// The hard deadline for a single spectator delivery attempt (milliseconds).
pub const UI_SEND_DEADLINE_MS: u64 = 1000;

// Reserved message names. Everything else is free for the game logic.

/// First message in every direction that requires admission.
pub const MSG_TOKEN: &str = "token";
/// Sent to a terminal (and by game logics to their clients) after a successful handshake.
pub const MSG_INIT: &str = "init";
/// The per turn payload name used by the stock game logics.
pub const MSG_TURN: &str = "turn";
/// The per turn status summary name used by the stock game logics.
pub const MSG_STATUS: &str = "status";
/// Tells a client that the match is over and the connection may be dropped.
pub const MSG_SHUTDOWN: &str = "shutdown";
/// The rejection answer for a failed admission.
pub const MSG_WRONG_TOKEN: &str = "wrong token";
/// A terminal request that should be dispatched to a command handler.
pub const MSG_COMMAND: &str = "command";
/// A terminal request that injects an event into the running match.
pub const MSG_EVENT: &str = "event";
/// The standard envelope for every terminal command answer.
pub const MSG_REPORT: &str = "report";

/// One framed unit on the wire: a name and a list of free form JSON arguments.
/// A message is immutable once it has been sent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    /// What kind of message this is, see the reserved names above.
    pub name: String,
    /// The payload. The interpretation depends completely on the name.
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Message {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Message {
            name: name.into(),
            args,
        }
    }

    /// The admission message a connecting party presents first.
    pub fn token(token: &str) -> Self {
        Message::new(MSG_TOKEN, vec![Value::String(token.to_string())])
    }

    /// The handshake confirmation. Carries one empty list so old operator
    /// clients that index into the arguments keep working.
    pub fn init() -> Self {
        Message::new(MSG_INIT, vec![Value::Array(Vec::new())])
    }

    /// The rejection answer before the socket gets closed.
    pub fn wrong_token() -> Self {
        Message::new(MSG_WRONG_TOKEN, Vec::new())
    }

    /// The end of match announcement for the game clients.
    pub fn shutdown() -> Self {
        Message::new(MSG_SHUTDOWN, Vec::new())
    }

    /// The standard answer envelope for terminal commands: a single list of
    /// report lines.
    pub fn report(lines: Vec<String>) -> Self {
        let lines = lines.into_iter().map(Value::String).collect();
        Message::new(MSG_REPORT, vec![Value::Array(lines)])
    }
}

/// One game event as produced by a terminal, the environment or a game client.
/// The kind is free form and gets interpreted by the game logic alone.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Event {
    /// The discriminator of the event.
    #[serde(rename = "type")]
    pub kind: String,
    /// Free form payload of the event.
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Event {
    pub fn new(kind: impl Into<String>, args: Vec<Value>) -> Self {
        Event {
            kind: kind.into(),
            args,
        }
    }
}
