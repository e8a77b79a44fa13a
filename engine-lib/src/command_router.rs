//! Maps command names to their handlers and collects operator events. The
//! router is what the terminal endpoint dispatches into, the supervisor
//! registers the actual handlers at construction time.

use crate::terminal_endpoint::TerminalInterface;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use protocol::{Event, Message};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A handler receives the already reshaped command message and produces the
/// report for the operator. Handlers may block, several terminals may invoke
/// them concurrently.
pub type CommandHandler = Box<dyn Fn(Message) -> BoxFuture<'static, Message> + Send + Sync>;

pub struct CommandRouter {
    handlers: HashMap<String, CommandHandler>,
    /// Operator events waiting for the turn loop. Drained exactly once per
    /// turn.
    terminal_events: Arc<Mutex<Vec<Event>>>,
}

impl CommandRouter {
    pub fn new() -> CommandRouter {
        CommandRouter {
            handlers: HashMap::new(),
            terminal_events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a handler. Registration happens before the endpoint listens,
    /// a later registration under the same name replaces the old handler.
    pub fn register(&mut self, name: impl Into<String>, handler: CommandHandler) {
        self.handlers.insert(name.into(), handler);
    }

    /// The queue the turn loop drains in its step for terminal events.
    pub fn terminal_events(&self) -> Arc<Mutex<Vec<Event>>> {
        self.terminal_events.clone()
    }
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalInterface for CommandRouter {
    async fn run_command(&self, command: Message) -> Message {
        match self.handlers.get(&command.name) {
            Some(handler) => handler(command).await,
            None => Message::report(vec!["This command is not defined.".to_string()]),
        }
    }

    async fn put_event(&self, event: Event) {
        self.terminal_events.lock().await.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_command_yields_the_standard_report() {
        let router = CommandRouter::new();
        let reply = router.run_command(Message::new("bogus", Vec::new())).await;
        assert_eq!(
            reply,
            Message::report(vec!["This command is not defined.".to_string()])
        );
    }

    #[tokio::test]
    async fn registered_handler_receives_the_command() {
        let mut router = CommandRouter::new();
        router.register(
            "echo",
            Box::new(|command: Message| -> BoxFuture<'static, Message> {
                Box::pin(async move { Message::report(vec![format!("echo {}", command.args.len())]) })
            }),
        );
        let reply = router
            .run_command(Message::new("echo", vec![serde_json::json!("x")]))
            .await;
        assert_eq!(reply, Message::report(vec!["echo 1".to_string()]));
    }

    #[tokio::test]
    async fn events_pile_up_until_drained() {
        let router = CommandRouter::new();
        router.put_event(Event::new("pause", Vec::new())).await;
        router.put_event(Event::new("resume", Vec::new())).await;
        let queue = router.terminal_events();
        let drained = std::mem::take(&mut *queue.lock().await);
        assert_eq!(drained.len(), 2);
        assert!(queue.lock().await.is_empty());
    }
}
