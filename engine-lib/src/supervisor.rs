//! Owns the three endpoints and the turn loop, wires tokens and ports from
//! the configuration and exposes the operator commands. The supervisor is the
//! only place where the pieces know of each other, the command router keeps a
//! weak back reference only.

use crate::client_pool::ClientPool;
use crate::command_router::{CommandHandler, CommandRouter};
use crate::config::ServerConfig;
use crate::error::{EngineError, EngineResult};
use crate::output_pipeline::OutputPipeline;
use crate::terminal_endpoint::TerminalEndpoint;
use crate::traits::GameLogicFactory;
use crate::traits::GameLogic;
use crate::turn_loop::{LoopState, TurnLoop};
use crate::ui_endpoint::UiEndpoint;
use futures_util::future::BoxFuture;
use protocol::{Event, Message};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, watch};

/// How long a newGame issued over the terminal waits for the spectator and
/// for the clients.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(300);

/// The mutable part of the supervisor. This lock is only ever held briefly,
/// so status reads stay responsive while a newGame waits for its clients.
struct Lifecycle {
    prepared_game: Option<Box<dyn GameLogic>>,
    turn_loop: Option<Arc<TurnLoop>>,
}

pub struct Supervisor {
    config: ServerConfig,
    factory: Box<dyn GameLogicFactory>,
    pool: Arc<ClientPool>,
    ui: Arc<UiEndpoint>,
    terminal: Arc<TerminalEndpoint>,
    terminal_events: Arc<Mutex<Vec<Event>>>,
    lifecycle: Mutex<Lifecycle>,
    /// newGame and startGame serialize against each other over this guard,
    /// even when issued from different terminals at the same time.
    game_sequence: Mutex<()>,
    stopped: watch::Sender<bool>,
}

impl Supervisor {
    /// Validates the configuration and builds the whole machinery. Nothing
    /// listens yet, that happens in [`start`](Self::start) and
    /// [`new_game`](Self::new_game).
    pub fn new(
        config: ServerConfig,
        factory: Box<dyn GameLogicFactory>,
    ) -> EngineResult<Arc<Supervisor>> {
        config.validate()?;
        let supervisor = Arc::new_cyclic(|weak: &Weak<Supervisor>| {
            let mut router = CommandRouter::new();
            register_commands(&mut router, weak.clone());
            let terminal_events = router.terminal_events();
            Supervisor {
                pool: ClientPool::new(),
                ui: UiEndpoint::new(config.ui.token.clone()),
                terminal: TerminalEndpoint::new(config.terminal.token.clone(), Arc::new(router)),
                terminal_events,
                lifecycle: Mutex::new(Lifecycle {
                    prepared_game: None,
                    turn_loop: None,
                }),
                game_sequence: Mutex::new(()),
                stopped: watch::channel(false).0,
                factory,
                config,
            }
        });
        Ok(supervisor)
    }

    /// Opens the operator endpoint.
    pub async fn start(&self) -> EngineResult<()> {
        self.terminal.listen(self.config.terminal.port as u16).await?;
        tracing::info!(port = self.config.terminal.port, "terminal endpoint listening");
        Ok(())
    }

    /// Prepares a fresh match: fetch a logic from the factory, declare its
    /// slots, open the game facing ports and deliver the initial messages
    /// once everybody arrived.
    pub async fn new_game(
        &self,
        options: &[String],
        ui_timeout: Duration,
        client_timeout: Duration,
    ) -> EngineResult<()> {
        let _sequence = self.game_sequence.lock().await;
        {
            let lifecycle = self.lifecycle.lock().await;
            if let Some(turn_loop) = &lifecycle.turn_loop
                && turn_loop.state() != LoopState::Stopped
            {
                return Err(EngineError::InvalidState("a match is still running"));
            }
        }

        let mut game = self.factory.create(options);
        game.init();
        let infos = game.client_info();

        // Reset whatever a previous match left in the pool.
        self.pool.terminate().await;
        self.pool.omit_all_clients().await?;
        for (index, info) in infos.iter().enumerate() {
            if info.id != index {
                return Err(EngineError::IdMismatch {
                    expected: index,
                    declared: info.id,
                });
            }
            let id = self.pool.define_client(&info.token).await?;
            if id != index {
                return Err(EngineError::IdMismatch {
                    expected: index,
                    declared: id,
                });
            }
        }
        tracing::info!(slots = infos.len(), "new game declared");

        if self.config.ui.enable {
            self.ui.listen(self.config.ui.port as u16).await?;
            self.pool.listen(self.config.client.port as u16).await?;
            if !self.ui.wait_for_client(Some(ui_timeout)).await {
                return Err(EngineError::Interrupted);
            }
            if !self.pool.wait_for_all_clients(Some(client_timeout)).await {
                return Err(EngineError::Interrupted);
            }
            self.ui.send_blocking(game.ui_initial_message()).await?;
        } else {
            self.pool.listen(self.config.client.port as u16).await?;
            if !self.pool.wait_for_all_clients(Some(client_timeout)).await {
                return Err(EngineError::Interrupted);
            }
        }

        for (id, message) in game.client_initial_messages().into_iter().enumerate() {
            self.pool.queue(id, message).await;
        }
        self.pool.send_all_blocking().await;

        self.lifecycle.lock().await.prepared_game = Some(game);
        Ok(())
    }

    /// Spawns the turn loop over the match prepared by
    /// [`new_game`](Self::new_game).
    pub async fn start_game(&self) -> EngineResult<()> {
        let _sequence = self.game_sequence.lock().await;
        let game = self
            .lifecycle
            .lock()
            .await
            .prepared_game
            .take()
            .ok_or(EngineError::InvalidState("no prepared game, run newGame first"))?;
        let pipeline =
            OutputPipeline::spawn(self.config.output_pipeline_config(), self.ui.clone()).await;
        let turn_loop = TurnLoop::start(
            game,
            self.pool.clone(),
            pipeline,
            self.terminal_events.clone(),
            self.config.turn_timings(),
        );
        self.lifecycle.lock().await.turn_loop = Some(turn_loop);
        tracing::info!("match started");
        Ok(())
    }

    /// Stops a running match, then takes down all three endpoints.
    pub async fn shutdown(&self) {
        let turn_loop = { self.lifecycle.lock().await.turn_loop.clone() };
        if let Some(turn_loop) = turn_loop {
            turn_loop.request_shutdown();
            turn_loop.wait_for_finish().await;
        }
        self.pool.terminate().await;
        let _ = self.pool.omit_all_clients().await;
        self.ui.terminate().await;
        self.terminal.terminate().await;
        self.stopped.send_replace(true);
        tracing::info!("supervisor shut down");
    }

    /// Blocks until the current match completed. Returns immediately when no
    /// match runs.
    pub async fn wait_for_finish(&self) {
        let turn_loop = { self.lifecycle.lock().await.turn_loop.clone() };
        if let Some(turn_loop) = turn_loop {
            turn_loop.wait_for_finish().await;
        }
    }

    /// Parks the caller until a shutdown went through, used by the binary.
    pub async fn run_until_stopped(&self) {
        let mut stopped = self.stopped.subscribe();
        loop {
            if *stopped.borrow_and_update() {
                return;
            }
            if stopped.changed().await.is_err() {
                return;
            }
        }
    }

    /// The shaped status answer for the operator.
    pub async fn status_report(&self) -> Message {
        let (state, turns) = {
            let lifecycle = self.lifecycle.lock().await;
            match &lifecycle.turn_loop {
                Some(turn_loop) => (format!("{:?}", turn_loop.state()), turn_loop.turn_index()),
                None => ("Idle".to_string(), 0),
            }
        };
        let mut lines = vec![
            format!("Loop state: {state}"),
            format!("Completed turns: {turns}"),
        ];
        let count = self.pool.client_count().await;
        for id in 0..count {
            let connected = if self.pool.is_connected(id).await {
                "connected"
            } else {
                "disconnected"
            };
            lines.push(format!("Client {id}: {connected}"));
        }
        Message::report(lines)
    }

    // The bound addresses, interesting for diagnostics and tests with
    // ephemeral ports.

    pub async fn terminal_addr(&self) -> Option<SocketAddr> {
        self.terminal.local_addr().await
    }

    pub async fn pool_addr(&self) -> Option<SocketAddr> {
        self.pool.local_addr().await
    }

    pub async fn ui_addr(&self) -> Option<SocketAddr> {
        self.ui.local_addr().await
    }
}

/// The built in operator commands. Every handler only holds a weak reference,
/// the supervisor owns the endpoints, not the other way around.
fn register_commands(router: &mut CommandRouter, supervisor: Weak<Supervisor>) {
    router.register("status", handler(supervisor.clone(), |supervisor, _| async move {
        supervisor.status_report().await
    }));

    router.register("newGame", handler(supervisor.clone(), |supervisor, command| async move {
        let options: Vec<String> = command
            .args
            .iter()
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect();
        match supervisor
            .new_game(&options, DEFAULT_CONNECT_TIMEOUT, DEFAULT_CONNECT_TIMEOUT)
            .await
        {
            Ok(()) => Message::report(vec!["New game prepared, all clients connected.".to_string()]),
            Err(err) => Message::report(vec![format!("newGame failed: {err}")]),
        }
    }));

    router.register("startGame", handler(supervisor.clone(), |supervisor, _| async move {
        match supervisor.start_game().await {
            Ok(()) => Message::report(vec!["Game started.".to_string()]),
            Err(err) => Message::report(vec![format!("startGame failed: {err}")]),
        }
    }));

    router.register("waitForFinish", handler(supervisor.clone(), |supervisor, _| async move {
        supervisor.wait_for_finish().await;
        Message::report(vec!["Game finished.".to_string()])
    }));

    router.register("exit", handler(supervisor, |supervisor, _| async move {
        supervisor.shutdown().await;
        Message::report(vec!["Server is shutting down.".to_string()])
    }));
}

/// Adapts an async closure over the upgraded supervisor into a boxed command
/// handler. A command that arrives after the supervisor is gone gets a polite
/// answer instead of a crash.
fn handler<F, Fut>(supervisor: Weak<Supervisor>, body: F) -> CommandHandler
where
    F: Fn(Arc<Supervisor>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Message> + Send + 'static,
{
    Box::new(move |command: Message| -> BoxFuture<'static, Message> {
        match supervisor.upgrade() {
            Some(supervisor) => Box::pin(body(supervisor, command)),
            None => Box::pin(async { Message::report(vec!["Server is gone.".to_string()]) }),
        }
    })
}
