//! The fixed cadence heart of a match. Exactly one worker drives the game
//! logic turn by turn: fan the outputs out, open the receive window, overlap
//! the environment event generation with the client think time, collect what
//! came back and keep the cadence.

use crate::client_pool::ClientPool;
use crate::output_pipeline::OutputPipeline;
use crate::traits::GameLogic;
use protocol::{Event, Message};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

/// The observable lifecycle of the loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Starting,
    /// Between two turns.
    Running,
    /// Inside the work of one turn.
    Turn,
    Draining,
    Stopped,
}

/// The three wall clock knobs of a match.
#[derive(Clone, Copy, Debug)]
pub struct TurnTimings {
    /// Length of the receive window, the only hard per turn constraint.
    pub client_response_time: Duration,
    /// Advisory budget for the simulation step. Overruns are logged, never
    /// preempted.
    pub simulate_timeout: Duration,
    /// The fixed cadence between two simulate invocations.
    pub turn_timeout: Duration,
}

pub struct TurnLoop {
    state: watch::Sender<LoopState>,
    shutdown_requested: AtomicBool,
    turn_index: AtomicU64,
}

impl TurnLoop {
    /// Spawns the loop worker over a prepared match. The pool must already
    /// carry the connected slots.
    pub fn start(
        game: Box<dyn GameLogic>,
        pool: Arc<ClientPool>,
        pipeline: Arc<OutputPipeline>,
        terminal_events: Arc<Mutex<Vec<Event>>>,
        timings: TurnTimings,
    ) -> Arc<TurnLoop> {
        let state = watch::channel(LoopState::Idle).0;
        let turn_loop = Arc::new(TurnLoop {
            state,
            shutdown_requested: AtomicBool::new(false),
            turn_index: AtomicU64::new(0),
        });
        let worker = turn_loop.clone();
        tokio::spawn(async move {
            run_match(game, pool, pipeline, terminal_events, timings, worker).await;
        });
        turn_loop
    }

    /// Makes the loop exit after the turn it is currently in.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// The number of completed turns.
    pub fn turn_index(&self) -> u64 {
        self.turn_index.load(Ordering::Acquire)
    }

    /// Externally observable end of the match.
    pub async fn wait_for_finish(&self) {
        let mut state = self.state.subscribe();
        loop {
            if *state.borrow_and_update() == LoopState::Stopped {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn run_match(
    mut game: Box<dyn GameLogic>,
    pool: Arc<ClientPool>,
    pipeline: Arc<OutputPipeline>,
    terminal_events: Arc<Mutex<Vec<Event>>>,
    timings: TurnTimings,
    turn_loop: Arc<TurnLoop>,
) {
    turn_loop.state.send_replace(LoopState::Starting);
    let slot_count = pool.client_count().await;
    let mut previous_terminal: Vec<Event> = Vec::new();
    let mut previous_environment: Vec<Event> = Vec::new();
    let mut previous_client: Vec<Vec<Event>> = vec![Vec::new(); slot_count];
    let mut game_terminated = false;
    turn_loop.state.send_replace(LoopState::Running);

    loop {
        // The shutdown flag is polled between turns only.
        if turn_loop.shutdown_requested.load(Ordering::Acquire) {
            break;
        }
        turn_loop.state.send_replace(LoopState::Turn);
        let turn_started = Instant::now();
        let turn = turn_loop.turn_index.load(Ordering::Acquire);

        // 1. + 2. Advance the state and let the logic prepare its outputs.
        game.simulate_events(&previous_terminal, &previous_environment, &previous_client);
        game.generate_outputs();
        let simulated = turn_started.elapsed();
        if simulated > timings.simulate_timeout {
            tracing::warn!(
                turn,
                elapsed_ms = simulated.as_millis() as u64,
                budget_ms = timings.simulate_timeout.as_millis() as u64,
                "simulation overran its advisory budget"
            );
        }

        // 3. A finished game says goodbye to everyone and ends the loop.
        if game.is_game_finished() {
            tracing::info!(turn, "game finished");
            for id in 0..slot_count {
                pool.queue(id, Message::shutdown()).await;
            }
            pool.send_all_blocking().await;
            game.terminate();
            game_terminated = true;
            turn_loop.shutdown_requested.store(true, Ordering::Release);
            break;
        }

        // 4. Spectator and status output decoupled over the pipeline.
        if let Err(err) = pipeline.put_message(game.ui_message()).await {
            tracing::error!(%err, "output pipeline rejected the ui message, shutting down");
            turn_loop.shutdown_requested.store(true, Ordering::Release);
            break;
        }
        if let Err(err) = pipeline.put_message(game.status_message()).await {
            tracing::error!(%err, "output pipeline rejected the status message, shutting down");
            turn_loop.shutdown_requested.store(true, Ordering::Release);
            break;
        }

        // 5. Stage the per client payloads, then release them in one round.
        let client_messages = game.client_messages();
        for (id, message) in client_messages.into_iter().enumerate().take(slot_count) {
            pool.queue(id, message).await;
        }
        pool.send_all_blocking().await;

        // 6. + 7. Open the window. Generating the environment events runs
        // inside the window so its cost overlaps the client think time.
        pool.start_receiving_all().await;
        let window_started = Instant::now();
        previous_environment = game.make_environment_events();
        let elapsed = window_started.elapsed();
        if let Some(remainder) = timings.client_response_time.checked_sub(elapsed) {
            tokio::time::sleep(remainder).await;
        }
        pool.stop_receiving_all();

        // 8. Collect. An absent or empty answer means no input this turn.
        for (id, events) in previous_client.iter_mut().enumerate() {
            *events = pool.get_received_event(id).await.unwrap_or_default();
        }

        // 9. Drain the operator events exactly once per turn.
        previous_terminal = {
            let mut queue = terminal_events.lock().await;
            std::mem::take(&mut *queue)
        };

        // 10. Keep the cadence. The remainder sleep belongs to this turn.
        turn_loop.turn_index.fetch_add(1, Ordering::Release);
        turn_loop.state.send_replace(LoopState::Running);
        let turn_duration = turn_started.elapsed();
        match timings.turn_timeout.checked_sub(turn_duration) {
            Some(remainder) => tokio::time::sleep(remainder).await,
            None => tracing::warn!(
                turn,
                elapsed_ms = turn_duration.as_millis() as u64,
                cadence_ms = timings.turn_timeout.as_millis() as u64,
                "turn overran the cadence"
            ),
        }
    }

    turn_loop.state.send_replace(LoopState::Draining);
    if !game_terminated {
        game.terminate();
    }
    pipeline.shutdown().await;
    turn_loop.state.send_replace(LoopState::Stopped);
    tracing::info!(
        turns = turn_loop.turn_index.load(Ordering::Acquire),
        "turn loop stopped"
    );
}
