//! The fixed order of a turn and the end of match behavior of the loop,
//! driven by a scripted game logic.

mod support;

use engine_lib::client_pool::ClientPool;
use engine_lib::output_pipeline::{OutputPipeline, OutputPipelineConfig};
use engine_lib::traits::{ClientInfo, GameLogic};
use engine_lib::turn_loop::{LoopState, TurnLoop, TurnTimings};
use engine_lib::ui_endpoint::UiEndpoint;
use protocol::{Event, Message};
use serde_json::json;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;

/// Everything the scripted logic observed, inspected after the match.
#[derive(Default)]
struct Observations {
    simulate_calls: u64,
    terminal_events_per_turn: Vec<Vec<String>>,
    client_events_per_turn: Vec<Vec<usize>>,
    terminated: bool,
}

/// Finishes after a fixed number of simulate calls and records what it saw.
struct ScriptedGame {
    finish_after: u64,
    slots: usize,
    observations: Arc<StdMutex<Observations>>,
}

impl GameLogic for ScriptedGame {
    fn init(&mut self) {}

    fn client_info(&self) -> Vec<ClientInfo> {
        (0..self.slots)
            .map(|id| ClientInfo {
                id,
                token: format!("scripted-game-client-token-{id:05}"),
            })
            .collect()
    }

    fn ui_initial_message(&self) -> Message {
        Message::init()
    }

    fn client_initial_messages(&self) -> Vec<Message> {
        (0..self.slots).map(|_| Message::init()).collect()
    }

    fn simulate_events(
        &mut self,
        terminal_events: &[Event],
        _environment_events: &[Event],
        client_events: &[Vec<Event>],
    ) {
        let mut observations = self.observations.lock().expect("observations");
        observations.simulate_calls += 1;
        observations
            .terminal_events_per_turn
            .push(terminal_events.iter().map(|event| event.kind.clone()).collect());
        observations
            .client_events_per_turn
            .push(client_events.iter().map(Vec::len).collect());
    }

    fn generate_outputs(&mut self) {}

    fn ui_message(&self) -> Message {
        Message::new("turn", vec![json!("ui")])
    }

    fn status_message(&self) -> Message {
        Message::new("status", vec![json!("status")])
    }

    fn client_messages(&self) -> Vec<Message> {
        (0..self.slots)
            .map(|_| Message::new("turn", vec![json!("client")]))
            .collect()
    }

    fn make_environment_events(&mut self) -> Vec<Event> {
        vec![Event::new("tick", Vec::new())]
    }

    fn is_game_finished(&self) -> bool {
        self.observations.lock().expect("observations").simulate_calls >= self.finish_after
    }

    fn terminate(&mut self) {
        self.observations.lock().expect("observations").terminated = true;
    }
}

fn quiet_pipeline_config() -> OutputPipelineConfig {
    let mut path = std::env::temp_dir();
    path.push(format!("turn-loop-test-{}.log", std::process::id()));
    let _ = std::fs::remove_file(&path);
    OutputPipelineConfig {
        send_to_ui: false,
        time_interval: Duration::from_millis(50),
        send_to_file: true,
        file_path: path,
        buffer_size: 1,
        queue_capacity: 100,
    }
}

fn fast_timings() -> TurnTimings {
    TurnTimings {
        client_response_time: Duration::from_millis(30),
        simulate_timeout: Duration::from_millis(500),
        turn_timeout: Duration::from_millis(60),
    }
}

#[tokio::test]
async fn the_loop_stops_itself_when_the_game_finishes() {
    let observations = Arc::new(StdMutex::new(Observations::default()));
    let game = Box::new(ScriptedGame {
        finish_after: 3,
        slots: 0,
        observations: observations.clone(),
    });
    let pool = ClientPool::new();
    let ui = UiEndpoint::new("spectator-ui-token-0000000000000".to_string());
    let pipeline = OutputPipeline::spawn(quiet_pipeline_config(), ui).await;
    let terminal_events = Arc::new(Mutex::new(Vec::new()));

    let turn_loop = TurnLoop::start(game, pool, pipeline, terminal_events, fast_timings());
    tokio::time::timeout(Duration::from_secs(5), turn_loop.wait_for_finish())
        .await
        .expect("loop should finish on its own");

    assert_eq!(turn_loop.state(), LoopState::Stopped);
    let observations = observations.lock().expect("observations");
    assert_eq!(observations.simulate_calls, 3);
    // The finishing turn breaks before the cadence step counts it.
    assert_eq!(turn_loop.turn_index(), 2);
    assert!(observations.terminated);
}

#[tokio::test]
async fn terminal_events_are_drained_once_and_arrive_next_turn() {
    let observations = Arc::new(StdMutex::new(Observations::default()));
    let game = Box::new(ScriptedGame {
        finish_after: 3,
        slots: 0,
        observations: observations.clone(),
    });
    let pool = ClientPool::new();
    let ui = UiEndpoint::new("spectator-ui-token-0000000000000".to_string());
    let pipeline = OutputPipeline::spawn(quiet_pipeline_config(), ui).await;
    let terminal_events = Arc::new(Mutex::new(Vec::new()));
    terminal_events.lock().await.push(Event::new("pause", Vec::new()));

    let turn_loop = TurnLoop::start(
        game,
        pool,
        pipeline,
        terminal_events.clone(),
        fast_timings(),
    );
    tokio::time::timeout(Duration::from_secs(5), turn_loop.wait_for_finish())
        .await
        .expect("loop should finish on its own");

    let observations = observations.lock().expect("observations");
    // Turn one still simulates with the empty previous batch, the queued
    // event arrives in turn two and only there.
    assert_eq!(observations.terminal_events_per_turn[0], Vec::<String>::new());
    assert_eq!(observations.terminal_events_per_turn[1], vec!["pause".to_string()]);
    assert_eq!(observations.terminal_events_per_turn[2], Vec::<String>::new());
    assert!(terminal_events.lock().await.is_empty());
}

#[tokio::test]
async fn an_external_shutdown_request_stops_the_loop_between_turns() {
    let observations = Arc::new(StdMutex::new(Observations::default()));
    let game = Box::new(ScriptedGame {
        // Would run for a long time on its own.
        finish_after: 1_000_000,
        slots: 0,
        observations: observations.clone(),
    });
    let pool = ClientPool::new();
    let ui = UiEndpoint::new("spectator-ui-token-0000000000000".to_string());
    let pipeline = OutputPipeline::spawn(quiet_pipeline_config(), ui).await;
    let terminal_events = Arc::new(Mutex::new(Vec::new()));

    let turn_loop = TurnLoop::start(game, pool, pipeline, terminal_events, fast_timings());
    tokio::time::sleep(Duration::from_millis(250)).await;
    turn_loop.request_shutdown();
    tokio::time::timeout(Duration::from_secs(5), turn_loop.wait_for_finish())
        .await
        .expect("loop should drain after the request");

    assert_eq!(turn_loop.state(), LoopState::Stopped);
    let observations = observations.lock().expect("observations");
    // The logic still gets released even though the game never finished.
    assert!(observations.terminated);
    assert!(observations.simulate_calls >= 1);
}

#[tokio::test]
async fn a_connected_client_feeds_its_window_events_into_the_next_simulate() {
    let observations = Arc::new(StdMutex::new(Observations::default()));
    let game = Box::new(ScriptedGame {
        finish_after: 4,
        slots: 1,
        observations: observations.clone(),
    });
    let pool = ClientPool::new();
    pool.define_client("scripted-game-client-token-00000")
        .await
        .expect("define slot");
    pool.listen(0).await.expect("pool listen");
    let addr = pool.local_addr().await.expect("pool addr");

    // The client answers every turn message immediately with one add event.
    let mut client = support::connect(addr).await;
    support::send_message(&mut client, &Message::token("scripted-game-client-token-00000")).await;
    assert!(pool.wait_for_client(0, Some(Duration::from_secs(2))).await);
    let driver = tokio::spawn(async move {
        loop {
            let Ok(message) = support::try_read_message(&mut client).await else {
                return;
            };
            if message.name == "turn" {
                // A tiny think time puts the answer safely inside the window.
                tokio::time::sleep(Duration::from_millis(20)).await;
                let reply = Message::new("act", vec![json!([{"type": "add", "args": [1]}])]);
                support::send_message(&mut client, &reply).await;
            }
        }
    });

    let ui = UiEndpoint::new("spectator-ui-token-0000000000000".to_string());
    let pipeline = OutputPipeline::spawn(quiet_pipeline_config(), ui).await;
    let terminal_events = Arc::new(Mutex::new(Vec::new()));
    let timings = TurnTimings {
        client_response_time: Duration::from_millis(150),
        simulate_timeout: Duration::from_millis(500),
        turn_timeout: Duration::from_millis(200),
    };

    let turn_loop = TurnLoop::start(game, pool, pipeline, terminal_events, timings);
    tokio::time::timeout(Duration::from_secs(10), turn_loop.wait_for_finish())
        .await
        .expect("loop should finish");
    driver.abort();

    let observations = observations.lock().expect("observations");
    // Turn one has no previous window. From turn two on the answer of the
    // client is there.
    assert_eq!(observations.client_events_per_turn[0], vec![0]);
    assert_eq!(observations.client_events_per_turn[1], vec![1]);
    assert_eq!(observations.client_events_per_turn[2], vec![1]);
}
