//! A deliberately small game for the framework: every turn each client may
//! add a bounded step to its counter, the first slot that reaches the target
//! wins. Serves as the stock logic of the server binary and as the workload
//! of the end to end tests.

use engine_lib::traits::{ClientInfo, GameLogic, GameLogicFactory};
use protocol::{Event, MSG_INIT, MSG_STATUS, MSG_TURN, Message, TOKEN_LENGTH};
use serde_json::{Value, json};

/// The biggest step a client may take per turn, everything above is clamped.
const MAX_STEP: i64 = 10;

/// Produces one [`CountRace`] per match. Options: first the amount of
/// players, then the target count, both optional.
pub struct CountRaceFactory;

impl GameLogicFactory for CountRaceFactory {
    fn create(&self, options: &[String]) -> Box<dyn GameLogic> {
        let players = options
            .first()
            .and_then(|raw| raw.parse::<usize>().ok())
            .unwrap_or(2)
            .max(1);
        let target = options
            .get(1)
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(50)
            .max(1);
        Box::new(CountRace::new(players, target))
    }
}

pub struct CountRace {
    target: i64,
    scores: Vec<i64>,
    turn: u64,
    winner: Option<usize>,
    /// Set by the operator event "stop", ends the match without a winner.
    stopped: bool,
}

impl CountRace {
    pub fn new(players: usize, target: i64) -> CountRace {
        CountRace {
            target,
            scores: vec![0; players],
            turn: 0,
            winner: None,
            stopped: false,
        }
    }

    /// The deterministic token of a slot. Exactly [`TOKEN_LENGTH`] characters.
    pub fn token_for_slot(id: usize) -> String {
        let token = format!("count-race-client-{id:0>14}");
        debug_assert_eq!(token.len(), TOKEN_LENGTH);
        token
    }

    fn scores_as_json(&self) -> Value {
        Value::Array(self.scores.iter().map(|score| json!(score)).collect())
    }
}

impl GameLogic for CountRace {
    fn init(&mut self) {
        self.scores.iter_mut().for_each(|score| *score = 0);
        self.turn = 0;
        self.winner = None;
        self.stopped = false;
    }

    fn client_info(&self) -> Vec<ClientInfo> {
        (0..self.scores.len())
            .map(|id| ClientInfo {
                id,
                token: Self::token_for_slot(id),
            })
            .collect()
    }

    fn ui_initial_message(&self) -> Message {
        Message::new(MSG_INIT, vec![json!(self.scores.len()), json!(self.target)])
    }

    fn client_initial_messages(&self) -> Vec<Message> {
        (0..self.scores.len())
            .map(|id| Message::new(MSG_INIT, vec![json!(id), json!(self.target)]))
            .collect()
    }

    fn simulate_events(
        &mut self,
        terminal_events: &[Event],
        _environment_events: &[Event],
        client_events: &[Vec<Event>],
    ) {
        if terminal_events.iter().any(|event| event.kind == "stop") {
            self.stopped = true;
            return;
        }
        for (id, events) in client_events.iter().enumerate() {
            // Only the last add of a turn counts.
            let Some(event) = events.iter().rev().find(|event| event.kind == "add") else {
                continue;
            };
            let step = event
                .args
                .first()
                .and_then(Value::as_i64)
                .unwrap_or(0)
                .clamp(0, MAX_STEP);
            self.scores[id] += step;
        }
        if self.winner.is_none() {
            self.winner = self
                .scores
                .iter()
                .position(|score| *score >= self.target);
        }
        self.turn += 1;
    }

    fn generate_outputs(&mut self) {
        // Everything interesting is derived on demand from the scores.
    }

    fn ui_message(&self) -> Message {
        Message::new(MSG_TURN, vec![json!(self.turn), self.scores_as_json()])
    }

    fn status_message(&self) -> Message {
        Message::new(
            MSG_STATUS,
            vec![
                json!(self.turn),
                self.scores_as_json(),
                json!(self.winner),
            ],
        )
    }

    fn client_messages(&self) -> Vec<Message> {
        (0..self.scores.len())
            .map(|_| Message::new(MSG_TURN, vec![json!(self.turn), self.scores_as_json()]))
            .collect()
    }

    fn make_environment_events(&mut self) -> Vec<Event> {
        Vec::new()
    }

    fn is_game_finished(&self) -> bool {
        self.stopped || self.winner.is_some()
    }

    fn terminate(&mut self) {}
}
