//! The contract between the engine and the pluggable game logic. The engine
//! drives a logic strictly turn by turn, the logic never talks to the network
//! itself.
//!
//! A match runs like this: the supervisor fetches a fresh logic from the
//! factory, calls [`GameLogic::init`] and declares the slots from
//! [`GameLogic::client_info`]. Once every client is connected the initial
//! messages go out. From then on the turn loop calls
//! [`GameLogic::simulate_events`] with everything collected in the previous
//! turn, lets the logic generate its outputs and fans them out, while
//! [`GameLogic::make_environment_events`] runs inside the receive window so
//! its cost overlaps the client think time.

use protocol::{Event, Message};

/// Declares one pre defined client slot of a match. The id returned here has
/// to equal the position in the list, the supervisor verifies that.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientInfo {
    pub id: usize,
    /// The admission token of the slot, 32 ASCII characters.
    pub token: String,
}

/// The game logic of one match. Implementations do not need to be thread
/// safe, the turn loop is the only caller.
pub trait GameLogic: Send {
    /// Prepare for a fresh match.
    fn init(&mut self);

    /// The slots the match wants, in slot id order.
    fn client_info(&self) -> Vec<ClientInfo>;

    /// Sent once to the spectator after all clients connected.
    fn ui_initial_message(&self) -> Message;

    /// Sent once to every client after all clients connected, indexed by slot id.
    fn client_initial_messages(&self) -> Vec<Message>;

    /// Advance the state by one turn. The client events are indexed by slot
    /// id, an empty list means no input this turn.
    fn simulate_events(
        &mut self,
        terminal_events: &[Event],
        environment_events: &[Event],
        client_events: &[Vec<Event>],
    );

    /// Internal preparation of the per turn outputs, runs right after the
    /// simulation step.
    fn generate_outputs(&mut self);

    /// The spectator payload of this turn.
    fn ui_message(&self) -> Message;

    /// The status summary of this turn.
    fn status_message(&self) -> Message;

    /// The per client payloads of this turn, indexed by slot id.
    fn client_messages(&self) -> Vec<Message>;

    /// Produces the environment events for the next turn. Gets invoked during
    /// the receive window on purpose: its wall clock cost overlaps the time
    /// the clients are thinking anyway.
    fn make_environment_events(&mut self) -> Vec<Event>;

    fn is_game_finished(&self) -> bool;

    /// The match is over, release whatever the logic holds.
    fn terminate(&mut self);
}

/// Produces a fresh game logic for every new match.
pub trait GameLogicFactory: Send + Sync {
    fn create(&self, options: &[String]) -> Box<dyn GameLogic>;
}
