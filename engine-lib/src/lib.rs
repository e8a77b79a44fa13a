//! The core of the turn based game server: a length prefixed JSON transport,
//! the three role specific endpoints (operator terminal, spectator UI, game
//! clients) and the fixed cadence turn loop that drives a pluggable game
//! logic.
//!
//! The overall architecture is like this:
//!
//! ```text
//! Terminal ──► CommandRouter ──► Supervisor ──► TurnLoop ──► GameLogic
//!                                                  │
//!                         ClientPool ◄── fan out ──┤
//!                         (N slots, barrier)       │
//!                                                  ▼
//!                                           OutputPipeline ──► UiEndpoint
//! ```
//!
//! Per turn the loop fans the game outputs out to all client slots in one
//! barrier synchronized round, opens a receive window of a fixed wall clock
//! length, keeps the last message every client delivered inside that window
//! and feeds all of it back into the game logic on the next turn.

pub mod client_handler;
pub mod client_pool;
pub mod command_router;
pub mod config;
pub mod error;
pub mod framed_socket;
pub mod listener;
pub mod output_pipeline;
pub mod supervisor;
pub mod terminal_endpoint;
pub mod traits;
pub mod turn_loop;
pub mod ui_endpoint;

pub use client_pool::ClientPool;
pub use command_router::CommandRouter;
pub use config::ServerConfig;
pub use error::{EngineError, EngineResult};
pub use framed_socket::FramedSocket;
pub use output_pipeline::{OutputPipeline, OutputPipelineConfig};
pub use supervisor::Supervisor;
pub use terminal_endpoint::{TerminalEndpoint, TerminalInterface};
pub use traits::{ClientInfo, GameLogic, GameLogicFactory};
pub use turn_loop::{LoopState, TurnLoop, TurnTimings};
pub use ui_endpoint::UiEndpoint;
