//! Parley Session - presentation-state synchronization for one chat session.
//!
//! This crate contains no I/O. It provides:
//! - [`TurnAggregator`]: folds the ordered event stream of one session into
//!   finalized [`Message`]s and at most one active [`Turn`]
//! - [`PairingTable`]: per-turn lookup from tool call id to its handle
//! - [`ConnectionManager`]: connect / loss / bounded linear backoff state machine
//! - [`Projector`]: the sink contract a rendering surface implements
//! - [`ChatSession`]: the owned per-session object tying the pieces together
//!
//! Everything here is synchronous. The only suspension points live in the
//! caller that owns the channel and the reconnect timers.

pub mod aggregator;
pub mod connection;
pub mod error;
pub mod message;
pub mod pairing;
pub mod projector;
pub mod session;
pub mod state;
pub mod turn;

pub use aggregator::{Applied, TurnAggregator};
pub use connection::{
    ConnectionManager, ConnectionState, LossOutcome, ReconnectPolicy, ReconnectTimer,
};
pub use error::{ConnectionError, OrderingViolation, SendRejected};
pub use message::{Message, MessageContent, value_text};
pub use pairing::{PairingTable, ToolCallHandle};
pub use projector::{InputGate, NullProjector, Projector, ProjectorEvent, RecordingProjector};
pub use session::ChatSession;
pub use state::SessionState;
pub use turn::{ToolCall, Turn};

pub use parley_protocol::{Role, ToolCallStatus};
