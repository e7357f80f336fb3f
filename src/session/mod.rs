//! Live session: turn-taking, wire protocol, transport and lifecycle

mod context;
mod coordinator;
mod phase;
pub mod protocol;
mod transport;

pub use context::{FamilyMember, MemoryFact, SessionContext};
pub use coordinator::{PhaseStream, SessionCoordinator};
pub use phase::{InvalidTransition, SessionPhase, TurnEvent, TurnStateMachine};
pub use protocol::{InboundMessage, OutboundMessage};
pub use transport::{Connector, Transport, TransportError, WsConnector, WsTransport};
