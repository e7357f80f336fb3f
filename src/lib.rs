//! Companion Live - live voice session engine for a memory-support companion
//!
//! This library holds a bidirectional streaming session with a conversational
//! AI backend:
//! - Microphone capture, encoded to 16 kHz PCM wire frames
//! - Gapless playback of 24 kHz PCM response audio, with hard-stop on barge-in
//! - An explicit turn-taking state machine published as a phase stream
//! - A request/response fallback for when the live session cannot be held
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Caller (UI / CLI)                    │
//! │        begin(context) ──▶ phase stream ◀── end()     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               Session Coordinator                    │
//! │  Turn State Machine │ Receive Loop │ Capture Sender  │
//! └───────┬─────────────────────┬───────────────┬───────┘
//!         │                     │               │
//! ┌───────▼───────┐   ┌─────────▼──────┐  ┌─────▼───────┐
//! │   Transport   │   │    Playback    │  │   Capture   │
//! │  (WebSocket)  │   │ (codec → out)  │  │ (mic→codec) │
//! └───────────────┘   └────────────────┘  └─────────────┘
//! ```

pub mod config;
pub mod error;
pub mod fallback;
pub mod session;
pub mod voice;

pub use config::{Config, LiveConfig};
pub use error::{Error, Result};
pub use fallback::FallbackClient;
pub use session::{
    Connector, FamilyMember, InboundMessage, MemoryFact, OutboundMessage, PhaseStream,
    SessionContext, SessionCoordinator, SessionPhase, Transport, TransportError,
    TurnEvent, TurnStateMachine, WsConnector,
};
pub use voice::{AudioBackend, AudioDevice, AudioFrame, CpalBackend};
