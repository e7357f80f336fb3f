//! Turn-taking state machine
//!
//! Pure transition logic for conversation phases. Side effects (stopping
//! playback on barge-in, publishing phases) belong to the coordinator.

use std::fmt;

use thiserror::Error;

/// Conversation phase of a live session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// Session not started
    #[default]
    Idle,
    /// Opening the transport and waiting for the handshake acknowledgment
    Connecting,
    /// Waiting for the user to speak
    Listening,
    /// The backend detected user speech
    UserSpeaking,
    /// User turn ended, response not yet audible
    AiThinking,
    /// Response audio is playing
    AiSpeaking,
    /// User barged in over the response
    Interrupted,
    /// Session ended deliberately
    Disconnected,
    /// Session failed
    Error(String),
}

impl SessionPhase {
    /// `Disconnected` and `Error` accept no further transitions
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error(_))
    }

    /// Phases after the handshake and before termination
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Listening
                | Self::UserSpeaking
                | Self::AiThinking
                | Self::AiSpeaking
                | Self::Interrupted
        )
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Listening => write!(f, "listening"),
            Self::UserSpeaking => write!(f, "user speaking"),
            Self::AiThinking => write!(f, "thinking"),
            Self::AiSpeaking => write!(f, "speaking"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Error(msg) => write!(f, "error ({msg})"),
        }
    }
}

/// Input to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// Session start requested
    Start,
    /// Handshake acknowledged by the backend
    SetupComplete,
    /// Voice activity onset
    UserSpeechStarted,
    /// Voice activity offset without a completed turn
    UserSpeechStopped,
    /// User turn ended; the backend is preparing a response
    UserTurnEnded,
    /// A response audio chunk arrived
    ModelAudio,
    /// Response turn finished
    TurnComplete,
    /// User barged in while the response was playing
    Interrupted,
    /// Unrecoverable failure
    Fail(String),
    /// Deliberate shutdown
    Shutdown,
}

/// Event not valid in the current phase
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} in phase {phase}")]
pub struct InvalidTransition {
    pub phase: SessionPhase,
    pub event: TurnEvent,
}

/// Enforces valid phase transitions
#[derive(Debug, Clone, Default)]
pub struct TurnStateMachine {
    phase: SessionPhase,
}

impl TurnStateMachine {
    /// Create a state machine in `Idle`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase
    #[must_use]
    pub const fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    /// Apply an event, returning the phases entered in order
    ///
    /// An empty vector means the event is accepted but changes nothing.
    /// `Interrupted` enters `Interrupted` and then `Listening` in one step.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` for events the current phase cannot take,
    /// including any event once the phase is terminal
    pub fn apply(&mut self, event: TurnEvent) -> Result<Vec<SessionPhase>, InvalidTransition> {
        use SessionPhase as P;

        let entered = match (&self.phase, &event) {
            (phase, _) if phase.is_terminal() => return Err(self.invalid(event)),

            (_, TurnEvent::Fail(msg)) => vec![P::Error(msg.clone())],
            (_, TurnEvent::Shutdown) => vec![P::Disconnected],

            (P::Idle, TurnEvent::Start) => vec![P::Connecting],

            (P::Connecting, TurnEvent::SetupComplete)
            | (P::UserSpeaking, TurnEvent::UserSpeechStopped)
            | (P::UserSpeaking | P::AiThinking | P::AiSpeaking, TurnEvent::TurnComplete) => {
                vec![P::Listening]
            }

            (P::Listening, TurnEvent::UserSpeechStarted) => vec![P::UserSpeaking],
            (P::Listening | P::UserSpeaking, TurnEvent::UserTurnEnded) => vec![P::AiThinking],

            (P::Listening | P::UserSpeaking | P::AiThinking, TurnEvent::ModelAudio) => {
                vec![P::AiSpeaking]
            }

            (P::AiSpeaking | P::AiThinking, TurnEvent::Interrupted) => {
                vec![P::Interrupted, P::Listening]
            }

            // Redundant signals inside a live session
            (P::AiSpeaking, TurnEvent::ModelAudio | TurnEvent::UserSpeechStarted)
            | (P::UserSpeaking, TurnEvent::UserSpeechStarted)
            | (P::AiThinking, TurnEvent::UserSpeechStarted | TurnEvent::UserTurnEnded)
            | (P::Listening, TurnEvent::TurnComplete | TurnEvent::UserSpeechStopped)
            | (P::Listening | P::UserSpeaking, TurnEvent::Interrupted) => Vec::new(),

            _ => return Err(self.invalid(event)),
        };

        if let Some(last) = entered.last() {
            tracing::trace!(from = %self.phase, to = %last, ?event, "phase transition");
            self.phase = last.clone();
        }

        Ok(entered)
    }

    fn invalid(&self, event: TurnEvent) -> InvalidTransition {
        InvalidTransition {
            phase: self.phase.clone(),
            event,
        }
    }
}
