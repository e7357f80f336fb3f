//! Session lifecycle
//!
//! [`SessionCoordinator::begin`] spawns a driver task that owns every
//! resource of the session: the transport, the capture sender, the playback
//! handle and the audio device guard. The driver is the only consumer of
//! inbound messages, so state transitions happen strictly in arrival order.
//! Phases are published on an unbounded stream that closes once the driver
//! has released everything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::context::SessionContext;
use super::phase::{SessionPhase, TurnEvent, TurnStateMachine};
use super::protocol::{InboundMessage, OutboundMessage};
use super::transport::{Connector, Transport, TransportError};
use crate::config::LiveConfig;
use crate::voice::{
    AudioBackend, AudioDevice, CapturePipeline, PlaybackHandle, capture_channel, decode_playback,
    playback_channel,
};
use crate::{Error, Result};

/// Ordered phase updates for one session; ends after teardown
pub type PhaseStream = UnboundedReceiverStream<SessionPhase>;

/// Owns the lifecycle of one live conversation
pub struct SessionCoordinator {
    config: LiveConfig,
    connector: Arc<dyn Connector>,
    audio: Arc<dyn AudioBackend>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    phase: watch::Sender<SessionPhase>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCoordinator {
    #[must_use]
    pub fn new(
        config: LiveConfig,
        connector: Arc<dyn Connector>,
        audio: Arc<dyn AudioBackend>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (phase, _) = watch::channel(SessionPhase::Idle);
        Self {
            config,
            connector,
            audio,
            started: AtomicBool::new(false),
            shutdown,
            phase,
            driver: Mutex::new(None),
        }
    }

    /// Start the session and return its phase stream
    ///
    /// Returns immediately; connection and handshake progress is reported on
    /// the stream. An invalid configuration yields a stream with exactly one
    /// `Error` phase and no connection attempt. Must be called inside a
    /// Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::Session` if this coordinator was already started or ended
    pub fn begin(&self, context: SessionContext) -> Result<PhaseStream> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::Session("session already started".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let stream = UnboundedReceiverStream::new(rx);

        let url = match self.config.url() {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "session not started");
                let phase = SessionPhase::Error(e.to_string());
                self.phase.send_replace(phase.clone());
                let _ = tx.send(phase);
                return Ok(stream);
            }
        };

        let driver = Driver {
            config: self.config.clone(),
            url,
            connector: Arc::clone(&self.connector),
            audio: Arc::clone(&self.audio),
            context,
            machine: TurnStateMachine::new(),
            phases: tx,
            phase: self.phase.clone(),
            shutdown: self.shutdown.subscribe(),
        };

        let handle = tokio::spawn(driver.run());
        if let Ok(mut slot) = self.driver.lock() {
            *slot = Some(handle);
        }

        tracing::info!(model = %self.config.model, "session starting");
        Ok(stream)
    }

    /// End the session and release every resource
    ///
    /// Idempotent and safe from any phase, including before `begin`. Returns
    /// once the transport is closed and the audio device released.
    pub async fn end(&self) {
        self.started.store(true, Ordering::Release);
        self.shutdown.send_replace(true);

        let handle = self.driver.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "session driver failed");
        }
    }

    /// Most recently published phase
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase.borrow().clone()
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// How the live part of a session ended
enum Outcome {
    /// `end()` was called or the coordinator dropped
    Shutdown,
    /// The backend closed the connection gracefully
    Closed,
    Failed(Error),
}

/// Resources held by a running session
#[derive(Default)]
struct Session {
    transport: Option<Arc<dyn Transport>>,
    capture: Option<CapturePipeline>,
    playback: Option<PlaybackHandle>,
    device: Option<Box<dyn AudioDevice>>,
}

struct Driver {
    config: LiveConfig,
    url: String,
    connector: Arc<dyn Connector>,
    audio: Arc<dyn AudioBackend>,
    context: SessionContext,
    machine: TurnStateMachine,
    phases: mpsc::UnboundedSender<SessionPhase>,
    phase: watch::Sender<SessionPhase>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self) {
        let mut session = Session::default();
        let outcome = self.drive(&mut session).await;
        self.teardown(session, outcome).await;
    }

    async fn drive(&mut self, session: &mut Session) -> Outcome {
        self.apply(TurnEvent::Start);

        let connected = tokio::select! {
            result = self.connector.connect(&self.url) => result,
            () = wait_shutdown(&mut self.shutdown) => return Outcome::Shutdown,
        };
        let transport = match connected {
            Ok(transport) => transport,
            Err(e) => return Outcome::Failed(e.into()),
        };
        session.transport = Some(Arc::clone(&transport));

        let setup = OutboundMessage::setup(
            &self.config.model,
            &self.config.voice,
            self.context.system_instruction(),
        );
        let sent = tokio::select! {
            result = transport.send(&setup) => result,
            () = wait_shutdown(&mut self.shutdown) => return Outcome::Shutdown,
        };
        if let Err(e) = sent {
            return Outcome::Failed(e.into());
        }

        let timeout = self.config.handshake_timeout;
        let acknowledged = tokio::select! {
            result = tokio::time::timeout(timeout, wait_setup_complete(transport.as_ref())) => result,
            () = wait_shutdown(&mut self.shutdown) => return Outcome::Shutdown,
        };
        match acknowledged {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Outcome::Failed(e.into()),
            Err(_) => {
                tracing::warn!(?timeout, "no setupComplete received");
                return Outcome::Failed(TransportError::Timeout(timeout).into());
            }
        }

        tracing::info!("session established");
        self.apply(TurnEvent::SetupComplete);

        let (producer, queue) = capture_channel(self.config.capture_backlog);
        let (playback, renderer) = playback_channel();
        let audio = Arc::clone(&self.audio);
        match tokio::task::spawn_blocking(move || audio.start(producer, renderer)).await {
            Ok(Ok(device)) => session.device = Some(device),
            Ok(Err(e)) => return Outcome::Failed(e),
            Err(e) => return Outcome::Failed(Error::Audio(format!("audio startup failed: {e}"))),
        }

        session.playback = Some(playback.clone());
        session.capture = Some(CapturePipeline::spawn(
            queue,
            Arc::clone(&transport),
            self.config.capture_poll_interval,
        ));

        self.receive_loop(transport.as_ref(), &playback).await
    }

    async fn receive_loop(
        &mut self,
        transport: &dyn Transport,
        playback: &PlaybackHandle,
    ) -> Outcome {
        loop {
            let received = tokio::select! {
                result = transport.receive() => result,
                () = wait_shutdown(&mut self.shutdown) => return Outcome::Shutdown,
            };

            match received {
                Ok(message) => self.handle(message, playback),
                Err(e) if e.is_graceful() => {
                    tracing::info!("connection closed by backend");
                    return Outcome::Closed;
                }
                Err(e) => return Outcome::Failed(e.into()),
            }
        }
    }

    fn handle(&mut self, message: InboundMessage, playback: &PlaybackHandle) {
        match message {
            InboundMessage::SetupComplete => {
                tracing::debug!("ignoring repeated setupComplete");
            }
            InboundMessage::Interrupted => {
                playback.stop();
                self.apply(TurnEvent::Interrupted);
            }
            InboundMessage::ModelAudio {
                data,
                turn_complete,
            } => {
                match decode_playback(&data) {
                    Ok(frame) => {
                        self.apply(TurnEvent::ModelAudio);
                        playback.enqueue(frame);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, bytes = data.len(), "dropping undecodable audio");
                    }
                }
                if turn_complete {
                    self.apply(TurnEvent::TurnComplete);
                }
            }
            InboundMessage::TurnComplete => self.apply(TurnEvent::TurnComplete),
            InboundMessage::InputTranscription { text, finished } => {
                tracing::debug!(chars = text.len(), finished, "input transcription");
                if finished {
                    self.apply(TurnEvent::UserTurnEnded);
                } else {
                    self.apply(TurnEvent::UserSpeechStarted);
                }
            }
            InboundMessage::ModelText { text } => {
                tracing::debug!(chars = text.len(), "model text");
                self.apply(TurnEvent::UserTurnEnded);
            }
            InboundMessage::GenerationComplete => {
                tracing::debug!("generation complete");
            }
            InboundMessage::GoAway { time_left } => {
                tracing::warn!(?time_left, "backend will close the session soon");
            }
            InboundMessage::Unrecognized { reason } => {
                tracing::warn!(%reason, "ignoring unrecognized message");
            }
        }
    }

    /// Release resources in order, then publish the terminal phase
    async fn teardown(&mut self, mut session: Session, outcome: Outcome) {
        if let Some(transport) = session.transport.take() {
            transport.close().await;
        }
        if let Some(capture) = session.capture.take() {
            capture.stop();
        }
        if let Some(playback) = session.playback.take() {
            playback.stop();
        }
        if let Some(device) = session.device.take()
            && let Err(e) = tokio::task::spawn_blocking(move || device.shutdown()).await
        {
            tracing::error!(error = %e, "audio device release failed");
        }

        if !self.machine.phase().is_terminal() {
            match outcome {
                Outcome::Shutdown | Outcome::Closed => self.apply(TurnEvent::Shutdown),
                Outcome::Failed(error) => {
                    tracing::error!(%error, "session failed");
                    self.apply(TurnEvent::Fail(error.to_string()));
                }
            }
        }

        tracing::info!(phase = %self.machine.phase(), "session ended");
    }

    fn apply(&mut self, event: TurnEvent) {
        match self.machine.apply(event) {
            Ok(entered) => {
                for phase in entered {
                    self.phase.send_replace(phase.clone());
                    // Receiver may be gone; teardown still runs
                    let _ = self.phases.send(phase);
                }
            }
            Err(e) => tracing::warn!(error = %e, "ignoring event"),
        }
    }
}

/// Read inbound messages until the handshake is acknowledged
async fn wait_setup_complete(transport: &dyn Transport) -> std::result::Result<(), TransportError> {
    loop {
        match transport.receive().await? {
            InboundMessage::SetupComplete => return Ok(()),
            other => tracing::debug!(message = ?other, "message before handshake ignored"),
        }
    }
}

/// Resolve once shutdown is requested or the coordinator is gone
async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let requested = *shutdown.borrow_and_update();
        if requested || shutdown.changed().await.is_err() {
            return;
        }
    }
}
