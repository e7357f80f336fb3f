//! Shared test utilities

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use companion_live::voice::{AudioBackend, AudioDevice, CaptureProducer, PlaybackRenderer};
use companion_live::{
    Connector, Error, FamilyMember, InboundMessage, LiveConfig, OutboundMessage, PhaseStream,
    SessionContext, SessionPhase, Transport, TransportError,
};

const STEP_TIMEOUT: Duration = Duration::from_secs(2);

/// Scripted transport: tests push inbound messages, sent messages are recorded
pub struct MockTransport {
    inbound_tx: mpsc::UnboundedSender<Result<InboundMessage, TransportError>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<InboundMessage, TransportError>>>,
    sent: Mutex<Vec<OutboundMessage>>,
    closed: AtomicBool,
    closes: AtomicUsize,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        })
    }

    /// Deliver a message as if the backend sent it
    pub fn push(&self, message: InboundMessage) {
        self.inbound_tx.send(Ok(message)).unwrap();
    }

    /// Deliver a raw JSON document
    pub fn push_json(&self, json: &str) {
        self.push(InboundMessage::parse(json));
    }

    /// Make the next receive fail
    pub fn fail(&self, error: TransportError) {
        self.inbound_tx.send(Err(error)).unwrap();
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_audio(&self) -> usize {
        self.sent().iter().filter(|m| m.is_audio()).count()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn receive(&self) -> Result<InboundMessage, TransportError> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.unwrap_or(Err(TransportError::ConnectionClosed))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector returning a fixed transport or a fixed error
pub struct MockConnector {
    transport: Option<Arc<MockTransport>>,
    error: Option<TransportError>,
    connects: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn ok(transport: &Arc<MockTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport: Some(Arc::clone(transport)),
            error: None,
            connects: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(error: TransportError) -> Arc<Self> {
        Arc::new(Self {
            transport: None,
            error: Some(error),
            connects: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Transport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());

        match (&self.transport, &self.error) {
            (Some(transport), _) => Ok(Arc::clone(transport) as Arc<dyn Transport>),
            (None, Some(error)) => Err(error.clone()),
            (None, None) => Err(TransportError::Connect("no transport scripted".to_string())),
        }
    }
}

/// Audio backend without hardware; keeps the pipeline ends for inspection
#[derive(Default)]
pub struct MockAudio {
    fail: bool,
    starts: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
    producer: Mutex<Option<CaptureProducer>>,
    renderer: Mutex<Option<PlaybackRenderer>>,
}

impl MockAudio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Frames waiting in the playback queue
    pub fn pending_playback(&self) -> usize {
        self.renderer
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, PlaybackRenderer::pending_frames)
    }

    /// Feed one capture buffer as the hardware callback would
    pub fn capture(&self, captured_at: Duration, samples: &[f32], sample_rate: u32) {
        let mut producer = self.producer.lock().unwrap();
        producer
            .as_mut()
            .expect("audio not started")
            .push(captured_at, samples, sample_rate, 1);
    }
}

impl AudioBackend for MockAudio {
    fn start(
        &self,
        capture: CaptureProducer,
        playback: PlaybackRenderer,
    ) -> companion_live::Result<Box<dyn AudioDevice>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Audio("no input device available".to_string()));
        }

        *self.producer.lock().unwrap() = Some(capture);
        *self.renderer.lock().unwrap() = Some(playback);

        Ok(Box::new(MockDevice {
            shutdowns: Arc::clone(&self.shutdowns),
        }))
    }
}

struct MockDevice {
    shutdowns: Arc<AtomicUsize>,
}

impl AudioDevice for MockDevice {
    fn shutdown(self: Box<Self>) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Valid live configuration with short timeouts
pub fn live_config() -> LiveConfig {
    LiveConfig {
        api_key: Some("test-key".to_string()),
        endpoint: "wss://example.invalid/live".to_string(),
        handshake_timeout: Duration::from_secs(2),
        capture_poll_interval: Duration::from_millis(5),
        ..LiveConfig::default()
    }
}

/// A profile with one family member
pub fn anna_context() -> SessionContext {
    SessionContext {
        user_name: "Joe".to_string(),
        family: vec![FamilyMember {
            name: "Anna".to_string(),
            relation: "Wife".to_string(),
        }],
        memories: vec![],
    }
}

/// Next phase, failing the test if none arrives in time
pub async fn next_phase(phases: &mut PhaseStream) -> Option<SessionPhase> {
    tokio::time::timeout(STEP_TIMEOUT, phases.next())
        .await
        .expect("timed out waiting for phase")
}

/// Every remaining phase until the stream closes
pub async fn remaining_phases(phases: &mut PhaseStream) -> Vec<SessionPhase> {
    let mut seen = Vec::new();
    while let Some(phase) = next_phase(phases).await {
        seen.push(phase);
    }
    seen
}

/// Poll `condition` until it holds
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(STEP_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}
