//! Gapless playback queue with hard-stop
//!
//! The async side holds a [`PlaybackHandle`]; the real-time output callback
//! owns the [`PlaybackRenderer`]. They share only a lock-free channel and a
//! few atomics, so the audio callback never waits on the session.
//!
//! `stop()` bumps an epoch counter and drains the channel. The renderer
//! compares epochs on every callback and drops anything older, including a
//! frame it was halfway through.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender};

use super::codec::{AudioFrame, i16_to_f32};

#[derive(Debug)]
struct TaggedFrame {
    epoch: u64,
    frame: AudioFrame,
}

#[derive(Debug, Default)]
struct PlaybackShared {
    epoch: AtomicU64,
    playing: AtomicBool,
    played_frames: AtomicU64,
}

/// Create a connected handle/renderer pair
#[must_use]
pub fn playback_channel() -> (PlaybackHandle, PlaybackRenderer) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let shared = Arc::new(PlaybackShared::default());

    let handle = PlaybackHandle {
        tx,
        drain: rx.clone(),
        shared: Arc::clone(&shared),
    };
    let renderer = PlaybackRenderer {
        rx,
        shared,
        epoch: 0,
        current: VecDeque::new(),
    };

    (handle, renderer)
}

/// Session-side control of playback
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    tx: Sender<TaggedFrame>,
    drain: Receiver<TaggedFrame>,
    shared: Arc<PlaybackShared>,
}

impl PlaybackHandle {
    /// Schedule a frame after everything already queued
    ///
    /// Empty frames are ignored. Playback begins on the renderer's next
    /// callback.
    pub fn enqueue(&self, frame: AudioFrame) {
        if frame.is_empty() {
            return;
        }

        let epoch = self.shared.epoch.load(Ordering::Acquire);
        let samples = frame.len();
        if self.tx.send(TaggedFrame { epoch, frame }).is_err() {
            tracing::debug!("playback renderer gone, dropping frame");
            return;
        }
        self.shared.playing.store(true, Ordering::Release);

        tracing::trace!(samples, queued = self.tx.len(), "playback frame queued");
    }

    /// Discard all queued and in-flight audio immediately
    ///
    /// Idempotent; `enqueue` may be called again afterwards.
    pub fn stop(&self) {
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        let discarded = self.drain.try_iter().count();
        self.shared.playing.store(false, Ordering::Release);

        if discarded > 0 {
            tracing::debug!(discarded, "playback stopped");
        }
    }

    /// Whether audio is queued or being rendered
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    /// Frames waiting for the renderer
    #[must_use]
    pub fn queued_frames(&self) -> usize {
        self.tx.len()
    }

    /// Frames the renderer has finished
    #[must_use]
    pub fn played_frames(&self) -> u64 {
        self.shared.played_frames.load(Ordering::Relaxed)
    }
}

/// Real-time consumer, owned by the output callback
#[derive(Debug)]
pub struct PlaybackRenderer {
    rx: Receiver<TaggedFrame>,
    shared: Arc<PlaybackShared>,
    epoch: u64,
    current: VecDeque<i16>,
}

impl PlaybackRenderer {
    /// Frames queued but not yet started
    #[must_use]
    pub fn pending_frames(&self) -> usize {
        self.rx.len()
    }

    /// Fill an interleaved output buffer
    ///
    /// Mono samples are copied to every channel; silence is written once the
    /// queue runs dry. Never blocks.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);

        let epoch = self.shared.epoch.load(Ordering::Acquire);
        if epoch != self.epoch {
            self.epoch = epoch;
            self.current.clear();
        }

        for frame in out.chunks_mut(channels) {
            let sample = self.next_sample().map_or(0.0, i16_to_f32);
            frame.fill(sample);
        }

        let active = !self.current.is_empty() || !self.rx.is_empty();
        if self.shared.epoch.load(Ordering::Acquire) == self.epoch {
            self.shared.playing.store(active, Ordering::Release);
        }
    }

    fn next_sample(&mut self) -> Option<i16> {
        loop {
            if let Some(sample) = self.current.pop_front() {
                if self.current.is_empty() {
                    self.shared.played_frames.fetch_add(1, Ordering::Relaxed);
                }
                return Some(sample);
            }

            let tagged = self.rx.try_recv().ok()?;
            if tagged.epoch < self.epoch {
                continue;
            }
            self.current.extend(tagged.frame.into_samples());
        }
    }
}
