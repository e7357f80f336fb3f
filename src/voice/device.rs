//! Audio hardware access
//!
//! `cpal` streams cannot move between threads, so [`CpalBackend`] builds both
//! streams on a dedicated thread and parks it until shutdown. The returned
//! [`AudioDevice`] guard is `Send` and joins that thread when released.

use std::path::Path;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig, StreamInstant};
use crossbeam_channel::Sender;

use super::capture::CaptureProducer;
use super::codec::{AudioFrame, PLAYBACK_SAMPLE_RATE};
use super::playback::PlaybackRenderer;
use crate::{Error, Result};

/// Opens the microphone and speaker for one session
pub trait AudioBackend: Send + Sync {
    /// Start capture into `capture` and playback from `playback`
    ///
    /// Blocks until both streams are running.
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if either device cannot be opened
    fn start(
        &self,
        capture: CaptureProducer,
        playback: PlaybackRenderer,
    ) -> Result<Box<dyn AudioDevice>>;
}

/// Running audio streams; releasing the guard releases the hardware
pub trait AudioDevice: Send {
    /// Stop both streams and release the devices
    fn shutdown(self: Box<Self>);
}

/// Default host input and output devices via `cpal`
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalBackend;

impl CpalBackend {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn start(
        &self,
        capture: CaptureProducer,
        playback: PlaybackRenderer,
    ) -> Result<Box<dyn AudioDevice>> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("audio-device".to_string())
            .spawn(move || {
                let streams = match open_streams(capture, playback) {
                    Ok(streams) => {
                        let _ = ready_tx.send(Ok(()));
                        streams
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Parked until shutdown or the guard is dropped
                let _ = stop_rx.recv();
                drop(streams);
                tracing::debug!("audio streams released");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalDevice {
                stop: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Audio("audio thread exited during startup".to_string()))
            }
        }
    }
}

struct CpalDevice {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalDevice {
    fn release(&mut self) {
        // Dropping the sender wakes the audio thread
        self.stop.take();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("audio thread panicked");
        }
    }
}

impl AudioDevice for CpalDevice {
    fn shutdown(mut self: Box<Self>) {
        self.release();
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.release();
    }
}

struct Streams {
    _input: Stream,
    _output: Stream,
}

fn open_streams(mut capture: CaptureProducer, mut playback: PlaybackRenderer) -> Result<Streams> {
    let host = cpal::default_host();

    let input_device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;
    let input_config: StreamConfig = input_device
        .default_input_config()
        .map_err(|e| Error::Audio(e.to_string()))?
        .config();

    let sample_rate = input_config.sample_rate.0;
    let channels = input_config.channels;

    tracing::debug!(
        device = input_device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio capture initialized"
    );

    let mut origin: Option<StreamInstant> = None;
    let mut clock = CaptureClock::default();
    let input = input_device
        .build_input_stream(
            &input_config,
            move |data: &[f32], info: &cpal::InputCallbackInfo| {
                let instant = info.timestamp().capture;
                let start = *origin.get_or_insert(instant);
                let host = instant.duration_since(&start).unwrap_or(Duration::ZERO);
                let frames = data.len() / usize::from(channels.max(1));
                let captured_at = clock.stamp(host, frames, sample_rate);
                capture.push(captured_at, data, sample_rate, channels);
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    let output_device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;
    let output_config = output_config(&output_device)?;
    let out_channels = usize::from(output_config.channels);

    tracing::debug!(
        device = output_device.name().unwrap_or_default(),
        sample_rate = PLAYBACK_SAMPLE_RATE,
        channels = output_config.channels,
        "audio playback initialized"
    );

    let output = output_device
        .build_output_stream(
            &output_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                playback.render(data, out_channels);
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    input.play().map_err(|e| Error::Audio(e.to_string()))?;
    output.play().map_err(|e| Error::Audio(e.to_string()))?;
    tracing::info!("audio streams started");

    Ok(Streams {
        _input: input,
        _output: output,
    })
}

/// Find a 24 kHz output config, mono preferred, stereo accepted
fn output_config(device: &cpal::Device) -> Result<StreamConfig> {
    let rate = SampleRate(PLAYBACK_SAMPLE_RATE);
    let supports = |channels: u16| {
        device.supported_output_configs().ok()?.find(|c| {
            c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
        })
    };

    supports(1)
        .or_else(|| supports(2))
        .map(|c| c.with_sample_rate(rate).config())
        .ok_or_else(|| Error::Audio("no 24 kHz output config found".to_string()))
}

/// Write a frame as a 16-bit PCM WAV file
///
/// # Errors
///
/// Returns error if the file cannot be created or written
pub fn write_wav(path: &Path, frame: &AudioFrame) -> Result<()> {
    let spec = hound::WavSpec {
        channels: frame.channels(),
        sample_rate: frame.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec).map_err(|e| Error::Audio(e.to_string()))?;
    for &sample in frame.samples() {
        writer
            .write_sample(sample)
            .map_err(|e| Error::Audio(e.to_string()))?;
    }
    writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;

    tracing::debug!(path = %path.display(), samples = frame.len(), "wav written");
    Ok(())
}

/// Strictly increasing capture timestamps from host stream instants
///
/// Some hosts report the same capture instant for consecutive callbacks.
/// When the host time does not advance, the stamp moves forward by the
/// length of the previous buffer instead.
#[derive(Debug, Default)]
struct CaptureClock {
    last: Option<Duration>,
    next: Duration,
}

impl CaptureClock {
    fn stamp(&mut self, host: Duration, frames: usize, sample_rate: u32) -> Duration {
        let stamp = match self.last {
            Some(last) if host <= last => self.next.max(last + Duration::from_nanos(1)),
            _ => host,
        };
        let length_ns =
            (frames as u64).saturating_mul(1_000_000_000) / u64::from(sample_rate.max(1));
        self.last = Some(stamp);
        self.next = stamp + Duration::from_nanos(length_ns.max(1));
        stamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::codec::CAPTURE_SAMPLE_RATE;

    #[test]
    fn test_clock_follows_host_time() {
        let mut clock = CaptureClock::default();
        let ms = Duration::from_millis;
        assert_eq!(clock.stamp(ms(0), 480, 48_000), ms(0));
        assert_eq!(clock.stamp(ms(10), 480, 48_000), ms(10));
        assert_eq!(clock.stamp(ms(20), 480, 48_000), ms(20));
    }

    #[test]
    fn test_clock_advances_on_stalled_host_time() {
        let mut clock = CaptureClock::default();
        let ms = Duration::from_millis;
        let stamps: Vec<Duration> = (0..4).map(|_| clock.stamp(ms(0), 480, 48_000)).collect();
        assert_eq!(stamps, vec![ms(0), ms(10), ms(20), ms(30)]);

        // Every stalled stamp is accepted by the capture queue
        let (mut producer, queue) = crate::voice::capture_channel(8);
        for stamp in stamps {
            assert_eq!(
                producer.push(stamp, &[0.0; 480], 48_000, 1),
                crate::voice::PushOutcome::Queued
            );
        }
        assert_eq!(queue.duplicate_buffers(), 0);

        // Host time catching up is used as soon as it is newer again
        assert_eq!(clock.stamp(ms(50), 480, 48_000), ms(50));
    }

    #[test]
    fn test_write_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.wav");
        let frame = AudioFrame::new(vec![0, 1000, -1000, 32767], CAPTURE_SAMPLE_RATE, 1);

        write_wav(&path, &frame).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, CAPTURE_SAMPLE_RATE);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, frame.samples());
    }
}
