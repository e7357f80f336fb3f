//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use companion_live::session::protocol::OutboundMessage;
use companion_live::voice::{
    AudioFrame, CAPTURE_SAMPLE_RATE, CapturePipeline, PLAYBACK_SAMPLE_RATE, PushOutcome,
    capture_channel, decode_playback, encode_capture, f32_to_i16, playback_channel,
};
use companion_live::{Transport, TransportError};

mod common;

use common::{MockTransport, wait_for};

/// Generate interleaved sine wave samples
#[allow(clippy::cast_precision_loss)]
fn generate_sine(frequency: f32, sample_rate: u32, channels: u16, frames: usize) -> Vec<f32> {
    (0..frames)
        .flat_map(|i| {
            let t = i as f32 / sample_rate as f32;
            let sample = 0.5 * (2.0 * std::f32::consts::PI * frequency * t).sin();
            std::iter::repeat_n(sample, usize::from(channels))
        })
        .collect()
}

fn decoded_chunk(message: &OutboundMessage) -> Vec<u8> {
    match message {
        OutboundMessage::RealtimeInput(input) => {
            assert_eq!(input.media_chunks[0].mime_type, "audio/pcm");
            BASE64.decode(&input.media_chunks[0].data).unwrap()
        }
        OutboundMessage::Setup(_) => panic!("expected audio"),
    }
}

#[test]
fn test_encode_common_device_rates() {
    for (rate, channels, frames, expected) in [
        (48_000, 2, 960, 320),
        (44_100, 1, 441, 160),
        (16_000, 1, 320, 320),
        (24_000, 2, 240, 160),
    ] {
        let samples = generate_sine(440.0, rate, channels, frames);
        let frame = encode_capture(&samples, rate, channels).unwrap().unwrap();

        assert_eq!(frame.sample_rate(), CAPTURE_SAMPLE_RATE);
        assert_eq!(frame.channels(), 1);
        assert_eq!(frame.len(), expected, "{rate} Hz x{channels}");
    }
}

#[test]
fn test_resampled_tone_keeps_energy() {
    let samples = generate_sine(440.0, 48_000, 1, 4_800);
    let frame = encode_capture(&samples, 48_000, 1).unwrap().unwrap();

    // Skip the resampler's warm-up at the start
    let tail = &frame.samples()[100..];
    let peak = tail.iter().map(|s| s.unsigned_abs()).max().unwrap();
    assert!(peak > 12_000, "peak {peak}");
    assert!(peak < 20_000, "peak {peak}");
}

#[test]
fn test_decode_wire_payload() {
    let frame = decode_playback(&[0x00, 0x40, 0x00, 0xC0]).unwrap();
    assert_eq!(frame.samples(), &[16_384, -16_384]);
    assert_eq!(frame.sample_rate(), PLAYBACK_SAMPLE_RATE);
    assert!(decode_playback(&[0x00, 0x40, 0x00]).is_err());
}

#[test]
fn test_playback_gapless_across_frames() {
    let (handle, mut renderer) = playback_channel();
    let first = AudioFrame::new(vec![8_192; 3], PLAYBACK_SAMPLE_RATE, 1);
    let second = AudioFrame::new(vec![-8_192; 3], PLAYBACK_SAMPLE_RATE, 1);
    handle.enqueue(first);
    handle.enqueue(second);

    // Callback boundaries do not line up with frame boundaries
    let mut a = [0.0f32; 4];
    let mut b = [0.0f32; 4];
    renderer.render(&mut a, 1);
    renderer.render(&mut b, 1);

    assert_eq!(a, [0.25, 0.25, 0.25, -0.25]);
    assert_eq!(b, [-0.25, -0.25, 0.0, 0.0]);
    assert!(!handle.is_playing());
}

#[test]
fn test_capture_backlog_bound() {
    let (mut producer, queue) = capture_channel(4);
    let outcomes: Vec<PushOutcome> = (0..10u64)
        .map(|i| producer.push(Duration::from_millis(i * 10), &[0.0; 160], 16_000, 1))
        .collect();

    assert_eq!(outcomes[..4], [PushOutcome::Queued; 4]);
    assert!(outcomes[4..].iter().all(|o| *o == PushOutcome::DroppedOldest));
    assert_eq!(queue.len(), 4);
    assert_eq!(queue.dropped_buffers(), 6);

    // The freshest audio survives
    let first = queue.try_next().unwrap().unwrap();
    assert_eq!(first.captured_at, Duration::from_millis(60));
}

#[tokio::test]
async fn test_pipeline_sends_in_capture_order() {
    let transport = MockTransport::new();
    let (mut producer, queue) = capture_channel(8);
    let pipeline = CapturePipeline::spawn(queue, transport.clone(), Duration::from_millis(5));

    let levels = [0.1f32, 0.2, 0.3];
    for (ms, level) in (0..).step_by(10).zip(levels) {
        producer.push(Duration::from_millis(ms), &[level; 160], 16_000, 1);
    }

    wait_for(|| pipeline.sent_frames() == 3).await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    for (message, level) in sent.iter().zip(levels) {
        let bytes = decoded_chunk(message);
        assert_eq!(bytes.len(), 320);
        let first = i16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(first, f32_to_i16(level));
    }

    pipeline.stop();
    pipeline.stop();
}

#[tokio::test]
async fn test_pipeline_zero_interval_still_sends() {
    let transport = MockTransport::new();
    let (mut producer, queue) = capture_channel(8);
    let pipeline = CapturePipeline::spawn(queue, transport.clone(), Duration::ZERO);

    producer.push(Duration::from_millis(1), &[0.1; 160], 16_000, 1);

    wait_for(|| pipeline.sent_frames() == 1).await;
    assert!(!pipeline.is_finished());
    assert_eq!(transport.sent_audio(), 1);
}

#[tokio::test]
async fn test_pipeline_exits_when_transport_closes() {
    let transport = MockTransport::new();
    let (mut producer, queue) = capture_channel(8);
    let pipeline = CapturePipeline::spawn(queue, transport.clone(), Duration::from_millis(5));

    transport.close().await;
    producer.push(Duration::from_millis(1), &[0.1; 160], 16_000, 1);

    wait_for(|| pipeline.is_finished()).await;
    assert_eq!(pipeline.sent_frames(), 0);
    assert_eq!(
        transport.send(&OutboundMessage::audio(&AudioFrame::new(vec![0], 16_000, 1))).await,
        Err(TransportError::ConnectionClosed)
    );
}

#[tokio::test]
async fn test_pipeline_exits_when_producer_gone() {
    let transport = MockTransport::new();
    let (producer, queue) = capture_channel(8);
    let pipeline = CapturePipeline::spawn(queue, transport, Duration::from_millis(5));

    drop(producer);
    wait_for(|| pipeline.is_finished()).await;
}
