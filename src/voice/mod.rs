//! Voice processing module
//!
//! Handles the wire audio format, microphone capture, response playback and
//! the hardware streams that connect them.

mod capture;
mod codec;
mod device;
mod playback;

pub use capture::{
    CapturePipeline, CaptureProducer, CaptureQueue, HardwareBuffer, PushOutcome, capture_channel,
};
pub use codec::{
    AudioFrame, CAPTURE_SAMPLE_RATE, CodecError, PLAYBACK_SAMPLE_RATE, decode_playback,
    encode_capture, f32_to_i16, i16_to_f32, resampled_len,
};
pub use device::{AudioBackend, AudioDevice, CpalBackend, write_wav};
pub use playback::{PlaybackHandle, PlaybackRenderer, playback_channel};
