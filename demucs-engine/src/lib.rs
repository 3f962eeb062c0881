//! Inference core for the hybrid time/frequency Demucs source-separation
//! models.
//!
//! The engine runs the encoder cascade, the bottleneck and the decoder
//! cascade on a single windowed segment. The short-time Fourier transform,
//! audio I/O and segment overlap-add live outside of it: callers hand in a
//! frequency-branch tensor `[4, bins, frames]` and a time-branch tensor
//! `[1, 2, samples]` and receive per-source tensors back.

pub mod error;
pub mod listener;
pub mod model;
pub mod weights;

pub use error::{DemucsError, Result, ShapeError};
pub use listener::{Branch, DebugListener, ForwardEvent, ForwardListener, NoOpListener, TensorStats};
pub use model::config::{Generation, ModelConfig, SourceCount};
pub use model::htdemucs::{Bottleneck, HybridDemucs, Passthrough, SkipSet};
pub use model::metadata::{ModelInfo, StemId};
pub use weights::tensor_store::{StoredTensor, TensorStore, ZeroSource};
pub use weights::{TensorSource, WeightError};

// The engine never resamples or transforms audio; these fix the contract
// with the caller that does.

/// Stereo input, mixed to `[1, AUDIO_CHANNELS, samples]` for the time branch.
pub const AUDIO_CHANNELS: usize = 2;
/// Rate the checkpoints were trained at. Callers resample to it before
/// building either branch input.
pub const SAMPLE_RATE: usize = 44100;

/// STFT size callers use for the frequency-branch input.
pub const N_FFT: usize = 4096;
/// STFT hop callers use; one frame per `HOP_LENGTH` samples.
pub const HOP_LENGTH: usize = 1024;
/// Frequency bins handed to the first frequency encoder (the Nyquist bin is dropped).
pub const FREQ_BINS: usize = N_FFT / 2;
/// Samples in one inference segment.
pub const SEGMENT_SAMPLES: usize = 343980;
/// Spectrogram frames in one inference segment, `SEGMENT_SAMPLES / HOP_LENGTH`
/// rounded up. Callers size the frequency-branch input with it.
pub const SEGMENT_FRAMES: usize = 336;

pub(crate) const CHANNELS: usize = 48;
pub(crate) const GROWTH: usize = 2;
pub(crate) const DEPTH: usize = 4;
pub(crate) const KERNEL_SIZE: usize = 8;
pub(crate) const STRIDE: usize = 4;
pub(crate) const SHARED_STRIDE: usize = 2;
pub(crate) const REWRITE_CONTEXT: usize = 1;
pub(crate) const NORM_GROUPS: usize = 4;

pub(crate) const DCONV_DEPTH: usize = 2;
pub(crate) const DCONV_KERNEL: usize = 3;
pub(crate) const LSTM_LAYERS: usize = 2;
pub(crate) const LSTM_MAX_STEPS: usize = 200;
pub(crate) const ATTN_HEADS: usize = 4;
pub(crate) const ATTN_DECAYS: usize = 4;
pub(crate) const ATTN_WINDOW: usize = 200;

pub(crate) const FREQ_EMB_SCALE: f32 = 0.2;
pub(crate) const FREQ_EMB_WEIGHT_SCALE: f32 = 10.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_constants_agree() {
        assert_eq!(SEGMENT_FRAMES, SEGMENT_SAMPLES.div_ceil(HOP_LENGTH));
        assert_eq!(FREQ_BINS, 2048);
        // a segment is 7.8 seconds of audio
        assert_eq!(SEGMENT_SAMPLES * 10 / SAMPLE_RATE, 78);
        // stage 5 halves the frame axis
        assert_eq!(SEGMENT_FRAMES % SHARED_STRIDE, 0);
        assert_eq!(FREQ_BINS / STRIDE.pow(DEPTH as u32), 8);
    }
}
