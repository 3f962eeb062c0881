//! Model configuration and the per-stage geometry tables derived from it.

use crate::error::DemucsError;
use crate::{
    ATTN_HEADS, ATTN_WINDOW, AUDIO_CHANNELS, CHANNELS, DEPTH, FREQ_BINS, GROWTH, KERNEL_SIZE,
    SHARED_STRIDE, STRIDE,
};

/// Architecture generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Four-stage dual-branch U-Net, convolutional residual blocks in every
    /// encoder and decoder (`htdemucs` family, bottleneck supplied externally).
    Hybrid,
    /// Four branch stages followed by two shared bottleneck stages with
    /// recurrent + local-attention residual blocks (`hdemucs_mmi`).
    HybridShared,
}

/// Number of separated sources, which fixes the final decoder width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCount {
    Two,
    Four,
    Six,
}

impl SourceCount {
    pub fn count(self) -> usize {
        match self {
            SourceCount::Two => 2,
            SourceCount::Four => 4,
            SourceCount::Six => 6,
        }
    }

    pub fn from_count(n: usize) -> Option<Self> {
        match n {
            2 => Some(SourceCount::Two),
            4 => Some(SourceCount::Four),
            6 => Some(SourceCount::Six),
            _ => None,
        }
    }
}

/// Residual block flavour used by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualKind {
    Convolutional,
    Recurrent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub generation: Generation,
    pub sources: SourceCount,
    pub audio_channels: usize,
    /// Width of the first stage; every later stage doubles it.
    pub channels: usize,
    /// Frequency bins entering the first frequency encoder.
    pub freq_bins: usize,
    /// Add the learned frequency embedding after frequency stage 0.
    pub freq_embedding: bool,
    /// Largest key/query distance the local attention looks at.
    pub attention_window: usize,
}

impl ModelConfig {
    pub fn new(generation: Generation, sources: SourceCount) -> Self {
        Self {
            generation,
            sources,
            audio_channels: AUDIO_CHANNELS,
            channels: CHANNELS,
            freq_bins: FREQ_BINS,
            freq_embedding: true,
            attention_window: ATTN_WINDOW,
        }
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_freq_bins(mut self, freq_bins: usize) -> Self {
        self.freq_bins = freq_bins;
        self
    }

    pub fn with_freq_embedding(mut self, enabled: bool) -> Self {
        self.freq_embedding = enabled;
        self
    }

    pub fn with_attention_window(mut self, window: usize) -> Self {
        self.attention_window = window;
        self
    }

    pub fn validate(&self) -> Result<(), DemucsError> {
        let compress = self.dconv_compress();
        if self.channels == 0 || self.channels % compress != 0 {
            return Err(DemucsError::Config(format!(
                "channels ({}) must be a positive multiple of the residual compression ({})",
                self.channels, compress
            )));
        }
        let reduction = STRIDE.pow(DEPTH as u32);
        if self.freq_bins == 0 || self.freq_bins % reduction != 0 {
            return Err(DemucsError::Config(format!(
                "frequency bins ({}) must be a positive multiple of {}",
                self.freq_bins, reduction
            )));
        }
        if self.audio_channels == 0 {
            return Err(DemucsError::Config("audio_channels must be positive".into()));
        }
        if self.generation == Generation::HybridShared {
            let hidden = self.stage_channels(DEPTH) / compress;
            if hidden % ATTN_HEADS != 0 {
                return Err(DemucsError::Config(format!(
                    "attention width {} is not divisible by {} heads",
                    hidden, ATTN_HEADS
                )));
            }
        }
        Ok(())
    }

    /// Encoder stages including the shared ones.
    pub fn depth(&self) -> usize {
        match self.generation {
            Generation::Hybrid => DEPTH,
            Generation::HybridShared => DEPTH + 2,
        }
    }

    pub fn dconv_compress(&self) -> usize {
        match self.generation {
            Generation::Hybrid => 8,
            Generation::HybridShared => 4,
        }
    }

    /// Output width of encoder stage `stage`.
    pub fn stage_channels(&self, stage: usize) -> usize {
        self.channels * GROWTH.pow(stage as u32)
    }

    /// Real and imaginary parts of every audio channel.
    pub fn freq_channels_in(&self) -> usize {
        2 * self.audio_channels
    }

    pub fn freq_channels_out(&self) -> usize {
        self.sources.count() * self.freq_channels_in()
    }

    pub fn time_channels_out(&self) -> usize {
        self.sources.count() * self.audio_channels
    }

    /// Rows of the frequency embedding, i.e. bins after frequency stage 0.
    pub fn freq_emb_rows(&self) -> usize {
        self.freq_bins / STRIDE
    }

    /// Bins left after the four branch stages.
    pub fn bottom_freqs(&self) -> usize {
        self.freq_bins / STRIDE.pow(DEPTH as u32)
    }

    fn branch_encoder(&self, stage: usize, chin: usize) -> EncoderSpec {
        EncoderSpec {
            chin,
            chout: self.stage_channels(stage),
            kernel: KERNEL_SIZE,
            stride: STRIDE,
            padding: KERNEL_SIZE / 4,
            norm: false,
            residual: Some(ResidualKind::Convolutional),
            empty: false,
        }
    }

    pub(crate) fn freq_encoder_specs(&self) -> Vec<EncoderSpec> {
        (0..DEPTH)
            .map(|s| {
                let chin = if s == 0 {
                    self.freq_channels_in()
                } else {
                    self.stage_channels(s - 1)
                };
                self.branch_encoder(s, chin)
            })
            .collect()
    }

    pub(crate) fn time_encoder_specs(&self) -> Vec<EncoderSpec> {
        (0..DEPTH)
            .map(|s| {
                let chin = if s == 0 {
                    self.audio_channels
                } else {
                    self.stage_channels(s - 1)
                };
                self.branch_encoder(s, chin)
            })
            .collect()
    }

    /// Branch decoders, innermost first.
    fn branch_decoders(&self, final_width: usize) -> Vec<DecoderSpec> {
        let residual = match self.generation {
            Generation::Hybrid => Some(ResidualKind::Convolutional),
            Generation::HybridShared => None,
        };
        (0..DEPTH)
            .rev()
            .map(|s| DecoderSpec {
                chin: self.stage_channels(s),
                chout: if s == 0 {
                    final_width
                } else {
                    self.stage_channels(s - 1)
                },
                kernel: KERNEL_SIZE,
                stride: STRIDE,
                crop: KERNEL_SIZE / 4,
                norm: false,
                residual,
                empty: false,
                last: s == 0,
            })
            .collect()
    }

    pub(crate) fn freq_decoder_specs(&self) -> Vec<DecoderSpec> {
        self.branch_decoders(self.freq_channels_out())
    }

    pub(crate) fn time_decoder_specs(&self) -> Vec<DecoderSpec> {
        self.branch_decoders(self.time_channels_out())
    }

    pub(crate) fn shared_specs(&self) -> Option<SharedSpecs> {
        if self.generation != Generation::HybridShared {
            return None;
        }
        let c3 = self.stage_channels(DEPTH - 1);
        let c4 = self.stage_channels(DEPTH);
        let c5 = self.stage_channels(DEPTH + 1);
        let freqs = self.bottom_freqs();
        let shared_kernel = 2 * SHARED_STRIDE;
        Some(SharedSpecs {
            inject: EncoderSpec {
                chin: c3,
                chout: c4,
                kernel: KERNEL_SIZE,
                stride: STRIDE,
                padding: KERNEL_SIZE / 4,
                norm: false,
                residual: None,
                empty: true,
            },
            freq: EncoderSpec {
                chin: c3,
                chout: c4,
                kernel: freqs,
                stride: STRIDE,
                padding: 0,
                norm: true,
                residual: Some(ResidualKind::Recurrent),
                empty: false,
            },
            bottom: EncoderSpec {
                chin: c4,
                chout: c5,
                kernel: shared_kernel,
                stride: SHARED_STRIDE,
                padding: shared_kernel / 4,
                norm: true,
                residual: Some(ResidualKind::Recurrent),
                empty: false,
            },
            bottom_decoder: DecoderSpec {
                chin: c5,
                chout: c4,
                kernel: shared_kernel,
                stride: SHARED_STRIDE,
                crop: shared_kernel / 4,
                norm: true,
                residual: None,
                empty: false,
                last: false,
            },
            freq_decoder: DecoderSpec {
                chin: c4,
                chout: c3,
                kernel: freqs,
                stride: STRIDE,
                crop: 0,
                norm: true,
                residual: None,
                empty: false,
                last: false,
            },
            split_decoder: DecoderSpec {
                chin: c4,
                chout: c3,
                kernel: KERNEL_SIZE,
                stride: STRIDE,
                crop: KERNEL_SIZE / 4,
                norm: true,
                residual: None,
                empty: true,
                last: false,
            },
        })
    }
}

/// Geometry of one encoder stage. For frequency stages the kernel, stride and
/// padding apply to the bin axis; the frame axis is untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EncoderSpec {
    pub chin: usize,
    pub chout: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    /// GroupNorm after the convolution and after the rewrite.
    pub norm: bool,
    pub residual: Option<ResidualKind>,
    /// Convolution only: no activation, residual block or rewrite.
    pub empty: bool,
}

/// Geometry of one decoder stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DecoderSpec {
    pub chin: usize,
    pub chout: usize,
    pub kernel: usize,
    pub stride: usize,
    /// Elements trimmed off the front of the upsampled axis (and, on the
    /// frequency branch, off the back as well).
    pub crop: usize,
    pub norm: bool,
    pub residual: Option<ResidualKind>,
    /// No skip, rewrite or residual block: transposed convolution only.
    pub empty: bool,
    pub last: bool,
}

/// Stages that only exist in [`Generation::HybridShared`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct SharedSpecs {
    /// Conv-only time stage 4, its output is injected into frequency stage 4.
    pub inject: EncoderSpec,
    /// Frequency stage 4, collapses the remaining bins.
    pub freq: EncoderSpec,
    /// Shared stage 5, time layout.
    pub bottom: EncoderSpec,
    pub bottom_decoder: DecoderSpec,
    pub freq_decoder: DecoderSpec,
    /// Time decoder fed from the frequency decoder's pre-upsampling activation.
    pub split_decoder: DecoderSpec,
}
