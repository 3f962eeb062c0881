use burn::{
    module::{Ignored, Module},
    nn::{Embedding, EmbeddingConfig, Initializer},
    prelude::Backend,
    tensor::Tensor,
};

use crate::error::{DemucsError, Result, ShapeError};
use crate::listener::{maybe_stats, Branch, ForwardEvent, ForwardListener, NoOpListener};
use crate::model::config::ModelConfig;
use crate::model::conv::{HDecLayer, HEncLayer, StageOptions, TDecLayer, TEncLayer};
use crate::model::metadata::ModelInfo;
use crate::weights::load::load_into;
use crate::weights::tensor_store::{TensorStore, ZeroSource};
use crate::weights::TensorSource;
use crate::{DEPTH, FREQ_EMB_SCALE};

/// Replaces the deepest branch representations between the encoder and
/// decoder cascades.
///
/// Called with the frequency tensor `[channels, bins, frames]` and the time
/// tensor `[1, channels, samples]` after the four branch encoders. Skip
/// connections are captured before the hook runs, so a replacement only
/// changes what the innermost decoders (or the shared stages) receive.
pub trait Bottleneck<B: Backend> {
    fn forward(&mut self, freq: Tensor<B, 3>, time: Tensor<B, 3>) -> Result<(Tensor<B, 3>, Tensor<B, 3>)>;
}

/// Hands both tensors through unchanged.
pub struct Passthrough;

impl<B: Backend> Bottleneck<B> for Passthrough {
    fn forward(&mut self, freq: Tensor<B, 3>, time: Tensor<B, 3>) -> Result<(Tensor<B, 3>, Tensor<B, 3>)> {
        Ok((freq, time))
    }
}

/// Skip connections of one forward call.
///
/// Each entry keeps the tensor an encoder produced together with the length
/// of that encoder's input (frames for the frequency side, samples for the
/// time side), which is what the mirrored decoder crops back to.
pub struct SkipSet<B: Backend> {
    freq: Vec<(Tensor<B, 3>, usize)>,
    time: Vec<(Tensor<B, 3>, usize)>,
}

impl<B: Backend> Default for SkipSet<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> SkipSet<B> {
    pub fn new() -> Self {
        Self {
            freq: Vec::new(),
            time: Vec::new(),
        }
    }

    pub fn push_freq(&mut self, skip: Tensor<B, 3>, input_len: usize) {
        self.freq.push((skip, input_len));
    }

    pub fn push_time(&mut self, skip: Tensor<B, 3>, input_len: usize) {
        self.time.push((skip, input_len));
    }

    pub fn pop_freq(&mut self) -> Result<(Tensor<B, 3>, usize)> {
        self.freq
            .pop()
            .ok_or_else(|| DemucsError::Internal("frequency skip stack is empty".into()))
    }

    pub fn pop_time(&mut self) -> Result<(Tensor<B, 3>, usize)> {
        self.time
            .pop()
            .ok_or_else(|| DemucsError::Internal("time skip stack is empty".into()))
    }

    pub fn freq_len(&self) -> usize {
        self.freq.len()
    }

    pub fn time_len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.freq.is_empty() && self.time.is_empty()
    }
}

/// Layers that only exist in the shared-bottleneck generation.
#[derive(Module, Debug)]
pub(crate) struct SharedStages<B: Backend> {
    /// Time stage 4, convolution only.
    pub(crate) inject: TEncLayer<B>,
    /// Frequency stage 4, collapses the bin axis and takes the injection.
    pub(crate) freq: HEncLayer<B>,
    /// Stage 5, time layout.
    pub(crate) bottom: TEncLayer<B>,
    pub(crate) bottom_decoder: TDecLayer<B>,
    pub(crate) freq_decoder: HDecLayer<B>,
    /// Time decoder fed from `freq_decoder`'s pre-upsampling activation.
    pub(crate) split_decoder: TDecLayer<B>,
}

/// Hybrid time/frequency U-Net.
///
/// Immutable once built; every inference call borrows it.
#[derive(Module, Debug)]
pub struct HybridDemucs<B: Backend> {
    pub(crate) encoders: Vec<HEncLayer<B>>,
    pub(crate) tencoders: Vec<TEncLayer<B>>,
    pub(crate) freq_emb: Option<Embedding<B>>,
    pub(crate) shared: Option<SharedStages<B>>,
    // innermost first
    pub(crate) decoders: Vec<HDecLayer<B>>,
    pub(crate) tdecoders: Vec<TDecLayer<B>>,
    config: Ignored<ModelConfig>,
}

impl<B: Backend> HybridDemucs<B> {
    /// Build the layer structure with zeroed parameters.
    pub fn init(config: ModelConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let opts = StageOptions {
            compress: config.dconv_compress(),
            attention_window: config.attention_window,
        };

        let encoders = config
            .freq_encoder_specs()
            .iter()
            .map(|s| HEncLayer::init(s, opts, device))
            .collect();
        let tencoders = config
            .time_encoder_specs()
            .iter()
            .map(|s| TEncLayer::init(s, opts, device))
            .collect();
        let decoders = config
            .freq_decoder_specs()
            .iter()
            .map(|s| HDecLayer::init(s, opts, device))
            .collect();
        let tdecoders = config
            .time_decoder_specs()
            .iter()
            .map(|s| TDecLayer::init(s, opts, device))
            .collect();

        let shared = config.shared_specs().map(|s| SharedStages {
            inject: TEncLayer::init(&s.inject, opts, device),
            freq: HEncLayer::init(&s.freq, opts, device),
            bottom: TEncLayer::init(&s.bottom, opts, device),
            bottom_decoder: TDecLayer::init(&s.bottom_decoder, opts, device),
            freq_decoder: HDecLayer::init(&s.freq_decoder, opts, device),
            split_decoder: TDecLayer::init(&s.split_decoder, opts, device),
        });

        let freq_emb = config.freq_embedding.then(|| {
            EmbeddingConfig::new(config.freq_emb_rows(), config.stage_channels(0))
                .with_initializer(Initializer::Zeros)
                .init(device)
        });

        Ok(Self {
            encoders,
            tencoders,
            freq_emb,
            shared,
            decoders,
            tdecoders,
            config: Ignored(config),
        })
    }

    /// Build and fill every parameter from `src`. Tensors left in the source
    /// afterwards are an error.
    pub fn load(config: ModelConfig, src: &mut impl TensorSource, device: &B::Device) -> Result<Self> {
        let mut model = Self::init(config, device)?;
        load_into(&mut model, &mut *src, device)?;
        src.finish()?;
        Ok(model)
    }

    /// Load a catalogued checkpoint from safetensors bytes. Sections that
    /// belong to an external bottleneck are dropped first.
    pub fn from_bytes(info: &ModelInfo, bytes: &[u8], device: &B::Device) -> Result<Self> {
        let config = info.config().ok_or_else(|| {
            DemucsError::Config(format!("{} has an unsupported stem count", info.id))
        })?;
        let mut store = TensorStore::from_bytes(bytes, info.signature)?;
        for prefix in info.external_prefixes {
            let dropped = store.skip_prefix(prefix);
            if dropped > 0 {
                log::debug!("{}: skipped {} tensors under '{}'", info.id, dropped, prefix);
            }
        }
        Self::load(config, &mut store, device)
    }

    /// Every key and shape `config` needs, in load order.
    pub fn weight_manifest(config: ModelConfig, device: &B::Device) -> Result<Vec<(String, Vec<usize>)>> {
        let mut src = ZeroSource::new();
        Self::load(config, &mut src, device)?;
        Ok(src.into_manifest())
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config.0
    }

    // ─── Per-stage entry points ─────────────────────────────────────────

    fn branch_stage(branch: &'static str, stage: usize) -> Result<usize> {
        if stage < DEPTH {
            Ok(stage)
        } else {
            Err(DemucsError::InvalidStage { branch, stage })
        }
    }

    fn shared(&self, stage: usize) -> Result<&SharedStages<B>> {
        self.shared.as_ref().ok_or(DemucsError::InvalidStage {
            branch: "shared",
            stage,
        })
    }

    /// Frequency encoder `stage` (0..4) over `[channels, bins, frames]`.
    pub fn freq_encoder(&self, stage: usize, x: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let i = Self::branch_stage("freq encoder", stage)?;
        self.encoders[i].forward(x, None)
    }

    /// Time encoder `stage` (0..4) over `[1, channels, samples]`.
    pub fn time_encoder(&self, stage: usize, x: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let i = Self::branch_stage("time encoder", stage)?;
        self.tencoders[i].forward(x)
    }

    /// Add the learned per-bin embedding to the output of frequency stage 0.
    /// A model built without the embedding returns `x` unchanged.
    pub fn freq_embedding(&self, x: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let Some(emb) = &self.freq_emb else {
            return Ok(x);
        };
        // [bins, channels] -> [channels, bins, 1]
        let table = emb.weight.val().swap_dims(0, 1).unsqueeze_dim::<3>(2);
        let [c, f, t] = x.dims();
        let [ec, ef, _] = table.dims();
        if (c, f) != (ec, ef) {
            return Err(ShapeError::Mismatch {
                op: "freq_embedding",
                left: vec![c, f, t],
                right: vec![ec, ef, 1],
            }
            .into());
        }
        Ok(x + table.mul_scalar(FREQ_EMB_SCALE))
    }

    /// Conv-only time stage 4: produces the injection for
    /// [`Self::shared_freq_encoder`].
    pub fn inject_encoder(&self, x: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        self.shared(4)?.inject.forward(x)
    }

    /// Frequency stage 4. `inject` is the `[1, channels, frames]` output of
    /// [`Self::inject_encoder`].
    pub fn shared_freq_encoder(&self, x: Tensor<B, 3>, inject: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        self.shared(4)?.freq.forward(x, Some(inject))
    }

    /// Stage 5 on the `[channels, 1, frames]` output of stage 4; returns the
    /// time layout `[1, channels, frames / 2]`.
    pub fn shared_encoder(&self, x: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let shared = self.shared(5)?;
        shared.bottom.forward(unit_rows_to_time(x, "shared encoder")?)
    }

    /// Decoder mirroring stage 5, cropped to `length` frames.
    pub fn shared_decoder(&self, x: Tensor<B, 3>, skip: Tensor<B, 3>, length: usize) -> Result<Tensor<B, 3>> {
        let (out, _) = self.shared(5)?.bottom_decoder.forward(x, Some(skip), length)?;
        Ok(out)
    }

    /// Decoder mirroring frequency stage 4. `x` is the `[1, channels, frames]`
    /// output of [`Self::shared_decoder`]. Returns the upsampled frequency
    /// tensor and `pre`, the activation that [`Self::split_time_decoder`]
    /// continues from.
    pub fn shared_freq_decoder(&self, x: Tensor<B, 3>, skip: Tensor<B, 3>) -> Result<(Tensor<B, 3>, Tensor<B, 3>)> {
        let shared = self.shared(4)?;
        let [n, c, t] = x.dims();
        if n != 1 {
            return Err(ShapeError::Mismatch {
                op: "shared freq decoder",
                left: vec![n, c, t],
                right: vec![1, c, t],
            }
            .into());
        }
        shared.freq_decoder.forward(x.reshape([c, 1, t]), skip)
    }

    /// Time decoder mirroring the conv-only time stage 4, fed by `pre`
    /// (`[channels, 1, frames]`) and cropped to `length` samples.
    pub fn split_time_decoder(&self, pre: Tensor<B, 3>, length: usize) -> Result<Tensor<B, 3>> {
        let shared = self.shared(4)?;
        let x = unit_rows_to_time(pre, "split time decoder")?;
        let (out, _) = shared.split_decoder.forward(x, None, length)?;
        Ok(out)
    }

    /// Frequency decoder mirroring encoder `stage` (0..4).
    pub fn freq_decoder(&self, stage: usize, x: Tensor<B, 3>, skip: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let stage = Self::branch_stage("freq decoder", stage)?;
        let (out, _) = self.decoders[DEPTH - 1 - stage].forward(x, skip)?;
        Ok(out)
    }

    /// Time decoder mirroring encoder `stage` (0..4), cropped to `length`.
    pub fn time_decoder(&self, stage: usize, x: Tensor<B, 3>, skip: Tensor<B, 3>, length: usize) -> Result<Tensor<B, 3>> {
        let stage = Self::branch_stage("time decoder", stage)?;
        let (out, _) = self.tdecoders[DEPTH - 1 - stage].forward(x, Some(skip), length)?;
        Ok(out)
    }

    // ─── Whole cascade ──────────────────────────────────────────────────

    /// Run the encoder and decoder cascades on one segment.
    ///
    /// `freq` is `[audio_channels * 2, bins, frames]`, `time` is
    /// `[1, audio_channels, samples]`. Returns `[sources * 4, bins, frames]`
    /// and `[1, sources * 2, samples]`.
    pub fn forward(&self, freq: Tensor<B, 3>, time: Tensor<B, 3>) -> Result<(Tensor<B, 3>, Tensor<B, 3>)> {
        self.forward_with(freq, time, &mut Passthrough, &mut NoOpListener)
    }

    pub fn forward_with_listener(
        &self,
        freq: Tensor<B, 3>,
        time: Tensor<B, 3>,
        listener: &mut impl ForwardListener,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 3>)> {
        self.forward_with(freq, time, &mut Passthrough, listener)
    }

    pub fn forward_with(
        &self,
        freq: Tensor<B, 3>,
        time: Tensor<B, 3>,
        bottleneck: &mut impl Bottleneck<B>,
        listener: &mut impl ForwardListener,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 3>)> {
        let mut skips = SkipSet::new();
        let mut x = freq;
        let mut xt = time;

        for stage in 0..DEPTH {
            let frames = x.dims()[2];
            x = self.freq_encoder(stage, x)?;
            if stage == 0 && self.freq_emb.is_some() {
                x = self.freq_embedding(x)?;
                listener.on_event(ForwardEvent::FreqEmbApplied);
            }
            listener.on_event(ForwardEvent::EncoderDone {
                branch: Branch::Freq,
                stage,
                stats: maybe_stats(&x, listener),
            });
            skips.push_freq(x.clone(), frames);

            let samples = xt.dims()[2];
            xt = self.time_encoder(stage, xt)?;
            listener.on_event(ForwardEvent::EncoderDone {
                branch: Branch::Time,
                stage,
                stats: maybe_stats(&xt, listener),
            });
            skips.push_time(xt.clone(), samples);
        }

        let (x, xt) = bottleneck.forward(x, xt)?;
        listener.on_event(ForwardEvent::BottleneckDone {
            freq_stats: maybe_stats(&x, listener),
            time_stats: maybe_stats(&xt, listener),
        });

        let (mut x, mut xt) = if self.shared.is_some() {
            self.shared_cascade(x, xt, &mut skips, listener)?
        } else {
            (x, xt)
        };

        for stage in (0..DEPTH).rev() {
            let (skip, _) = skips.pop_freq()?;
            x = self.freq_decoder(stage, x, skip)?;
            listener.on_event(ForwardEvent::DecoderDone {
                branch: Branch::Freq,
                stage,
                stats: maybe_stats(&x, listener),
            });

            let (skip, samples) = skips.pop_time()?;
            xt = self.time_decoder(stage, xt, skip, samples)?;
            listener.on_event(ForwardEvent::DecoderDone {
                branch: Branch::Time,
                stage,
                stats: maybe_stats(&xt, listener),
            });
        }

        if !skips.is_empty() {
            return Err(DemucsError::Internal("unconsumed skip connections".into()));
        }
        Ok((x, xt))
    }

    /// Stages 4 and 5 down and back up. Decoding starts from zeros, so the
    /// stage-5 decoder only sees its skip.
    fn shared_cascade(
        &self,
        x: Tensor<B, 3>,
        xt: Tensor<B, 3>,
        skips: &mut SkipSet<B>,
        listener: &mut impl ForwardListener,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 3>)> {
        let samples = xt.dims()[2];
        let inject = self.inject_encoder(xt)?;

        let frames4 = x.dims()[2];
        let x = self.shared_freq_encoder(x, inject)?;
        listener.on_event(ForwardEvent::EncoderDone {
            branch: Branch::Shared,
            stage: 4,
            stats: maybe_stats(&x, listener),
        });
        skips.push_freq(x.clone(), frames4);

        let frames5 = x.dims()[2];
        let x = self.shared_encoder(x)?;
        listener.on_event(ForwardEvent::EncoderDone {
            branch: Branch::Shared,
            stage: 5,
            stats: maybe_stats(&x, listener),
        });
        skips.push_freq(x, frames5);

        let (skip, frames) = skips.pop_freq()?;
        let zeros = Tensor::zeros(skip.dims(), &skip.device());
        let y = self.shared_decoder(zeros, skip, frames)?;
        listener.on_event(ForwardEvent::DecoderDone {
            branch: Branch::Shared,
            stage: 5,
            stats: maybe_stats(&y, listener),
        });

        let (skip, _) = skips.pop_freq()?;
        let (x, pre) = self.shared_freq_decoder(y, skip)?;
        listener.on_event(ForwardEvent::DecoderDone {
            branch: Branch::Shared,
            stage: 4,
            stats: maybe_stats(&x, listener),
        });

        let xt = self.split_time_decoder(pre, samples)?;
        listener.on_event(ForwardEvent::DecoderDone {
            branch: Branch::Time,
            stage: 4,
            stats: maybe_stats(&xt, listener),
        });
        Ok((x, xt))
    }

    /// Z-normalize both inputs, run the cascade and map the outputs back to
    /// the input scale.
    pub fn separate(
        &self,
        freq: Tensor<B, 3>,
        time: Tensor<B, 3>,
        listener: &mut impl ForwardListener,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 3>)> {
        let (freq, freq_mean, freq_std) = normalize(freq);
        let (time, time_mean, time_std) = normalize(time);
        listener.on_event(ForwardEvent::Normalized);

        let (freq, time) = self.forward_with(freq, time, &mut Passthrough, listener)?;

        let freq = freq * (freq_std + 1e-5) + freq_mean;
        let time = time * (time_std + 1e-5) + time_mean;
        listener.on_event(ForwardEvent::Denormalized);
        Ok((freq, time))
    }
}

/// Whole-tensor mean and (unbiased) standard deviation, kept as `[1, 1, 1]`.
fn normalize<B: Backend>(x: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 3>, Tensor<B, 3>) {
    let [a, b, c] = x.dims();
    let (var, mean) = x.clone().reshape([1, a * b * c]).var_mean(1);
    let mean = mean.unsqueeze_dim::<3>(2);
    let std = var.sqrt().unsqueeze_dim::<3>(2);
    let x = (x - mean.clone()) / (std.clone() + 1e-5);
    (x, mean, std)
}

/// `[channels, 1, frames]` -> `[1, channels, frames]`.
fn unit_rows_to_time<B: Backend>(x: Tensor<B, 3>, op: &'static str) -> Result<Tensor<B, 3>> {
    let [c, h, t] = x.dims();
    if h != 1 {
        return Err(ShapeError::Mismatch {
            op,
            left: vec![c, h, t],
            right: vec![c, 1, t],
        }
        .into());
    }
    Ok(x.reshape([1, c, t]))
}
