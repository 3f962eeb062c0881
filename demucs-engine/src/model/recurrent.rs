//! Sequence mixers used inside the bottleneck residual blocks: a framed
//! two-layer bidirectional LSTM and a windowed multi-head local attention.
//!
//! Both operate on `[batch, channels, time]` and add their result back onto
//! their input. Recurrent state starts from zero on every call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use burn::{
    module::{Ignored, Module},
    nn::{BiLstm, BiLstmConfig, Initializer, Linear, LinearConfig},
    prelude::Backend,
    tensor::{activation, Tensor, TensorData},
};

use crate::error::ShapeError;
use crate::model::kernels::{add_checked, Activation, Conv1d, ConvSpec};
use crate::{ATTN_DECAYS, ATTN_HEADS, LSTM_LAYERS, LSTM_MAX_STEPS};

#[derive(Module, Debug)]
pub(crate) struct BLstm<B: Backend> {
    pub(crate) layers: Vec<BiLstm<B>>,
    pub(crate) linear: Linear<B>,
    max_steps: usize,
}

impl<B: Backend> BLstm<B> {
    pub(crate) fn init(dim: usize, device: &B::Device) -> Self {
        let layers = (0..LSTM_LAYERS)
            .map(|i| {
                let d_input = if i == 0 { dim } else { 2 * dim };
                BiLstmConfig::new(d_input, dim, true)
                    .with_initializer(Initializer::Zeros)
                    .init(device)
            })
            .collect();
        let linear = LinearConfig::new(2 * dim, dim)
            .with_initializer(Initializer::Zeros)
            .init(device);
        Self {
            layers,
            linear,
            max_steps: LSTM_MAX_STEPS,
        }
    }

    pub(crate) fn forward(&self, x: Tensor<B, 3>) -> Result<Tensor<B, 3>, ShapeError> {
        let [n, c, t] = x.dims();
        let expected = self.linear.weight.val().dims()[1];
        if c != expected {
            return Err(ShapeError::Channels {
                op: "blstm",
                expected,
                found: c,
            });
        }

        if t <= self.max_steps {
            let y = self.run(x.clone());
            return add_checked("blstm", y, x);
        }

        // Overlapping frames of `max_steps`, hop of half that, processed as
        // one batch and stitched back from their centres.
        let width = self.max_steps;
        let hop = width / 2;
        let nframes = t.div_ceil(hop);
        let target = (nframes - 1) * hop + width;
        let padded = Tensor::cat(
            vec![x.clone(), Tensor::zeros([n, c, target - t], &x.device())],
            2,
        );
        let frames: Vec<Tensor<B, 3>> = (0..nframes)
            .map(|k| padded.clone().narrow(2, k * hop, width))
            .collect();
        let y = self.run(Tensor::cat(frames, 0));

        let limit = hop / 2;
        let pieces: Vec<Tensor<B, 3>> = (0..nframes)
            .map(|k| {
                let frame = y.clone().narrow(0, k * n, n);
                if k == 0 {
                    frame.narrow(2, 0, width - limit)
                } else if k == nframes - 1 {
                    frame.narrow(2, limit, width - limit)
                } else {
                    frame.narrow(2, limit, width - 2 * limit)
                }
            })
            .collect();
        let y = Tensor::cat(pieces, 2).narrow(2, 0, t);
        add_checked("blstm", y, x)
    }

    /// Stacked bidirectional passes plus the projection back to `dim`.
    fn run(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let mut seq = x.swap_dims(1, 2);
        for layer in &self.layers {
            let (out, _) = layer.forward(seq, None);
            seq = out;
        }
        self.linear.forward(seq).swap_dims(1, 2)
    }
}

/// Multi-head self-attention restricted to a neighbourhood, with a learned
/// per-query exponential decay over the key distance.
///
/// Scores are computed densely over `t x t` and masked afterwards, so time and
/// memory grow quadratically with the sequence; the window only restricts
/// which keys receive weight. The bottleneck sequences are a few hundred
/// frames long. Masks are built once per length and shared between clones.
#[derive(Module, Debug)]
pub(crate) struct LocalState<B: Backend> {
    pub(crate) content: Conv1d<B>,
    pub(crate) query: Conv1d<B>,
    pub(crate) key: Conv1d<B>,
    pub(crate) query_decay: Conv1d<B>,
    pub(crate) proj: Conv1d<B>,
    heads: usize,
    ndecay: usize,
    window: usize,
    masks: Ignored<MaskCache>,
}

/// `|t - s|`, keep mask and additive fill for one `t x t` score matrix, each
/// shaped `[1, 1, t, t]`.
#[derive(Debug)]
pub(crate) struct Masks {
    distance: TensorData,
    keep: TensorData,
    fill: TensorData,
}

impl Masks {
    /// Self positions score -100, positions beyond `window` are pushed to a
    /// large negative value.
    fn build(t: usize, window: usize) -> Self {
        let mut distance = vec![0.0f32; t * t];
        let mut keep = vec![0.0f32; t * t];
        let mut fill = vec![0.0f32; t * t];
        for k in 0..t {
            for q in 0..t {
                let i = k * t + q;
                let dist = k.abs_diff(q);
                distance[i] = dist as f32;
                if dist == 0 {
                    fill[i] = -100.0;
                } else if dist > window {
                    fill[i] = -1.0e30;
                } else {
                    keep[i] = 1.0;
                }
            }
        }
        Self {
            distance: TensorData::new(distance, [1, 1, t, t]),
            keep: TensorData::new(keep, [1, 1, t, t]),
            fill: TensorData::new(fill, [1, 1, t, t]),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MaskCache(Arc<Mutex<HashMap<usize, Arc<Masks>>>>);

impl<B: Backend> LocalState<B> {
    pub(crate) fn init(channels: usize, window: usize, device: &B::Device) -> Self {
        let pointwise = |chout| Conv1d::new(ConvSpec::new(channels, chout, [1]), device);
        Self {
            content: pointwise(channels),
            query: pointwise(channels),
            key: pointwise(channels),
            query_decay: pointwise(ATTN_HEADS * ATTN_DECAYS),
            proj: pointwise(channels),
            heads: ATTN_HEADS,
            ndecay: ATTN_DECAYS,
            window,
            masks: Ignored(MaskCache::default()),
        }
    }

    pub(crate) fn forward(&self, x: Tensor<B, 3>) -> Result<Tensor<B, 3>, ShapeError> {
        let [n, c, t] = x.dims();
        let heads = self.heads;
        let d = c / heads;
        let device = x.device();

        let queries = self.query.forward(x.clone(), Activation::Identity)?.reshape([n, heads, d, t]);
        let keys = self.key.forward(x.clone(), Activation::Identity)?.reshape([n, heads, d, t]);

        // [n, heads, key position, query position]
        let dots = keys.swap_dims(2, 3).matmul(queries).div_scalar((d as f32).sqrt());

        // sum_f -(f+1)/sqrt(ndecay) * |t-s| * sigmoid(decay_q[f, s]) / 2
        let decay_q = activation::sigmoid(
            self.query_decay
                .forward(x.clone(), Activation::Identity)?
                .reshape([n, heads, self.ndecay, t]),
        )
        .div_scalar(2.0);
        let norm = (self.ndecay as f32).sqrt();
        let coef: Vec<f32> = (1..=self.ndecay).map(|f| f as f32 / norm).collect();
        let coef = Tensor::<B, 4>::from_data(TensorData::new(coef, [1, 1, self.ndecay, 1]), &device);
        let rate = (decay_q * coef).sum_dim(2);

        let masks = self.masks(t);
        let distance = Tensor::<B, 4>::from_data(masks.distance.clone(), &device);
        let keep = Tensor::<B, 4>::from_data(masks.keep.clone(), &device);
        let fill = Tensor::<B, 4>::from_data(masks.fill.clone(), &device);

        let dots = dots - distance * rate;
        let dots = dots * keep + fill;
        let weights = activation::softmax(dots, 2);

        let content = self.content.forward(x.clone(), Activation::Identity)?.reshape([n, heads, d, t]);
        let result = content.matmul(weights).reshape([n, c, t]);
        let out = self.proj.forward(result, Activation::Identity)?;
        add_checked("local_attention", x, out)
    }

    /// Masks for length `t`, built on first use. A poisoned cache is
    /// bypassed rather than trusted.
    fn masks(&self, t: usize) -> Arc<Masks> {
        let cache = &self.masks.0 .0;
        if let Some(m) = cache.lock().ok().and_then(|m| m.get(&t).cloned()) {
            return m;
        }
        let built = Arc::new(Masks::build(t, self.window));
        if let Ok(mut m) = cache.lock() {
            m.insert(t, built.clone());
        }
        built
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::module::Param;
    use burn::tensor::Distribution;

    type B = NdArray<f32>;

    fn values(t: Tensor<B, 3>) -> Vec<f32> {
        t.to_data().to_vec::<f32>().unwrap()
    }

    fn zero_linear(lstm: &mut BLstm<B>) {
        let device = Default::default();
        let [i, o] = lstm.linear.weight.val().dims();
        lstm.linear.weight = Param::from_tensor(Tensor::zeros([i, o], &device));
        lstm.linear.bias = Some(Param::from_tensor(Tensor::zeros([o], &device)));
    }

    #[test]
    fn blstm_keeps_shape_short_sequence() {
        let lstm = BLstm::<B>::init(6, &Default::default());
        let x = Tensor::<B, 3>::random([2, 6, 37], Distribution::Default, &Default::default());
        assert_eq!(lstm.forward(x).unwrap().dims(), [2, 6, 37]);
    }

    #[test]
    fn blstm_framing_restores_length() {
        let lstm = BLstm::<B>::init(4, &Default::default());
        let x = Tensor::<B, 3>::random([1, 4, 336], Distribution::Default, &Default::default());
        assert_eq!(lstm.forward(x).unwrap().dims(), [1, 4, 336]);
    }

    #[test]
    fn blstm_with_zero_projection_is_identity() {
        let mut lstm = BLstm::<B>::init(4, &Default::default());
        zero_linear(&mut lstm);
        let x = Tensor::<B, 3>::random([1, 4, 250], Distribution::Default, &Default::default());
        assert_eq!(values(lstm.forward(x.clone()).unwrap()), values(x));
    }

    #[test]
    fn blstm_projection_bias_reaches_every_step() {
        let device = Default::default();
        let mut lstm = BLstm::<B>::init(2, &device);
        zero_linear(&mut lstm);
        lstm.linear.bias = Some(Param::from_tensor(Tensor::from_floats([1.0, -1.0], &device)));
        let y = lstm.forward(Tensor::zeros([1, 2, 420], &device)).unwrap();
        let v = values(y);
        assert!(v[..420].iter().all(|&x| x == 1.0));
        assert!(v[420..].iter().all(|&x| x == -1.0));
    }

    #[test]
    fn blstm_rejects_wrong_width() {
        let lstm = BLstm::<B>::init(4, &Default::default());
        let x = Tensor::<B, 3>::zeros([1, 3, 10], &Default::default());
        assert!(matches!(lstm.forward(x), Err(ShapeError::Channels { .. })));
    }

    #[test]
    fn zero_attention_is_identity() {
        let attn = LocalState::<B>::init(8, 200, &Default::default());
        let x = Tensor::<B, 3>::random([3, 8, 12], Distribution::Default, &Default::default());
        let y = attn.forward(x.clone()).unwrap();
        assert_eq!(values(y), values(x));
    }

    #[test]
    fn attention_never_reaches_past_window() {
        let device = Default::default();
        let mut attn = LocalState::<B>::init(4, 2, &device);
        // content copies the input, projection copies the result
        let eye = Tensor::<B, 2>::eye(4, &device).reshape([4, 4, 1]);
        attn.content.weight = Param::from_tensor(eye.clone());
        attn.proj.weight = Param::from_tensor(eye);

        // impulse at position 0 only
        let mut data = vec![0.0f32; 4 * 10];
        for ch in 0..4 {
            data[ch * 10] = 1.0;
        }
        let x = Tensor::<B, 3>::from_data(TensorData::new(data, [1, 4, 10]), &device);
        let y = values(attn.forward(x).unwrap());
        for ch in 0..4 {
            let row = &y[ch * 10..(ch + 1) * 10];
            assert!(row[1] > 0.0 && row[2] > 0.0);
            assert!(row[3..].iter().all(|&v| v == 0.0), "leak past window: {row:?}");
        }
    }

    #[test]
    fn self_position_is_suppressed() {
        let attn = LocalState::<B>::init(4, 200, &Default::default());
        let masks = attn.masks(3);
        let keep = masks.keep.to_vec::<f32>().unwrap();
        let fill = masks.fill.to_vec::<f32>().unwrap();
        assert_eq!(fill[0], -100.0);
        assert_eq!(keep[0], 0.0);
        assert_eq!(keep[1], 1.0);
        assert_eq!(fill[4], -100.0);
    }

    #[test]
    fn masks_are_built_once_per_length() {
        let attn = LocalState::<B>::init(4, 2, &Default::default());
        let a = attn.masks(6);
        let b = attn.clone().masks(6);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &attn.masks(5)));
        // |0 - 5| is past the window of 2
        let fill = a.fill.to_vec::<f32>().unwrap();
        assert_eq!(fill[5], -1.0e30);
        assert_eq!(a.distance.to_vec::<f32>().unwrap()[5], 5.0);
    }
}
