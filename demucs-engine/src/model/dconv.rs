use burn::{
    module::{Module, Param},
    nn::{GroupNorm, GroupNormConfig},
    prelude::Backend,
    tensor::Tensor,
};

use crate::error::ShapeError;
use crate::model::config::ResidualKind;
use crate::model::kernels::{add_checked, glu, group_norm, Activation, Conv1d, ConvSpec};
use crate::model::recurrent::{BLstm, LocalState};
use crate::{DCONV_DEPTH, DCONV_KERNEL};

/// Residual stack of dilated convolutions over `[batch, channels, length]`.
///
/// Sub-block `j` uses dilation `2^j`. Each one compresses the channels,
/// optionally mixes along time (recurrent variant), expands back to twice the
/// width and gates with a GLU before a per-channel scale.
#[derive(Module, Debug)]
pub(crate) struct DConv<B: Backend> {
    pub(crate) layers: Vec<DConvLayer<B>>,
}

impl<B: Backend> DConv<B> {
    pub(crate) fn init(
        channels: usize,
        compress: usize,
        kind: ResidualKind,
        attention_window: usize,
        device: &B::Device,
    ) -> Self {
        let layers = (0..DCONV_DEPTH)
            .map(|j| DConvLayer::init(channels, compress, 1 << j, kind, attention_window, device))
            .collect();
        Self { layers }
    }

    pub(crate) fn kind(&self) -> ResidualKind {
        match self.layers.first().and_then(|l| l.mixer.as_ref()) {
            Some(_) => ResidualKind::Recurrent,
            None => ResidualKind::Convolutional,
        }
    }

    pub(crate) fn forward(&self, x: Tensor<B, 3>) -> Result<Tensor<B, 3>, ShapeError> {
        let mut x = x;
        for layer in &self.layers {
            x = layer.forward(x)?;
        }
        Ok(x)
    }

    /// Frequency layout `[channels, bins, frames]`: every bin row is an
    /// independent sequence.
    pub(crate) fn forward_rows(&self, x: Tensor<B, 3>) -> Result<Tensor<B, 3>, ShapeError> {
        let y = self.forward(x.swap_dims(0, 1))?;
        Ok(y.swap_dims(0, 1))
    }
}

#[derive(Module, Debug)]
pub(crate) struct DConvLayer<B: Backend> {
    pub(crate) conv1: Conv1d<B>,
    pub(crate) norm1: GroupNorm<B>,
    pub(crate) mixer: Option<RecurrentMixer<B>>,
    pub(crate) conv2: Conv1d<B>,
    pub(crate) norm2: GroupNorm<B>,
    pub(crate) scale: LayerScale<B>,
}

impl<B: Backend> DConvLayer<B> {
    fn init(
        channels: usize,
        compress: usize,
        dilation: usize,
        kind: ResidualKind,
        attention_window: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = channels / compress;
        let conv1 = Conv1d::new(
            ConvSpec::new(channels, hidden, [DCONV_KERNEL])
                .with_dilation([dilation])
                .with_padding([dilation * (DCONV_KERNEL / 2)]),
            device,
        );
        let mixer = match kind {
            ResidualKind::Convolutional => None,
            ResidualKind::Recurrent => Some(RecurrentMixer {
                lstm: BLstm::init(hidden, device),
                attn: LocalState::init(hidden, attention_window, device),
            }),
        };
        Self {
            conv1,
            norm1: GroupNormConfig::new(1, hidden).init(device),
            mixer,
            conv2: Conv1d::new(ConvSpec::new(hidden, 2 * channels, [1]), device),
            norm2: GroupNormConfig::new(1, 2 * channels).init(device),
            scale: LayerScale::init(channels, device),
        }
    }

    fn forward(&self, x: Tensor<B, 3>) -> Result<Tensor<B, 3>, ShapeError> {
        let y = self.conv1.forward(x.clone(), Activation::Identity)?;
        let mut y = group_norm(&self.norm1, y, Activation::Gelu)?;
        if let Some(mixer) = &self.mixer {
            y = mixer.forward(y)?;
        }
        let y = self.conv2.forward(y, Activation::Identity)?;
        let y = group_norm(&self.norm2, y, Activation::Identity)?;
        let y = self.scale.forward(glu(y, 1)?);
        add_checked("dconv", x, y)
    }
}

/// BLSTM followed by local attention, both on the compressed width.
#[derive(Module, Debug)]
pub(crate) struct RecurrentMixer<B: Backend> {
    pub(crate) lstm: BLstm<B>,
    pub(crate) attn: LocalState<B>,
}

impl<B: Backend> RecurrentMixer<B> {
    fn forward(&self, x: Tensor<B, 3>) -> Result<Tensor<B, 3>, ShapeError> {
        let x = self.lstm.forward(x)?;
        self.attn.forward(x)
    }
}

/// Learned per-channel multiplier.
#[derive(Module, Debug)]
pub(crate) struct LayerScale<B: Backend> {
    pub(crate) scale: Param<Tensor<B, 1>>,
}

impl<B: Backend> LayerScale<B> {
    fn init(channels: usize, device: &B::Device) -> Self {
        Self {
            scale: Param::from_tensor(Tensor::zeros([channels], device)),
        }
    }

    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        x * self.scale.val().unsqueeze_dim::<2>(0).unsqueeze_dim::<3>(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray<f32>;

    fn values(t: Tensor<B, 3>) -> Vec<f32> {
        t.to_data().to_vec::<f32>().unwrap()
    }

    fn set_scale(dconv: &mut DConv<B>, value: f32) {
        for layer in dconv.layers.iter_mut() {
            let ch = layer.scale.scale.val().dims()[0];
            layer.scale.scale = Param::from_tensor(Tensor::full([ch], value, &Default::default()));
        }
    }

    #[test]
    fn layer_scale_multiplies_channels() {
        let device = Default::default();
        let layer = LayerScale::<B> {
            scale: Param::from_tensor(Tensor::from_floats([2.0, 0.5], &device)),
        };
        let out = layer.forward(Tensor::<B, 3>::ones([1, 2, 3], &device));
        assert_eq!(values(out), vec![2.0, 2.0, 2.0, 0.5, 0.5, 0.5]);
    }

    #[test]
    fn zero_weights_are_identity() {
        let dconv = DConv::<B>::init(16, 8, ResidualKind::Convolutional, 200, &Default::default());
        let x = Tensor::<B, 3>::random([3, 16, 25], Distribution::Default, &Default::default());
        assert_eq!(values(dconv.forward(x.clone()).unwrap()), values(x));
    }

    #[test]
    fn recurrent_zero_weights_are_identity() {
        let dconv = DConv::<B>::init(16, 4, ResidualKind::Recurrent, 200, &Default::default());
        assert_eq!(dconv.kind(), ResidualKind::Recurrent);
        let x = Tensor::<B, 3>::random([1, 16, 30], Distribution::Default, &Default::default());
        assert_eq!(values(dconv.forward(x.clone()).unwrap()), values(x));
    }

    #[test]
    fn preserves_length_at_every_dilation() {
        let mut dconv = DConv::<B>::init(8, 4, ResidualKind::Convolutional, 200, &Default::default());
        set_scale(&mut dconv, 1.0);
        assert_eq!(dconv.layers.len(), 2);
        assert_eq!(dconv.layers[1].conv1.spec().dilation, [2]);
        assert_eq!(dconv.layers[1].conv1.spec().padding, [2]);
        let x = Tensor::<B, 3>::random([2, 8, 11], Distribution::Default, &Default::default());
        assert_eq!(dconv.forward(x).unwrap().dims(), [2, 8, 11]);
    }

    #[test]
    fn rows_are_independent_sequences() {
        let mut dconv = DConv::<B>::init(8, 4, ResidualKind::Convolutional, 200, &Default::default());
        set_scale(&mut dconv, 1.0);
        // with zero conv weights the gate is sigmoid(0) and the value is 0
        let x = Tensor::<B, 3>::random([8, 5, 7], Distribution::Default, &Default::default());
        let y = dconv.forward_rows(x.clone()).unwrap();
        assert_eq!(y.dims(), [8, 5, 7]);
        assert_eq!(values(y), values(x));
    }

    #[test]
    fn rejects_wrong_width() {
        let dconv = DConv::<B>::init(8, 4, ResidualKind::Convolutional, 200, &Default::default());
        let x = Tensor::<B, 3>::zeros([1, 6, 10], &Default::default());
        assert!(matches!(dconv.forward(x), Err(ShapeError::Channels { .. })));
    }
}
