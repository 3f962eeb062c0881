use burn::{
    module::Module,
    nn::{GroupNorm, GroupNormConfig},
    prelude::Backend,
    tensor::Tensor,
};

use crate::error::{DemucsError, Result, ShapeError};
use crate::model::config::{DecoderSpec, EncoderSpec, ResidualKind};
use crate::model::dconv::DConv;
use crate::model::kernels::{
    add_checked, crop, glu, group_norm, group_norm_planar, pad_to_multiple, Activation, Conv1d,
    Conv2d, ConvSpec, ConvTranspose1d, ConvTranspose2d,
};
use crate::{NORM_GROUPS, REWRITE_CONTEXT};

/// Options every stage constructor needs besides its own geometry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StageOptions {
    pub compress: usize,
    pub attention_window: usize,
}

fn norm<B: Backend>(enabled: bool, channels: usize, device: &B::Device) -> Option<GroupNorm<B>> {
    enabled.then(|| GroupNormConfig::new(NORM_GROUPS, channels).init(device))
}

fn residual<B: Backend>(
    kind: Option<ResidualKind>,
    channels: usize,
    opts: StageOptions,
    device: &B::Device,
) -> Option<DConv<B>> {
    kind.map(|kind| DConv::init(channels, opts.compress, kind, opts.attention_window, device))
}

/// Frequency-branch encoder over `[channels, bins, frames]`. Downsamples the
/// bin axis only.
#[derive(Module, Debug)]
pub(crate) struct HEncLayer<B: Backend> {
    pub(crate) conv: Conv2d<B>,
    pub(crate) norm1: Option<GroupNorm<B>>,
    pub(crate) dconv: Option<DConv<B>>,
    pub(crate) rewrite: Conv2d<B>,
    pub(crate) norm2: Option<GroupNorm<B>>,
}

impl<B: Backend> HEncLayer<B> {
    pub(crate) fn init(spec: &EncoderSpec, opts: StageOptions, device: &B::Device) -> Self {
        let conv = Conv2d::new(
            ConvSpec::new(spec.chin, spec.chout, [spec.kernel, 1])
                .with_stride([spec.stride, 1])
                .with_padding([spec.padding, 0]),
            device,
        );
        let rewrite = Conv2d::new(ConvSpec::new(spec.chout, 2 * spec.chout, [1, 1]), device);
        Self {
            conv,
            norm1: norm(spec.norm, spec.chout, device),
            dconv: residual(spec.residual, spec.chout, opts, device),
            rewrite,
            norm2: norm(spec.norm, 2 * spec.chout, device),
        }
    }

    /// `inject` is a time-layout tensor `[1, chout, frames]` added to every
    /// bin row right after the convolution.
    pub(crate) fn forward(&self, x: Tensor<B, 3>, inject: Option<Tensor<B, 3>>) -> Result<Tensor<B, 3>> {
        let fused = self.norm1.is_none() && inject.is_none();
        let y = self
            .conv
            .forward(x, if fused { Activation::Gelu } else { Activation::Identity })?;

        let y = match inject {
            Some(inject) => {
                let [c, _, t] = y.dims();
                let [n, ic, it] = inject.dims();
                if n != 1 || ic != c || it != t {
                    return Err(ShapeError::Mismatch {
                        op: "injection",
                        left: y.dims().to_vec(),
                        right: inject.dims().to_vec(),
                    }
                    .into());
                }
                y + inject.reshape([c, 1, t])
            }
            None => y,
        };

        let y = match &self.norm1 {
            Some(n) => group_norm_planar(n, y, Activation::Gelu)?,
            None if !fused => Activation::Gelu.apply(y),
            None => y,
        };

        let y = match &self.dconv {
            Some(dconv) => dconv.forward_rows(y)?,
            None => y,
        };

        let y = self.rewrite.forward(y, Activation::Identity)?;
        let y = match &self.norm2 {
            Some(n) => group_norm_planar(n, y, Activation::Identity)?,
            None => y,
        };
        Ok(glu(y, 0)?)
    }
}

/// Time-branch encoder over `[1, channels, samples]`. The input is
/// right-padded to a multiple of the stride before the convolution.
///
/// An empty layer is convolution only and produces the cross-branch
/// injection.
#[derive(Module, Debug)]
pub(crate) struct TEncLayer<B: Backend> {
    pub(crate) conv: Conv1d<B>,
    pub(crate) norm1: Option<GroupNorm<B>>,
    pub(crate) dconv: Option<DConv<B>>,
    pub(crate) rewrite: Option<Conv1d<B>>,
    pub(crate) norm2: Option<GroupNorm<B>>,
}

impl<B: Backend> TEncLayer<B> {
    pub(crate) fn init(spec: &EncoderSpec, opts: StageOptions, device: &B::Device) -> Self {
        let conv = Conv1d::new(
            ConvSpec::new(spec.chin, spec.chout, [spec.kernel])
                .with_stride([spec.stride])
                .with_padding([spec.padding]),
            device,
        );
        if spec.empty {
            return Self {
                conv,
                norm1: None,
                dconv: None,
                rewrite: None,
                norm2: None,
            };
        }
        Self {
            conv,
            norm1: norm(spec.norm, spec.chout, device),
            dconv: residual(spec.residual, spec.chout, opts, device),
            rewrite: Some(Conv1d::new(ConvSpec::new(spec.chout, 2 * spec.chout, [1]), device)),
            norm2: norm(spec.norm, 2 * spec.chout, device),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.rewrite.is_none()
    }

    pub(crate) fn forward(&self, x: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let x = pad_to_multiple(x, self.conv.spec().stride[0]);
        let Some(rewrite) = &self.rewrite else {
            return Ok(self.conv.forward(x, Activation::Identity)?);
        };

        let y = match &self.norm1 {
            Some(n) => {
                let y = self.conv.forward(x, Activation::Identity)?;
                group_norm(n, y, Activation::Gelu)?
            }
            None => self.conv.forward(x, Activation::Gelu)?,
        };
        let y = match &self.dconv {
            Some(dconv) => dconv.forward(y)?,
            None => y,
        };
        let y = rewrite.forward(y, Activation::Identity)?;
        let y = match &self.norm2 {
            Some(n) => group_norm(n, y, Activation::Identity)?,
            None => y,
        };
        Ok(glu(y, 1)?)
    }
}

/// Frequency-branch decoder over `[channels, bins, frames]`.
#[derive(Module, Debug)]
pub(crate) struct HDecLayer<B: Backend> {
    pub(crate) rewrite: Conv2d<B>,
    pub(crate) norm1: Option<GroupNorm<B>>,
    pub(crate) dconv: Option<DConv<B>>,
    pub(crate) conv_tr: ConvTranspose2d<B>,
    pub(crate) norm2: Option<GroupNorm<B>>,
    crop: usize,
    last: bool,
}

impl<B: Backend> HDecLayer<B> {
    pub(crate) fn init(spec: &DecoderSpec, opts: StageOptions, device: &B::Device) -> Self {
        let context = 1 + 2 * REWRITE_CONTEXT;
        let rewrite = Conv2d::new(
            ConvSpec::new(spec.chin, 2 * spec.chin, [context, context])
                .with_padding([REWRITE_CONTEXT, REWRITE_CONTEXT]),
            device,
        );
        let conv_tr = ConvTranspose2d::new(
            ConvSpec::new(spec.chin, spec.chout, [spec.kernel, 1]).with_stride([spec.stride, 1]),
            device,
        );
        Self {
            rewrite,
            norm1: norm(spec.norm, 2 * spec.chin, device),
            dconv: residual(spec.residual, spec.chin, opts, device),
            conv_tr,
            norm2: norm(spec.norm, spec.chout, device),
            crop: spec.crop,
            last: spec.last,
        }
    }

    /// Returns the cropped output and the activation that entered the
    /// transposed convolution.
    pub(crate) fn forward(&self, x: Tensor<B, 3>, skip: Tensor<B, 3>) -> Result<(Tensor<B, 3>, Tensor<B, 3>)> {
        let x = add_checked("decoder skip", x, skip)?;
        let y = self.rewrite.forward(x, Activation::Identity)?;
        let y = match &self.norm1 {
            Some(n) => group_norm_planar(n, y, Activation::Identity)?,
            None => y,
        };
        let y = glu(y, 0)?;
        let pre = match &self.dconv {
            Some(dconv) => dconv.forward_rows(y)?,
            None => y,
        };

        let act = Activation::gelu_unless(self.last);
        let z = match &self.norm2 {
            Some(n) => {
                let z = self.conv_tr.forward(pre.clone(), Activation::Identity)?;
                group_norm_planar(n, z, act)?
            }
            None => self.conv_tr.forward(pre.clone(), act)?,
        };

        if self.crop == 0 {
            return Ok((z, pre));
        }
        let bins = z.dims()[1];
        let Some(kept) = bins.checked_sub(2 * self.crop) else {
            return Err(ShapeError::Crop {
                axis: 1,
                start: self.crop,
                len: 0,
                available: bins,
            }
            .into());
        };
        Ok((crop(z, 1, self.crop, kept)?, pre))
    }
}

/// Time-branch decoder over `[1, channels, samples]`, cropped to the length
/// recorded before the mirrored encoder.
///
/// An empty layer takes no skip: it upsamples its input directly.
#[derive(Module, Debug)]
pub(crate) struct TDecLayer<B: Backend> {
    pub(crate) rewrite: Option<Conv1d<B>>,
    pub(crate) norm1: Option<GroupNorm<B>>,
    pub(crate) dconv: Option<DConv<B>>,
    pub(crate) conv_tr: ConvTranspose1d<B>,
    pub(crate) norm2: Option<GroupNorm<B>>,
    crop: usize,
    last: bool,
}

impl<B: Backend> TDecLayer<B> {
    pub(crate) fn init(spec: &DecoderSpec, opts: StageOptions, device: &B::Device) -> Self {
        let conv_tr = ConvTranspose1d::new(
            ConvSpec::new(spec.chin, spec.chout, [spec.kernel]).with_stride([spec.stride]),
            device,
        );
        let norm2 = norm(spec.norm, spec.chout, device);
        if spec.empty {
            return Self {
                rewrite: None,
                norm1: None,
                dconv: None,
                conv_tr,
                norm2,
                crop: spec.crop,
                last: spec.last,
            };
        }
        let rewrite = Conv1d::new(
            ConvSpec::new(spec.chin, 2 * spec.chin, [1 + 2 * REWRITE_CONTEXT])
                .with_padding([REWRITE_CONTEXT]),
            device,
        );
        Self {
            rewrite: Some(rewrite),
            norm1: norm(spec.norm, 2 * spec.chin, device),
            dconv: residual(spec.residual, spec.chin, opts, device),
            conv_tr,
            norm2,
            crop: spec.crop,
            last: spec.last,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.rewrite.is_none()
    }

    pub(crate) fn forward(
        &self,
        x: Tensor<B, 3>,
        skip: Option<Tensor<B, 3>>,
        length: usize,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 3>)> {
        let pre = match (&self.rewrite, skip) {
            (Some(rewrite), Some(skip)) => {
                let x = add_checked("decoder skip", x, skip)?;
                let y = rewrite.forward(x, Activation::Identity)?;
                let y = match &self.norm1 {
                    Some(n) => group_norm(n, y, Activation::Identity)?,
                    None => y,
                };
                let y = glu(y, 1)?;
                match &self.dconv {
                    Some(dconv) => dconv.forward(y)?,
                    None => y,
                }
            }
            (None, None) => x,
            (Some(_), None) => {
                return Err(DemucsError::Internal("time decoder called without its skip".into()))
            }
            (None, Some(_)) => {
                return Err(DemucsError::Internal("empty time decoder does not take a skip".into()))
            }
        };

        let act = Activation::gelu_unless(self.last);
        let z = match &self.norm2 {
            Some(n) => {
                let z = self.conv_tr.forward(pre.clone(), Activation::Identity)?;
                group_norm(n, z, act)?
            }
            None => self.conv_tr.forward(pre.clone(), act)?,
        };
        Ok((crop(z, 2, self.crop, length)?, pre))
    }
}
