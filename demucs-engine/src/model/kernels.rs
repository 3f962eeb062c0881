//! Numeric kernels shared by every stage: strided and transposed
//! convolution with an optional fused GELU, GLU, group normalization and the
//! small shape helpers (crop, checked add, right padding).
//!
//! Every kernel checks the axis it depends on and returns a [`ShapeError`]
//! instead of letting the backend panic.

use burn::{
    module::{Ignored, Module, Param},
    nn::GroupNorm,
    prelude::Backend,
    tensor::{
        activation,
        module::{conv1d, conv2d, conv_transpose1d, conv_transpose2d},
        ops::{ConvOptions, ConvTransposeOptions},
        Tensor,
    },
};

use crate::error::ShapeError;

/// Elementwise activation fused into the preceding kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    /// Exact GELU, `x * 0.5 * (1 + erf(x / sqrt(2)))`.
    Gelu,
}

impl Activation {
    pub fn gelu_unless(last: bool) -> Self {
        if last {
            Activation::Identity
        } else {
            Activation::Gelu
        }
    }

    pub fn apply<B: Backend, const D: usize>(self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Identity => x,
            Activation::Gelu => activation::gelu(x),
        }
    }
}

/// Direct convolution output length, `None` when the input is too short.
pub fn conv_output_len(
    len: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
) -> Option<usize> {
    let span = dilation * (kernel - 1) + 1;
    let padded = len + 2 * padding;
    if padded < span || stride == 0 {
        return None;
    }
    Some((padded - span) / stride + 1)
}

/// Transposed convolution output length, `None` when the padding eats the
/// whole output.
pub fn conv_transpose_output_len(
    len: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let full = (len - 1) * stride + dilation * (kernel - 1) + 1;
    full.checked_sub(2 * padding).filter(|&n| n > 0)
}

/// Geometry of one convolution over `N` spatial axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvSpec<const N: usize> {
    pub chin: usize,
    pub chout: usize,
    pub kernel: [usize; N],
    pub stride: [usize; N],
    pub padding: [usize; N],
    pub dilation: [usize; N],
    pub groups: usize,
}

impl<const N: usize> ConvSpec<N> {
    pub fn new(chin: usize, chout: usize, kernel: [usize; N]) -> Self {
        Self {
            chin,
            chout,
            kernel,
            stride: [1; N],
            padding: [0; N],
            dilation: [1; N],
            groups: 1,
        }
    }

    pub fn with_stride(mut self, stride: [usize; N]) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: [usize; N]) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_dilation(mut self, dilation: [usize; N]) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn output_len(&self, input: [usize; N]) -> Option<[usize; N]> {
        let mut out = [0; N];
        for i in 0..N {
            out[i] = conv_output_len(
                input[i],
                self.kernel[i],
                self.stride[i],
                self.padding[i],
                self.dilation[i],
            )?;
        }
        Some(out)
    }

    pub fn transposed_output_len(&self, input: [usize; N]) -> Option<[usize; N]> {
        let mut out = [0; N];
        for i in 0..N {
            out[i] = conv_transpose_output_len(
                input[i],
                self.kernel[i],
                self.stride[i],
                self.padding[i],
                self.dilation[i],
            )?;
        }
        Some(out)
    }

    /// `(Cout, Cin / groups, k...)`
    pub fn weight_shape(&self) -> Vec<usize> {
        let mut shape = vec![self.chout, self.chin / self.groups];
        shape.extend_from_slice(&self.kernel);
        shape
    }

    /// `(Cin, Cout / groups, k...)`, the layout transposed convolutions are stored in.
    pub fn transposed_weight_shape(&self) -> Vec<usize> {
        let mut shape = vec![self.chin, self.chout / self.groups];
        shape.extend_from_slice(&self.kernel);
        shape
    }

    fn check_input(&self, op: &'static str, channels: usize, len: [usize; N], transposed: bool) -> Result<(), ShapeError> {
        if channels != self.chin {
            return Err(ShapeError::Channels {
                op,
                expected: self.chin,
                found: channels,
            });
        }
        let out = if transposed {
            self.transposed_output_len(len)
        } else {
            self.output_len(len)
        };
        if out.is_some() {
            return Ok(());
        }
        // Report the first axis that cannot produce an output.
        let axis = (0..N)
            .find(|&i| {
                let (k, s, p, d) = (self.kernel[i], self.stride[i], self.padding[i], self.dilation[i]);
                if transposed {
                    conv_transpose_output_len(len[i], k, s, p, d).is_none()
                } else {
                    conv_output_len(len[i], k, s, p, d).is_none()
                }
            })
            .unwrap_or(0);
        let needed = if transposed {
            1
        } else {
            (self.dilation[axis] * (self.kernel[axis] - 1) + 1).saturating_sub(2 * self.padding[axis])
        };
        Err(ShapeError::TooShort {
            op,
            len: len[axis],
            needed,
        })
    }
}

fn zeros_param<B: Backend, const D: usize>(shape: [usize; D], device: &B::Device) -> Param<Tensor<B, D>> {
    Param::from_tensor(Tensor::zeros(shape, device))
}

/// 1-D convolution over `[batch, channels, length]`.
#[derive(Module, Debug)]
pub struct Conv1d<B: Backend> {
    pub(crate) weight: Param<Tensor<B, 3>>,
    pub(crate) bias: Param<Tensor<B, 1>>,
    spec: Ignored<ConvSpec<1>>,
}

impl<B: Backend> Conv1d<B> {
    /// Zero-initialized; real values come from the loader.
    pub fn new(spec: ConvSpec<1>, device: &B::Device) -> Self {
        Self {
            weight: zeros_param([spec.chout, spec.chin / spec.groups, spec.kernel[0]], device),
            bias: zeros_param([spec.chout], device),
            spec: Ignored(spec),
        }
    }

    pub fn spec(&self) -> &ConvSpec<1> {
        &self.spec.0
    }

    pub fn forward(&self, x: Tensor<B, 3>, act: Activation) -> Result<Tensor<B, 3>, ShapeError> {
        let spec = &self.spec.0;
        let [_, c, l] = x.dims();
        spec.check_input("conv1d", c, [l], false)?;
        let y = conv1d(
            x,
            self.weight.val(),
            Some(self.bias.val()),
            ConvOptions::new(spec.stride, spec.padding, spec.dilation, spec.groups),
        );
        Ok(act.apply(y))
    }
}

/// 2-D convolution over a `[channels, height, width]` tensor.
#[derive(Module, Debug)]
pub struct Conv2d<B: Backend> {
    pub(crate) weight: Param<Tensor<B, 4>>,
    pub(crate) bias: Param<Tensor<B, 1>>,
    spec: Ignored<ConvSpec<2>>,
}

impl<B: Backend> Conv2d<B> {
    pub fn new(spec: ConvSpec<2>, device: &B::Device) -> Self {
        let [kh, kw] = spec.kernel;
        Self {
            weight: zeros_param([spec.chout, spec.chin / spec.groups, kh, kw], device),
            bias: zeros_param([spec.chout], device),
            spec: Ignored(spec),
        }
    }

    pub fn spec(&self) -> &ConvSpec<2> {
        &self.spec.0
    }

    pub fn forward(&self, x: Tensor<B, 3>, act: Activation) -> Result<Tensor<B, 3>, ShapeError> {
        let spec = &self.spec.0;
        let [c, h, w] = x.dims();
        spec.check_input("conv2d", c, [h, w], false)?;
        let y = conv2d(
            x.unsqueeze::<4>(),
            self.weight.val(),
            Some(self.bias.val()),
            ConvOptions::new(spec.stride, spec.padding, spec.dilation, spec.groups),
        );
        let [_, c, h, w] = y.dims();
        Ok(act.apply(y.reshape([c, h, w])))
    }
}

/// Transposed 1-D convolution over `[batch, channels, length]`.
#[derive(Module, Debug)]
pub struct ConvTranspose1d<B: Backend> {
    pub(crate) weight: Param<Tensor<B, 3>>,
    pub(crate) bias: Param<Tensor<B, 1>>,
    spec: Ignored<ConvSpec<1>>,
}

impl<B: Backend> ConvTranspose1d<B> {
    pub fn new(spec: ConvSpec<1>, device: &B::Device) -> Self {
        Self {
            weight: zeros_param([spec.chin, spec.chout / spec.groups, spec.kernel[0]], device),
            bias: zeros_param([spec.chout], device),
            spec: Ignored(spec),
        }
    }

    pub fn spec(&self) -> &ConvSpec<1> {
        &self.spec.0
    }

    pub fn forward(&self, x: Tensor<B, 3>, act: Activation) -> Result<Tensor<B, 3>, ShapeError> {
        let spec = &self.spec.0;
        let [_, c, l] = x.dims();
        spec.check_input("conv_transpose1d", c, [l], true)?;
        let y = conv_transpose1d(
            x,
            self.weight.val(),
            Some(self.bias.val()),
            ConvTransposeOptions::new(spec.stride, spec.padding, [0], spec.dilation, spec.groups),
        );
        Ok(act.apply(y))
    }
}

/// Transposed 2-D convolution over a `[channels, height, width]` tensor.
#[derive(Module, Debug)]
pub struct ConvTranspose2d<B: Backend> {
    pub(crate) weight: Param<Tensor<B, 4>>,
    pub(crate) bias: Param<Tensor<B, 1>>,
    spec: Ignored<ConvSpec<2>>,
}

impl<B: Backend> ConvTranspose2d<B> {
    pub fn new(spec: ConvSpec<2>, device: &B::Device) -> Self {
        let [kh, kw] = spec.kernel;
        Self {
            weight: zeros_param([spec.chin, spec.chout / spec.groups, kh, kw], device),
            bias: zeros_param([spec.chout], device),
            spec: Ignored(spec),
        }
    }

    pub fn spec(&self) -> &ConvSpec<2> {
        &self.spec.0
    }

    pub fn forward(&self, x: Tensor<B, 3>, act: Activation) -> Result<Tensor<B, 3>, ShapeError> {
        let spec = &self.spec.0;
        let [c, h, w] = x.dims();
        spec.check_input("conv_transpose2d", c, [h, w], true)?;
        let y = conv_transpose2d(
            x.unsqueeze::<4>(),
            self.weight.val(),
            Some(self.bias.val()),
            ConvTransposeOptions::new(spec.stride, spec.padding, [0, 0], spec.dilation, spec.groups),
        );
        let [_, c, h, w] = y.dims();
        Ok(act.apply(y.reshape([c, h, w])))
    }
}

/// Gated linear unit over `axis`: `first_half * sigmoid(second_half)`.
pub fn glu<B: Backend, const D: usize>(x: Tensor<B, D>, axis: usize) -> Result<Tensor<B, D>, ShapeError> {
    let len = x.dims()[axis];
    if len % 2 != 0 {
        return Err(ShapeError::OddGlu { axis, len });
    }
    let half = len / 2;
    let value = x.clone().narrow(axis, 0, half);
    let gate = x.narrow(axis, half, half);
    Ok(value * activation::sigmoid(gate))
}

/// Group normalization over `[batch, channels, ...]`, statistics per batch
/// element and group, biased variance.
pub fn group_norm<B: Backend, const D: usize>(
    norm: &GroupNorm<B>,
    x: Tensor<B, D>,
    act: Activation,
) -> Result<Tensor<B, D>, ShapeError> {
    let found = x.dims()[1];
    if let Some(expected) = norm.gamma.as_ref().map(|g| g.val().dims()[0]) {
        if expected != found {
            return Err(ShapeError::Channels {
                op: "group_norm",
                expected,
                found,
            });
        }
    }
    Ok(act.apply(norm.forward(x)))
}

/// Whole-tensor group normalization of a `[channels, height, width]` tensor,
/// i.e. a single batch element with `height * width` positions per channel.
pub fn group_norm_planar<B: Backend>(
    norm: &GroupNorm<B>,
    x: Tensor<B, 3>,
    act: Activation,
) -> Result<Tensor<B, 3>, ShapeError> {
    let [c, h, w] = x.dims();
    let y = group_norm(norm, x.reshape([1, c, h * w]), act)?;
    Ok(y.reshape([c, h, w]))
}

/// Keep `[start, start + len)` of `axis`.
pub fn crop<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    axis: usize,
    start: usize,
    len: usize,
) -> Result<Tensor<B, D>, ShapeError> {
    let available = x.dims()[axis];
    if len == 0 || start + len > available {
        return Err(ShapeError::Crop {
            axis,
            start,
            len,
            available,
        });
    }
    Ok(x.narrow(axis, start, len))
}

/// Elementwise add that insists on identical shapes.
pub fn add_checked<B: Backend, const D: usize>(
    op: &'static str,
    x: Tensor<B, D>,
    y: Tensor<B, D>,
) -> Result<Tensor<B, D>, ShapeError> {
    let (left, right) = (x.dims(), y.dims());
    if left != right {
        return Err(ShapeError::Mismatch {
            op,
            left: left.to_vec(),
            right: right.to_vec(),
        });
    }
    Ok(x + y)
}

/// Zero-pad the last axis on the right up to a multiple of `multiple`.
pub fn pad_to_multiple<B: Backend>(x: Tensor<B, 3>, multiple: usize) -> Tensor<B, 3> {
    let [n, c, l] = x.dims();
    let rem = l % multiple;
    if rem == 0 {
        return x;
    }
    let zeros = Tensor::zeros([n, c, multiple - rem], &x.device());
    Tensor::cat(vec![x, zeros], 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::nn::GroupNormConfig;
    use burn::tensor::{Distribution, TensorData};

    type B = NdArray<f32>;

    fn values<const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
        t.to_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn direct_output_len_matches_formula() {
        for len in 1..40 {
            for k in 1..9 {
                for stride in 1..5 {
                    for pad in 0..3 {
                        for dil in 1..3 {
                            let got = conv_output_len(len, k, stride, pad, dil);
                            let num = len as i64 + 2 * pad as i64 - dil as i64 * (k as i64 - 1) - 1;
                            if num < 0 {
                                assert_eq!(got, None);
                            } else {
                                assert_eq!(got, Some((num / stride as i64 + 1) as usize));
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn transposed_output_len_matches_formula() {
        assert_eq!(conv_transpose_output_len(1344, 8, 4, 0, 1), Some(5380));
        assert_eq!(conv_transpose_output_len(168, 4, 2, 0, 1), Some(338));
        assert_eq!(conv_transpose_output_len(1, 8, 4, 2, 1), Some(4));
        assert_eq!(conv_transpose_output_len(1, 2, 1, 1, 1), None);
        assert_eq!(conv_transpose_output_len(0, 8, 4, 0, 1), None);
    }

    #[test]
    fn segment_lengths_follow_the_stage_geometry() {
        // time branch: pad right to a multiple of 4, then k8 s4 p2
        let mut len = crate::SEGMENT_SAMPLES;
        let mut seen = vec![len];
        for _ in 0..5 {
            let padded = len.div_ceil(4) * 4;
            len = conv_output_len(padded, 8, 4, 2, 1).unwrap();
            seen.push(len);
        }
        assert_eq!(seen, vec![343980, 85995, 21499, 5375, 1344, 336]);
    }

    #[test]
    fn conv1d_shapes_and_bias() {
        let device = Default::default();
        let spec = ConvSpec::new(2, 3, [8]).with_stride([4]).with_padding([2]);
        let mut conv = Conv1d::<B>::new(spec, &device);
        conv.bias = Param::from_tensor(Tensor::from_floats([0.5, -1.0, 2.0], &device));

        let x = Tensor::<B, 3>::random([1, 2, 64], Distribution::Default, &device);
        let y = conv.forward(x, Activation::Identity).unwrap();
        assert_eq!(y.dims(), [1, 3, 16]);
        let v = values(y);
        assert!(v[..16].iter().all(|&x| x == 0.5));
        assert!(v[32..].iter().all(|&x| x == 2.0));
    }

    #[test]
    fn conv1d_fused_gelu() {
        let device = Default::default();
        let mut conv = Conv1d::<B>::new(ConvSpec::new(1, 2, [1]), &device);
        conv.bias = Param::from_tensor(Tensor::from_floats([1.0, -1.0], &device));
        let y = conv
            .forward(Tensor::zeros([1, 1, 3], &device), Activation::Gelu)
            .unwrap();
        let v = values(y);
        assert!((v[0] - 0.841_344_7).abs() < 1e-5);
        assert!((v[3] + 0.158_655_3).abs() < 1e-5);
    }

    #[test]
    fn conv1d_rejects_wrong_channels_and_short_input() {
        let device = Default::default();
        let conv = Conv1d::<B>::new(ConvSpec::new(4, 8, [8]).with_stride([4]), &device);
        let err = conv
            .forward(Tensor::zeros([1, 3, 64], &device), Activation::Identity)
            .unwrap_err();
        assert_eq!(
            err,
            ShapeError::Channels {
                op: "conv1d",
                expected: 4,
                found: 3
            }
        );
        let err = conv
            .forward(Tensor::zeros([1, 4, 5], &device), Activation::Identity)
            .unwrap_err();
        assert_eq!(
            err,
            ShapeError::TooShort {
                op: "conv1d",
                len: 5,
                needed: 8
            }
        );
    }

    #[test]
    fn conv1d_dilation_preserves_length() {
        let device = Default::default();
        let spec = ConvSpec::new(8, 2, [3]).with_dilation([2]).with_padding([2]);
        let conv = Conv1d::<B>::new(spec, &device);
        let y = conv
            .forward(Tensor::ones([3, 8, 17], &device), Activation::Identity)
            .unwrap();
        assert_eq!(y.dims(), [3, 2, 17]);
    }

    #[test]
    fn conv2d_on_frequency_layout() {
        let device = Default::default();
        let spec = ConvSpec::new(4, 6, [8, 1]).with_stride([4, 1]).with_padding([2, 0]);
        let conv = Conv2d::<B>::new(spec, &device);
        let y = conv
            .forward(Tensor::ones([4, 256, 5], &device), Activation::Identity)
            .unwrap();
        assert_eq!(y.dims(), [6, 64, 5]);
    }

    #[test]
    fn conv2d_matches_hand_computed_window() {
        let device = Default::default();
        // one input/output channel, kernel [2, 1], weights [1, 10]
        let mut conv = Conv2d::<B>::new(ConvSpec::new(1, 1, [2, 1]), &device);
        conv.weight = Param::from_tensor(Tensor::from_data(
            TensorData::new(vec![1.0f32, 10.0], [1, 1, 2, 1]),
            &device,
        ));
        let x = Tensor::<B, 3>::from_data(TensorData::new(vec![1.0f32, 2.0, 3.0], [1, 3, 1]), &device);
        let y = conv.forward(x, Activation::Identity).unwrap();
        assert_eq!(values(y), vec![21.0, 32.0]);
    }

    #[test]
    fn transposed_convs_upsample() {
        let device = Default::default();
        let tr1 = ConvTranspose1d::<B>::new(ConvSpec::new(6, 4, [8]).with_stride([4]), &device);
        let y = tr1
            .forward(Tensor::ones([1, 6, 10], &device), Activation::Gelu)
            .unwrap();
        assert_eq!(y.dims(), [1, 4, 44]);

        let tr2 = ConvTranspose2d::<B>::new(ConvSpec::new(6, 3, [8, 1]).with_stride([4, 1]), &device);
        let y = tr2
            .forward(Tensor::ones([6, 4, 7], &device), Activation::Identity)
            .unwrap();
        assert_eq!(y.dims(), [3, 20, 7]);
    }

    #[test]
    fn transposed_conv_scatters_kernel() {
        let device = Default::default();
        let mut tr = ConvTranspose1d::<B>::new(ConvSpec::new(1, 1, [2]).with_stride([2]), &device);
        tr.weight = Param::from_tensor(Tensor::from_data(
            TensorData::new(vec![1.0f32, -1.0], [1, 1, 2]),
            &device,
        ));
        let x = Tensor::<B, 3>::from_data(TensorData::new(vec![3.0f32, 5.0], [1, 1, 2]), &device);
        let y = tr.forward(x, Activation::Identity).unwrap();
        assert_eq!(values(y), vec![3.0, -3.0, 5.0, -5.0]);
    }

    #[test]
    fn glu_halves_axis_and_saturates() {
        let device = Default::default();
        // axis 0 split: value half = [1, 2], gate half = [+20, -20]
        let x = Tensor::<B, 3>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 20.0, -20.0], [4, 1, 1]),
            &device,
        );
        let y = glu(x, 0).unwrap();
        assert_eq!(y.dims(), [2, 1, 1]);
        let v = values(y);
        assert!((v[0] - 1.0).abs() < 1e-6);
        assert!(v[1].abs() < 1e-6);
    }

    #[test]
    fn glu_on_time_axis_and_gate_value() {
        let device = Default::default();
        let x = Tensor::<B, 3>::from_data(
            TensorData::new(vec![1.0f32, 1.0, 2.0, 2.0], [1, 2, 2]),
            &device,
        );
        let v = values(glu(x, 1).unwrap());
        // sigmoid(2) = 0.8807971
        assert!(v.iter().all(|&y| (y - 0.880_797_1).abs() < 1e-6));
    }

    #[test]
    fn glu_rejects_odd_axis() {
        let x = Tensor::<B, 3>::zeros([1, 3, 4], &Default::default());
        assert_eq!(glu(x, 1).unwrap_err(), ShapeError::OddGlu { axis: 1, len: 3 });
    }

    #[test]
    fn group_norm_standardizes_each_group() {
        let device = Default::default();
        let norm = GroupNormConfig::new(2, 4).init::<B>(&device);
        let x = Tensor::<B, 3>::random([3, 4, 50], Distribution::Normal(3.0, 2.0), &device);
        let y = group_norm(&norm, x, Activation::Identity).unwrap();
        // [batch, group, positions]
        let g = y.reshape([3, 2, 100]);
        let mean = values(g.clone().mean_dim(2));
        let var = values(g.var_bias(2));
        assert!(mean.iter().all(|m| m.abs() < 1e-4));
        assert!(var.iter().all(|v| (v - 1.0).abs() < 1e-3));
    }

    #[test]
    fn group_norm_is_affine_invariant() {
        let device = Default::default();
        let norm = GroupNormConfig::new(1, 6).init::<B>(&device);
        let x = Tensor::<B, 3>::random([1, 6, 20], Distribution::Default, &device);
        let a = values(group_norm(&norm, x.clone(), Activation::Identity).unwrap());
        let b = values(group_norm(&norm, x * 7.0 + 3.0, Activation::Identity).unwrap());
        for (p, q) in a.iter().zip(&b) {
            assert!((p - q).abs() < 1e-3);
        }
    }

    #[test]
    fn planar_norm_matches_four_axis_norm() {
        let device = Default::default();
        let norm = GroupNormConfig::new(4, 8).init::<B>(&device);
        let x = Tensor::<B, 3>::random([8, 3, 5], Distribution::Default, &device);
        let planar = group_norm_planar(&norm, x.clone(), Activation::Gelu).unwrap();
        let four = group_norm(&norm, x.unsqueeze::<4>(), Activation::Gelu)
            .unwrap()
            .reshape([8, 3, 5]);
        for (p, q) in values(planar).iter().zip(values(four).iter()) {
            assert!((p - q).abs() < 1e-6);
        }
    }

    #[test]
    fn group_norm_checks_channels() {
        let norm = GroupNormConfig::new(1, 4).init::<B>(&Default::default());
        let x = Tensor::<B, 3>::zeros([1, 5, 2], &Default::default());
        assert!(matches!(
            group_norm(&norm, x, Activation::Identity),
            Err(ShapeError::Channels { expected: 4, found: 5, .. })
        ));
    }

    #[test]
    fn crop_and_add_are_checked() {
        let device = Default::default();
        let x = Tensor::<B, 3>::ones([2, 10, 3], &device);
        assert_eq!(crop(x.clone(), 1, 2, 6).unwrap().dims(), [2, 6, 3]);
        assert!(crop(x.clone(), 1, 6, 6).is_err());
        let y = Tensor::<B, 3>::ones([2, 9, 3], &device);
        assert!(matches!(
            add_checked("skip", x, y),
            Err(ShapeError::Mismatch { op: "skip", .. })
        ));
    }

    #[test]
    fn pads_to_stride_multiple() {
        let device = Default::default();
        let x = Tensor::<B, 3>::ones([1, 2, 10], &device);
        let y = pad_to_multiple(x, 4);
        assert_eq!(y.dims(), [1, 2, 12]);
        let v = values(y);
        assert_eq!(&v[10..12], &[0.0, 0.0]);
        let same = pad_to_multiple(Tensor::<B, 3>::ones([1, 2, 8], &device), 4);
        assert_eq!(same.dims(), [1, 2, 8]);
    }
}
