//! Observer for the forward pass.
//!
//! Emits lightweight events after each stage, enough for progress reporting
//! and debugging without copying full tensors.

use burn::{prelude::Backend, tensor::Tensor};

/// Summary statistics for a tensor at a checkpoint.
#[derive(Debug, Clone)]
pub struct TensorStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std: f32,
}

impl std::fmt::Display for TensorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "shape={:<20} min={:+.6} max={:+.6} mean={:+.6} std={:.6}",
            format!("{:?}", self.shape),
            self.min,
            self.max,
            self.mean,
            self.std,
        )
    }
}

/// Which cascade a stage belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Freq,
    Time,
    /// Bottleneck stages fed by both branches.
    Shared,
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Branch::Freq => write!(f, "freq"),
            Branch::Time => write!(f, "time"),
            Branch::Shared => write!(f, "shared"),
        }
    }
}

/// Events emitted during the forward pass.
#[derive(Debug)]
pub enum ForwardEvent {
    /// Inputs z-normalized (only from [`crate::HybridDemucs::separate`]).
    Normalized,

    /// An encoder stage finished. `stage` is the depth index.
    EncoderDone {
        branch: Branch,
        stage: usize,
        stats: Option<TensorStats>,
    },

    /// Frequency embedding added after frequency stage 0.
    FreqEmbApplied,

    /// The bottleneck hook returned.
    BottleneckDone {
        freq_stats: Option<TensorStats>,
        time_stats: Option<TensorStats>,
    },

    /// A decoder stage finished. `stage` is the encoder depth it mirrors.
    DecoderDone {
        branch: Branch,
        stage: usize,
        stats: Option<TensorStats>,
    },

    /// Outputs rescaled to the input statistics.
    Denormalized,
}

/// Trait for observing the forward pass.
pub trait ForwardListener {
    fn on_event(&mut self, event: ForwardEvent);

    /// Return `true` to receive `TensorStats` in events. Computing them costs
    /// a few reductions per stage.
    fn wants_stats(&self) -> bool {
        false
    }
}

/// Ignores every event.
pub struct NoOpListener;

impl ForwardListener for NoOpListener {
    #[inline(always)]
    fn on_event(&mut self, _event: ForwardEvent) {}
}

/// Logs every checkpoint with its statistics at debug level.
pub struct DebugListener;

impl ForwardListener for DebugListener {
    fn on_event(&mut self, event: ForwardEvent) {
        let show = |s: &Option<TensorStats>| s.as_ref().map(|s| s.to_string()).unwrap_or_default();
        match &event {
            ForwardEvent::Normalized => log::debug!("normalized"),
            ForwardEvent::EncoderDone { branch, stage, stats } => {
                log::debug!("encoder {branch} {stage}  {}", show(stats))
            }
            ForwardEvent::FreqEmbApplied => log::debug!("freq embedding applied"),
            ForwardEvent::BottleneckDone {
                freq_stats,
                time_stats,
            } => log::debug!(
                "bottleneck done  freq: {}  time: {}",
                show(freq_stats),
                show(time_stats)
            ),
            ForwardEvent::DecoderDone { branch, stage, stats } => {
                log::debug!("decoder {branch} {stage}  {}", show(stats))
            }
            ForwardEvent::Denormalized => log::debug!("denormalized"),
        }
    }

    fn wants_stats(&self) -> bool {
        true
    }
}

/// Compute summary statistics with on-device reductions; only four scalars
/// reach the host.
pub fn tensor_stats<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> TensorStats {
    let shape = tensor.dims().to_vec();
    let n: usize = shape.iter().product();
    let flat = tensor.clone().reshape([n]);
    let min = scalar(flat.clone().min());
    let max = scalar(flat.clone().max());
    let mean = scalar(flat.clone().mean());
    let var = scalar(flat.var_bias(0));
    TensorStats {
        shape,
        min,
        max,
        mean,
        std: var.sqrt(),
    }
}

/// First element of a one-element tensor, NaN if it cannot be read back.
fn scalar<B: Backend>(t: Tensor<B, 1>) -> f32 {
    t.to_data()
        .to_vec::<f32>()
        .ok()
        .and_then(|v| v.first().copied())
        .unwrap_or(f32::NAN)
}

/// Compute stats only if the listener wants them.
pub fn maybe_stats<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    listener: &impl ForwardListener,
) -> Option<TensorStats> {
    listener.wants_stats().then(|| tensor_stats(tensor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn stats_of_known_tensor() {
        let t = Tensor::<B, 2>::from_floats([[1.0, 2.0], [3.0, 6.0]], &Default::default());
        let s = tensor_stats(&t);
        assert_eq!(s.shape, vec![2, 2]);
        assert_eq!((s.min, s.max, s.mean), (1.0, 6.0, 3.0));
        // biased variance: (4 + 1 + 0 + 9) / 4
        assert!((s.std - 3.5f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn stats_only_when_wanted() {
        let t = Tensor::<B, 1>::zeros([3], &Default::default());
        assert!(maybe_stats(&t, &NoOpListener).is_none());
        assert!(maybe_stats(&t, &DebugListener).is_some());
    }

    #[test]
    fn branch_names() {
        assert_eq!(Branch::Freq.to_string(), "freq");
        assert_eq!(Branch::Shared.to_string(), "shared");
    }
}
