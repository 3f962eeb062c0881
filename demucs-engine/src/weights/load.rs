use burn::module::Param;
use burn::nn::{BiLstm, Embedding, GroupNorm, Linear};
use burn::prelude::Backend;
use burn::tensor::Tensor;

use crate::model::conv::{HDecLayer, HEncLayer, TDecLayer, TEncLayer};
use crate::model::dconv::{DConv, DConvLayer, LayerScale};
use crate::model::htdemucs::{HybridDemucs, SharedStages};
use crate::model::kernels::{Conv1d, Conv2d, ConvTranspose1d, ConvTranspose2d};
use crate::model::recurrent::{BLstm, LocalState};
use crate::weights::tensor_store::{split_dim0, to_tensor_data, transpose_2d, StoredTensor};
use crate::weights::{TensorSource, WeightError};
use crate::FREQ_EMB_WEIGHT_SCALE;

type Source<'a> = &'a mut dyn TensorSource;

// ─── Primitive loaders ───────────────────────────────────────────────────────

fn from_stored<B: Backend, const D: usize>(t: StoredTensor, device: &B::Device) -> Param<Tensor<B, D>> {
    Param::from_tensor(Tensor::from_data(to_tensor_data(t), device))
}

/// Replace `param` with `key`, which must have the shape the layer was built with.
fn load_param<B: Backend, const D: usize>(
    param: &mut Param<Tensor<B, D>>,
    src: Source,
    key: &str,
    device: &B::Device,
) -> Result<(), WeightError> {
    let expected = param.val().dims();
    let t = src.take(key, &expected)?;
    *param = from_stored(t, device);
    Ok(())
}

fn load_conv1d<B: Backend>(conv: &mut Conv1d<B>, src: Source, prefix: &str, device: &B::Device) -> Result<(), WeightError> {
    load_param(&mut conv.weight, src, &format!("{prefix}.weight"), device)?;
    load_param(&mut conv.bias, src, &format!("{prefix}.bias"), device)
}

fn load_conv2d<B: Backend>(conv: &mut Conv2d<B>, src: Source, prefix: &str, device: &B::Device) -> Result<(), WeightError> {
    load_param(&mut conv.weight, src, &format!("{prefix}.weight"), device)?;
    load_param(&mut conv.bias, src, &format!("{prefix}.bias"), device)
}

fn load_conv_tr1d<B: Backend>(
    conv: &mut ConvTranspose1d<B>,
    src: Source,
    prefix: &str,
    device: &B::Device,
) -> Result<(), WeightError> {
    // [in, out / groups, k], same as the checkpoint
    load_param(&mut conv.weight, src, &format!("{prefix}.weight"), device)?;
    load_param(&mut conv.bias, src, &format!("{prefix}.bias"), device)
}

fn load_conv_tr2d<B: Backend>(
    conv: &mut ConvTranspose2d<B>,
    src: Source,
    prefix: &str,
    device: &B::Device,
) -> Result<(), WeightError> {
    load_param(&mut conv.weight, src, &format!("{prefix}.weight"), device)?;
    load_param(&mut conv.bias, src, &format!("{prefix}.bias"), device)
}

fn load_groupnorm<B: Backend>(gn: &mut GroupNorm<B>, src: Source, prefix: &str, device: &B::Device) -> Result<(), WeightError> {
    // PyTorch: .weight, .bias → Burn: .gamma, .beta
    if let Some(gamma) = gn.gamma.as_mut() {
        load_param(gamma, src, &format!("{prefix}.weight"), device)?;
    }
    if let Some(beta) = gn.beta.as_mut() {
        load_param(beta, src, &format!("{prefix}.bias"), device)?;
    }
    Ok(())
}

fn load_opt_groupnorm<B: Backend>(
    gn: &mut Option<GroupNorm<B>>,
    src: Source,
    prefix: &str,
    device: &B::Device,
) -> Result<(), WeightError> {
    match gn {
        Some(gn) => load_groupnorm(gn, src, prefix, device),
        None => Ok(()),
    }
}

/// PyTorch Linear stores `[out, in]`, Burn `[in, out]`.
fn set_linear<B: Backend>(linear: &mut Linear<B>, weight: StoredTensor, bias: Option<StoredTensor>, device: &B::Device) -> Result<(), WeightError> {
    linear.weight = from_stored(transpose_2d(weight)?, device);
    if let Some(b) = bias {
        linear.bias = Some(from_stored(b, device));
    }
    Ok(())
}

fn load_linear<B: Backend>(linear: &mut Linear<B>, src: Source, prefix: &str, device: &B::Device) -> Result<(), WeightError> {
    let [d_in, d_out] = linear.weight.val().dims();
    let w = src.take(&format!("{prefix}.weight"), &[d_out, d_in])?;
    let b = match linear.bias {
        Some(_) => Some(src.take(&format!("{prefix}.bias"), &[d_out])?),
        None => None,
    };
    set_linear(linear, w, b, device)
}

// ─── Recurrent loaders ──────────────────────────────────────────────────────

/// One direction of one LSTM layer. PyTorch packs the four gates along dim 0
/// in the order input, forget, cell, output.
fn load_lstm_direction<B: Backend>(
    lstm: &mut burn::nn::Lstm<B>,
    src: Source,
    prefix: &str,
    suffix: &str,
    device: &B::Device,
) -> Result<(), WeightError> {
    let [d_in, hidden] = lstm.input_gate.input_transform.weight.val().dims();
    let w_ih = src.take(&format!("{prefix}.weight_ih_{suffix}"), &[4 * hidden, d_in])?;
    let w_hh = src.take(&format!("{prefix}.weight_hh_{suffix}"), &[4 * hidden, hidden])?;
    let b_ih = src.take(&format!("{prefix}.bias_ih_{suffix}"), &[4 * hidden])?;
    let b_hh = src.take(&format!("{prefix}.bias_hh_{suffix}"), &[4 * hidden])?;

    let w_ih = split_dim0(&w_ih, 4)?;
    let w_hh = split_dim0(&w_hh, 4)?;
    let b_ih = split_dim0(&b_ih, 4)?;
    let b_hh = split_dim0(&b_hh, 4)?;

    let gates = [
        &mut lstm.input_gate,
        &mut lstm.forget_gate,
        &mut lstm.cell_gate,
        &mut lstm.output_gate,
    ];
    for (g, gate) in gates.into_iter().enumerate() {
        set_linear(&mut gate.input_transform, w_ih[g].clone(), Some(b_ih[g].clone()), device)?;
        set_linear(&mut gate.hidden_transform, w_hh[g].clone(), Some(b_hh[g].clone()), device)?;
    }
    Ok(())
}

fn load_bilstm_layer<B: Backend>(
    layer: &mut BiLstm<B>,
    src: Source,
    prefix: &str,
    index: usize,
    device: &B::Device,
) -> Result<(), WeightError> {
    load_lstm_direction(&mut layer.forward, src, prefix, &format!("l{index}"), device)?;
    load_lstm_direction(&mut layer.reverse, src, prefix, &format!("l{index}_reverse"), device)
}

fn load_blstm<B: Backend>(lstm: &mut BLstm<B>, src: Source, prefix: &str, device: &B::Device) -> Result<(), WeightError> {
    for (k, layer) in lstm.layers.iter_mut().enumerate() {
        load_bilstm_layer(layer, src, &format!("{prefix}.lstm"), k, device)?;
    }
    load_linear(&mut lstm.linear, src, &format!("{prefix}.linear"), device)
}

fn load_local_state<B: Backend>(attn: &mut LocalState<B>, src: Source, prefix: &str, device: &B::Device) -> Result<(), WeightError> {
    load_conv1d(&mut attn.content, src, &format!("{prefix}.content"), device)?;
    load_conv1d(&mut attn.query, src, &format!("{prefix}.query"), device)?;
    load_conv1d(&mut attn.key, src, &format!("{prefix}.key"), device)?;
    load_conv1d(&mut attn.query_decay, src, &format!("{prefix}.query_decay"), device)?;
    load_conv1d(&mut attn.proj, src, &format!("{prefix}.proj"), device)
}

// ─── Composite loaders ──────────────────────────────────────────────────────

fn load_layer_scale<B: Backend>(ls: &mut LayerScale<B>, src: Source, prefix: &str, device: &B::Device) -> Result<(), WeightError> {
    load_param(&mut ls.scale, src, &format!("{prefix}.scale"), device)
}

/// A residual sub-block is an `nn.Sequential`; parameter-free activations
/// still take an index.
///
/// Convolutional: `.0` conv1, `.1` norm1, `.3` conv2, `.4` norm2, `.6` scale.
/// Recurrent: `.3` BLSTM and `.4` local attention are inserted, shifting
/// conv2, norm2 and scale to `.5`, `.6` and `.8`.
fn load_dconv_layer<B: Backend>(layer: &mut DConvLayer<B>, src: Source, prefix: &str, device: &B::Device) -> Result<(), WeightError> {
    load_conv1d(&mut layer.conv1, src, &format!("{prefix}.0"), device)?;
    load_groupnorm(&mut layer.norm1, src, &format!("{prefix}.1"), device)?;
    let tail = match layer.mixer.as_mut() {
        Some(mixer) => {
            load_blstm(&mut mixer.lstm, src, &format!("{prefix}.3"), device)?;
            load_local_state(&mut mixer.attn, src, &format!("{prefix}.4"), device)?;
            5
        }
        None => 3,
    };
    load_conv1d(&mut layer.conv2, src, &format!("{prefix}.{tail}"), device)?;
    load_groupnorm(&mut layer.norm2, src, &format!("{prefix}.{}", tail + 1), device)?;
    load_layer_scale(&mut layer.scale, src, &format!("{prefix}.{}", tail + 3), device)
}

fn load_dconv<B: Backend>(dconv: &mut Option<DConv<B>>, src: Source, prefix: &str, device: &B::Device) -> Result<(), WeightError> {
    let Some(dconv) = dconv.as_mut() else {
        return Ok(());
    };
    log::trace!("{prefix}: {:?} residual", dconv.kind());
    for (j, layer) in dconv.layers.iter_mut().enumerate() {
        load_dconv_layer(layer, src, &format!("{prefix}.dconv.layers.{j}"), device)?;
    }
    Ok(())
}

fn load_henc_layer<B: Backend>(enc: &mut HEncLayer<B>, src: Source, prefix: &str, device: &B::Device) -> Result<(), WeightError> {
    load_conv2d(&mut enc.conv, src, &format!("{prefix}.conv"), device)?;
    load_opt_groupnorm(&mut enc.norm1, src, &format!("{prefix}.norm1"), device)?;
    load_dconv(&mut enc.dconv, src, prefix, device)?;
    load_conv2d(&mut enc.rewrite, src, &format!("{prefix}.rewrite"), device)?;
    load_opt_groupnorm(&mut enc.norm2, src, &format!("{prefix}.norm2"), device)
}

fn load_tenc_layer<B: Backend>(enc: &mut TEncLayer<B>, src: Source, prefix: &str, device: &B::Device) -> Result<(), WeightError> {
    load_conv1d(&mut enc.conv, src, &format!("{prefix}.conv"), device)?;
    load_opt_groupnorm(&mut enc.norm1, src, &format!("{prefix}.norm1"), device)?;
    load_dconv(&mut enc.dconv, src, prefix, device)?;
    if let Some(rewrite) = enc.rewrite.as_mut() {
        load_conv1d(rewrite, src, &format!("{prefix}.rewrite"), device)?;
    }
    load_opt_groupnorm(&mut enc.norm2, src, &format!("{prefix}.norm2"), device)
}

fn load_hdec_layer<B: Backend>(dec: &mut HDecLayer<B>, src: Source, prefix: &str, device: &B::Device) -> Result<(), WeightError> {
    load_conv2d(&mut dec.rewrite, src, &format!("{prefix}.rewrite"), device)?;
    load_opt_groupnorm(&mut dec.norm1, src, &format!("{prefix}.norm1"), device)?;
    load_dconv(&mut dec.dconv, src, prefix, device)?;
    load_conv_tr2d(&mut dec.conv_tr, src, &format!("{prefix}.conv_tr"), device)?;
    load_opt_groupnorm(&mut dec.norm2, src, &format!("{prefix}.norm2"), device)
}

fn load_tdec_layer<B: Backend>(dec: &mut TDecLayer<B>, src: Source, prefix: &str, device: &B::Device) -> Result<(), WeightError> {
    if let Some(rewrite) = dec.rewrite.as_mut() {
        load_conv1d(rewrite, src, &format!("{prefix}.rewrite"), device)?;
    }
    load_opt_groupnorm(&mut dec.norm1, src, &format!("{prefix}.norm1"), device)?;
    load_dconv(&mut dec.dconv, src, prefix, device)?;
    load_conv_tr1d(&mut dec.conv_tr, src, &format!("{prefix}.conv_tr"), device)?;
    load_opt_groupnorm(&mut dec.norm2, src, &format!("{prefix}.norm2"), device)
}

/// A final transposed convolution whose output width disagrees with the
/// requested source count is reported as a source-variant error rather than
/// a plain shape mismatch.
fn source_variant(err: WeightError, sources: usize) -> WeightError {
    match err {
        WeightError::ShapeMismatch { key, expected, found }
            if key.ends_with("conv_tr.weight")
                && expected.len() == found.len()
                && expected.len() > 1
                && expected[0] == found[0]
                && expected[2..] == found[2..] =>
        {
            WeightError::SourceVariant {
                key,
                sources,
                found: found[1],
            }
        }
        other => other,
    }
}

fn load_embedding<B: Backend>(emb: &mut Embedding<B>, src: Source, key: &str, device: &B::Device) -> Result<(), WeightError> {
    // The checkpoint stores the embedding pre-divided by its scale; bake the
    // scale back in here so inference only applies the residual weight.
    let expected = emb.weight.val().dims();
    let mut t = src.take(key, &expected)?;
    for v in &mut t.data {
        *v *= FREQ_EMB_WEIGHT_SCALE;
    }
    emb.weight = from_stored(t, device);
    Ok(())
}

fn load_shared<B: Backend>(shared: &mut SharedStages<B>, src: Source, device: &B::Device) -> Result<(), WeightError> {
    load_tenc_layer(&mut shared.inject, src, "tencoder.4", device)?;
    load_henc_layer(&mut shared.freq, src, "encoder.4", device)?;
    load_tenc_layer(&mut shared.bottom, src, "encoder.5", device)?;
    load_tdec_layer(&mut shared.bottom_decoder, src, "decoder.0", device)?;
    load_hdec_layer(&mut shared.freq_decoder, src, "decoder.1", device)?;
    load_tdec_layer(&mut shared.split_decoder, src, "tdecoder.0", device)
}

// ─── Top-level model loader ─────────────────────────────────────────────────

/// Fill every parameter of `model` from `src`.
///
/// Checkpoint indices: the shared stages take `encoder.4`, `encoder.5`,
/// `tencoder.4`, `decoder.0`, `decoder.1` and `tdecoder.0`, so the branch
/// decoders start at `decoder.2` / `tdecoder.1` when they are present.
pub(crate) fn load_into<B: Backend>(
    model: &mut HybridDemucs<B>,
    src: Source,
    device: &B::Device,
) -> Result<(), WeightError> {
    let sources = model.config().sources.count();

    for (i, enc) in model.encoders.iter_mut().enumerate() {
        load_henc_layer(enc, src, &format!("encoder.{i}"), device)?;
    }
    for (i, enc) in model.tencoders.iter_mut().enumerate() {
        load_tenc_layer(enc, src, &format!("tencoder.{i}"), device)?;
    }

    let (dec_offset, tdec_offset) = match model.shared.as_mut() {
        Some(shared) => {
            load_shared(shared, src, device)?;
            (2, 1)
        }
        None => (0, 0),
    };

    let n_dec = model.decoders.len();
    for (i, dec) in model.decoders.iter_mut().enumerate() {
        let prefix = format!("decoder.{}", i + dec_offset);
        let loaded = load_hdec_layer(dec, src, &prefix, device);
        if i + 1 == n_dec {
            loaded.map_err(|e| source_variant(e, sources))?;
        } else {
            loaded?;
        }
    }
    let n_tdec = model.tdecoders.len();
    for (i, dec) in model.tdecoders.iter_mut().enumerate() {
        let prefix = format!("tdecoder.{}", i + tdec_offset);
        let loaded = load_tdec_layer(dec, src, &prefix, device);
        if i + 1 == n_tdec {
            loaded.map_err(|e| source_variant(e, sources))?;
        } else {
            loaded?;
        }
    }

    if let Some(emb) = model.freq_emb.as_mut() {
        load_embedding(emb, src, "freq_emb.embedding.weight", device)?;
    }

    log::debug!(
        "loaded {:?} model ({} sources, {} encoder stages)",
        model.config().generation,
        sources,
        model.config().depth()
    );
    Ok(())
}
