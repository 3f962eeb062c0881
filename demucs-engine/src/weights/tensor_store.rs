use std::collections::HashMap;

use burn::tensor::TensorData;
use half::{bf16, f16};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

use super::{TensorSource, WeightError};

/// Owned tensor data extracted from a weight source.
/// All data is stored as f32 regardless of original dtype.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl StoredTensor {
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            data: vec![0.0; shape.iter().product()],
            shape: shape.to_vec(),
        }
    }
}

/// Holds parsed tensors from a safetensors file, keyed by their
/// PyTorch-style names (with the signature prefix stripped).
pub struct TensorStore {
    tensors: HashMap<String, StoredTensor>,
}

impl TensorStore {
    /// Parse a safetensors file and keep every tensor under `signature`.
    ///
    /// With a non-empty signature (e.g. "955717e8") only keys starting with
    /// `"{signature}."` are kept and the prefix is stripped. An empty
    /// signature keeps the whole file as-is.
    pub fn from_bytes(data: &[u8], signature: &str) -> Result<Self, WeightError> {
        let st = SafeTensors::deserialize(data)
            .map_err(|e| WeightError::SafetensorsError(e.to_string()))?;

        let prefix = if signature.is_empty() {
            String::new()
        } else {
            format!("{}.", signature)
        };

        let mut tensors = HashMap::new();
        for (name, view) in st.tensors() {
            let Some(key) = name.strip_prefix(&prefix) else {
                continue;
            };
            let data = decode_f32(&view)?;
            tensors.insert(
                key.to_string(),
                StoredTensor {
                    data,
                    shape: view.shape().to_vec(),
                },
            );
        }

        if tensors.is_empty() {
            return Err(WeightError::NoTensorsFound(signature.to_string()));
        }

        log::debug!("tensor store: {} tensors under '{}'", tensors.len(), signature);
        Ok(Self { tensors })
    }

    /// Number of remaining tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Drop every tensor under `prefix` (for sub-models this engine does not run).
    /// Returns how many were discarded.
    pub fn skip_prefix(&mut self, prefix: &str) -> usize {
        let before = self.tensors.len();
        let dotted = format!("{}.", prefix);
        self.tensors
            .retain(|k, _| k != prefix && !k.starts_with(&dotted));
        before - self.tensors.len()
    }

    /// List remaining unused keys (for sanity checks after loading).
    pub fn remaining_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.tensors.keys().map(|s| s.as_str()).collect();
        keys.sort();
        keys
    }
}

impl TensorSource for TensorStore {
    fn take(&mut self, key: &str, expected: &[usize]) -> Result<StoredTensor, WeightError> {
        let t = self
            .tensors
            .remove(key)
            .ok_or_else(|| WeightError::MissingKey(key.to_string()))?;
        if t.shape != expected {
            return Err(WeightError::ShapeMismatch {
                key: key.to_string(),
                expected: expected.to_vec(),
                found: t.shape,
            });
        }
        Ok(t)
    }

    fn finish(&mut self) -> Result<(), WeightError> {
        if self.tensors.is_empty() {
            return Ok(());
        }
        Err(WeightError::UnusedKeys(
            self.remaining_keys().into_iter().map(String::from).collect(),
        ))
    }
}

fn decode_f32(view: &TensorView<'_>) -> Result<Vec<f32>, WeightError> {
    let raw = view.data();
    let data = match view.dtype() {
        Dtype::F32 => raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => raw
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::BF16 => raw
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        other => return Err(WeightError::UnsupportedDtype(format!("{:?}", other))),
    };
    Ok(data)
}

/// Source that hands out zeros of whatever shape is asked for and records
/// every request. Used to build an untrained model and to list the tensors a
/// configuration needs.
#[derive(Debug, Default)]
pub struct ZeroSource {
    manifest: Vec<(String, Vec<usize>)>,
}

impl ZeroSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(key, shape)` pairs in load order.
    pub fn manifest(&self) -> &[(String, Vec<usize>)] {
        &self.manifest
    }

    pub fn into_manifest(self) -> Vec<(String, Vec<usize>)> {
        self.manifest
    }
}

impl TensorSource for ZeroSource {
    fn take(&mut self, key: &str, expected: &[usize]) -> Result<StoredTensor, WeightError> {
        self.manifest.push((key.to_string(), expected.to_vec()));
        Ok(StoredTensor::zeros(expected))
    }
}

/// Convert a StoredTensor into a Burn TensorData.
pub fn to_tensor_data(t: StoredTensor) -> TensorData {
    TensorData::new(t.data, t.shape)
}

/// Split a StoredTensor along dimension 0 into `n_chunks` equal pieces.
/// E.g. an LSTM `weight_ih` of [4H, D] splits into the four [H, D] gate blocks.
pub fn split_dim0(t: &StoredTensor, n_chunks: usize) -> Result<Vec<StoredTensor>, WeightError> {
    let Some(&dim0) = t.shape.first() else {
        return Err(WeightError::ShapeMismatch {
            key: "split_dim0".to_string(),
            expected: vec![n_chunks],
            found: t.shape.clone(),
        });
    };
    if dim0 % n_chunks != 0 {
        return Err(WeightError::ShapeMismatch {
            key: "split_dim0".to_string(),
            expected: vec![dim0 - dim0 % n_chunks],
            found: t.shape.clone(),
        });
    }
    let chunk_size = dim0 / n_chunks;
    let row_elems: usize = t.shape[1..].iter().product();
    let chunk_elems = chunk_size * row_elems;

    Ok(t.data
        .chunks_exact(chunk_elems)
        .map(|data| {
            let mut shape = t.shape.clone();
            shape[0] = chunk_size;
            StoredTensor {
                data: data.to_vec(),
                shape,
            }
        })
        .collect())
}

/// Transpose a 2D StoredTensor [M, N] → [N, M].
/// PyTorch Linear stores [out, in], Burn Linear stores [in, out].
pub fn transpose_2d(t: StoredTensor) -> Result<StoredTensor, WeightError> {
    let &[m, n] = t.shape.as_slice() else {
        return Err(WeightError::ShapeMismatch {
            key: "transpose_2d".to_string(),
            expected: vec![0, 0],
            found: t.shape,
        });
    };
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            out[j * m + i] = t.data[i * n + j];
        }
    }
    Ok(StoredTensor {
        data: out,
        shape: vec![n, m],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetensors::tensor::{serialize, TensorView};

    /// Build a tiny safetensors file in memory.
    fn make_safetensors(tensors: &[(&str, Dtype, &[usize], Vec<u8>)]) -> Vec<u8> {
        let views: Vec<(&str, TensorView<'_>)> = tensors
            .iter()
            .map(|(name, dtype, shape, bytes)| {
                (
                    *name,
                    TensorView::new(*dtype, shape.to_vec(), bytes).unwrap(),
                )
            })
            .collect();
        serialize(views, &None).unwrap()
    }

    fn f32_bytes(data: &[f32]) -> Vec<u8> {
        bytemuck::cast_slice(data).to_vec()
    }

    #[test]
    fn parse_basic_safetensors() {
        let data = make_safetensors(&[
            ("sig1.layer.weight", Dtype::F32, &[2, 3], f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])),
            ("sig1.layer.bias", Dtype::F32, &[2], f32_bytes(&[0.1, 0.2])),
            ("other.ignored", Dtype::F32, &[1], f32_bytes(&[99.0])),
        ]);

        let mut store = TensorStore::from_bytes(&data, "sig1").unwrap();
        assert_eq!(store.len(), 2);

        let w = store.take("layer.weight", &[2, 3]).unwrap();
        assert_eq!(w.data, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = store.take("layer.bias", &[2]).unwrap();
        assert_eq!(b.data, vec![0.1, 0.2]);

        assert!(store.is_empty());
        store.finish().unwrap();
    }

    #[test]
    fn empty_signature_keeps_full_keys() {
        let data = make_safetensors(&[("encoder.0.conv.bias", Dtype::F32, &[1], f32_bytes(&[3.0]))]);
        let mut store = TensorStore::from_bytes(&data, "").unwrap();
        assert_eq!(store.take("encoder.0.conv.bias", &[1]).unwrap().data, vec![3.0]);
    }

    #[test]
    fn half_precision_is_widened() {
        let halves: Vec<u8> = [1.5f32, -2.0]
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_le_bytes())
            .collect();
        let brains: Vec<u8> = [0.25f32]
            .iter()
            .flat_map(|&v| bf16::from_f32(v).to_le_bytes())
            .collect();
        let data = make_safetensors(&[
            ("h", Dtype::F16, &[2], halves),
            ("b", Dtype::BF16, &[1], brains),
        ]);
        let mut store = TensorStore::from_bytes(&data, "").unwrap();
        assert_eq!(store.take("h", &[2]).unwrap().data, vec![1.5, -2.0]);
        assert_eq!(store.take("b", &[1]).unwrap().data, vec![0.25]);
    }

    #[test]
    fn missing_key_error() {
        let data = make_safetensors(&[("sig.x", Dtype::F32, &[1], f32_bytes(&[1.0]))]);
        let mut store = TensorStore::from_bytes(&data, "sig").unwrap();
        assert!(matches!(
            store.take("nonexistent", &[1]),
            Err(WeightError::MissingKey(_))
        ));
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let data = make_safetensors(&[("w", Dtype::F32, &[2, 2], f32_bytes(&[0.0; 4]))]);
        let mut store = TensorStore::from_bytes(&data, "").unwrap();
        match store.take("w", &[4]) {
            Err(WeightError::ShapeMismatch { expected, found, .. }) => {
                assert_eq!(expected, vec![4]);
                assert_eq!(found, vec![2, 2]);
            }
            other => panic!("expected shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn leftover_tensors_fail_finish() {
        let data = make_safetensors(&[
            ("a", Dtype::F32, &[1], f32_bytes(&[1.0])),
            ("crosstransformer.norm.weight", Dtype::F32, &[1], f32_bytes(&[1.0])),
            ("crosstransformer.norm.bias", Dtype::F32, &[1], f32_bytes(&[1.0])),
        ]);
        let mut store = TensorStore::from_bytes(&data, "").unwrap();
        store.take("a", &[1]).unwrap();
        assert!(matches!(store.finish(), Err(WeightError::UnusedKeys(k)) if k.len() == 2));
        assert_eq!(store.skip_prefix("crosstransformer"), 2);
        store.finish().unwrap();
    }

    #[test]
    fn no_matching_signature_error() {
        let data = make_safetensors(&[("sig.x", Dtype::F32, &[1], f32_bytes(&[1.0]))]);
        assert!(TensorStore::from_bytes(&data, "other").is_err());
    }

    #[test]
    fn zero_source_records_requests() {
        let mut zeros = ZeroSource::new();
        let t = zeros.take("decoder.3.conv_tr.bias", &[16]).unwrap();
        assert_eq!(t.data, vec![0.0; 16]);
        assert_eq!(
            zeros.manifest(),
            &[("decoder.3.conv_tr.bias".to_string(), vec![16])]
        );
    }

    #[test]
    fn transpose_2d_basic() {
        let t = StoredTensor {
            data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            shape: vec![2, 3],
        };
        let t2 = transpose_2d(t).unwrap();
        assert_eq!(t2.shape, vec![3, 2]);
        assert_eq!(t2.data, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn split_dim0_into_gates() {
        let t = StoredTensor {
            data: (1..=16).map(|x| x as f32).collect(),
            shape: vec![8, 2],
        };
        let gates = split_dim0(&t, 4).unwrap();
        assert_eq!(gates.len(), 4);
        assert_eq!(gates[0].shape, vec![2, 2]);
        assert_eq!(gates[2].data, vec![9.0, 10.0, 11.0, 12.0]);
        assert!(split_dim0(&t, 3).is_err());
    }
}
