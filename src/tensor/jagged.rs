//! Jagged (variable-length) batch types

use std::collections::BTreeMap;

use crate::backend::{Device, Stream};
use crate::error::{PipelineError, PipelineResult};
use crate::tensor::Tensor;

fn offsets_of(lengths: &[usize]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(lengths.len() + 1);
    let mut acc = 0;
    offsets.push(acc);
    for &len in lengths {
        acc += len;
        offsets.push(acc);
    }
    offsets
}

/// Variable-length rows packed into one values tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct JaggedTensor {
    values: Tensor,
    lengths: Vec<usize>,
    weights: Option<Tensor>,
}

impl JaggedTensor {
    pub fn new(values: Tensor, lengths: Vec<usize>, weights: Option<Tensor>) -> PipelineResult<Self> {
        let total: usize = lengths.iter().sum();
        if total != values.numel() {
            return Err(PipelineError::TypeMismatch {
                expected: format!("{} values", total),
                got: format!("{} values", values.numel()),
            });
        }
        Ok(JaggedTensor {
            values,
            lengths,
            weights,
        })
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn offsets(&self) -> Vec<usize> {
        offsets_of(&self.lengths)
    }

    pub fn weights(&self) -> Option<&Tensor> {
        self.weights.as_ref()
    }

    pub fn with_values(&self, values: Tensor) -> PipelineResult<Self> {
        Self::new(values, self.lengths.clone(), self.weights.clone())
    }

    pub fn to_device(&self, device: Device) -> Self {
        JaggedTensor {
            values: self.values.to_device(device),
            lengths: self.lengths.clone(),
            weights: self.weights.as_ref().map(|w| w.to_device(device)),
        }
    }

    pub fn record_stream(&self, stream: &Stream) {
        self.values.record_stream(stream);
        if let Some(weights) = &self.weights {
            weights.record_stream(stream);
        }
    }
}

/// Canonical sparse batch: for every key, one variable-length list of ids per
/// sample.
///
/// Lengths are key-major: `lengths[k * stride + b]` is the number of ids of
/// key `k` for sample `b`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedJaggedTensor {
    keys: Vec<String>,
    values: Tensor,
    weights: Option<Tensor>,
    lengths: Vec<usize>,
    stride: usize,
}

impl KeyedJaggedTensor {
    pub fn new(
        keys: Vec<String>,
        values: Tensor,
        weights: Option<Tensor>,
        lengths: Vec<usize>,
        stride: usize,
    ) -> PipelineResult<Self> {
        if lengths.len() != keys.len() * stride {
            return Err(PipelineError::TypeMismatch {
                expected: format!("{} lengths ({} keys x stride {})", keys.len() * stride, keys.len(), stride),
                got: format!("{} lengths", lengths.len()),
            });
        }
        let total: usize = lengths.iter().sum();
        if total != values.numel() {
            return Err(PipelineError::TypeMismatch {
                expected: format!("{} values", total),
                got: format!("{} values", values.numel()),
            });
        }
        if let Some(w) = &weights {
            if w.numel() != values.numel() {
                return Err(PipelineError::TypeMismatch {
                    expected: format!("{} weights", values.numel()),
                    got: format!("{} weights", w.numel()),
                });
            }
        }
        Ok(KeyedJaggedTensor {
            keys,
            values,
            weights,
            lengths,
            stride,
        })
    }

    /// Infer the stride from the number of keys.
    pub fn from_lengths(keys: Vec<String>, values: Tensor, lengths: Vec<usize>) -> PipelineResult<Self> {
        let stride = if keys.is_empty() {
            0
        } else {
            lengths.len() / keys.len()
        };
        Self::new(keys, values, None, lengths, stride)
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn weights(&self) -> Option<&Tensor> {
        self.weights.as_ref()
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn offsets(&self) -> Vec<usize> {
        offsets_of(&self.lengths)
    }

    /// Batch size.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn length_per_key(&self) -> Vec<usize> {
        if self.stride == 0 {
            return vec![0; self.keys.len()];
        }
        self.lengths
            .chunks(self.stride)
            .map(|chunk| chunk.iter().sum())
            .collect()
    }

    fn key_index(&self, key: &str) -> PipelineResult<usize> {
        self.keys
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| PipelineError::KeyNotFound(key.to_string()))
    }

    /// Ids of `key` for sample `sample`.
    pub fn bag(&self, key: usize, sample: usize) -> &[f32] {
        let slot = key * self.stride + sample;
        let start: usize = self.lengths[..slot].iter().sum();
        &self.values.data()[start..start + self.lengths[slot]]
    }

    pub fn get(&self, key: &str) -> PipelineResult<JaggedTensor> {
        let k = self.key_index(key)?;
        let lengths = self.lengths[k * self.stride..(k + 1) * self.stride].to_vec();
        let start: usize = self.lengths[..k * self.stride].iter().sum();
        let len: usize = lengths.iter().sum();
        let values = Tensor::from_slice(&self.values.data()[start..start + len]).to_device(self.values.device());
        let weights = self.weights.as_ref().map(|w| {
            Tensor::from_slice(&w.data()[start..start + len]).to_device(w.device())
        });
        JaggedTensor::new(values, lengths, weights)
    }

    pub fn to_dict(&self) -> PipelineResult<BTreeMap<String, JaggedTensor>> {
        self.keys
            .iter()
            .map(|k| Ok((k.clone(), self.get(k)?)))
            .collect()
    }

    /// Keep only `keys`, in the given order.
    pub fn select(&self, keys: &[String]) -> PipelineResult<Self> {
        let mut values = Vec::new();
        let mut weights = Vec::new();
        let mut lengths = Vec::with_capacity(keys.len() * self.stride);
        let offsets = self.offsets();
        for key in keys {
            let k = self.key_index(key)?;
            let slots = k * self.stride..(k + 1) * self.stride;
            let (start, end) = (offsets[slots.start], offsets[slots.end]);
            values.extend_from_slice(&self.values.data()[start..end]);
            if let Some(w) = &self.weights {
                weights.extend_from_slice(&w.data()[start..end]);
            }
            lengths.extend_from_slice(&self.lengths[slots]);
        }
        let device = self.values.device();
        let weights = self
            .weights
            .as_ref()
            .map(|_| Tensor::from_slice(&weights).to_device(device));
        Self::new(
            keys.to_vec(),
            Tensor::from_slice(&values).to_device(device),
            weights,
            lengths,
            self.stride,
        )
    }

    pub fn with_values(&self, values: Tensor) -> PipelineResult<Self> {
        Self::new(
            self.keys.clone(),
            values,
            self.weights.clone(),
            self.lengths.clone(),
            self.stride,
        )
    }

    pub fn to_device(&self, device: Device) -> Self {
        KeyedJaggedTensor {
            keys: self.keys.clone(),
            values: self.values.to_device(device),
            weights: self.weights.as_ref().map(|w| w.to_device(device)),
            lengths: self.lengths.clone(),
            stride: self.stride,
        }
    }

    pub fn record_stream(&self, stream: &Stream) {
        self.values.record_stream(stream);
        if let Some(weights) = &self.weights {
            weights.record_stream(stream);
        }
    }
}

/// Dense per-key embeddings concatenated along columns: `values` is
/// `[batch, sum(length_per_key)]`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedTensor {
    keys: Vec<String>,
    length_per_key: Vec<usize>,
    values: Tensor,
}

impl KeyedTensor {
    pub fn new(keys: Vec<String>, length_per_key: Vec<usize>, values: Tensor) -> PipelineResult<Self> {
        if keys.len() != length_per_key.len() {
            return Err(PipelineError::TypeMismatch {
                expected: format!("{} key widths", keys.len()),
                got: format!("{} key widths", length_per_key.len()),
            });
        }
        let width: usize = length_per_key.iter().sum();
        match values.shape() {
            [_, cols] if *cols == width => {}
            other => {
                return Err(PipelineError::TypeMismatch {
                    expected: format!("[batch, {}]", width),
                    got: format!("{:?}", other),
                })
            }
        }
        Ok(KeyedTensor {
            keys,
            length_per_key,
            values,
        })
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn length_per_key(&self) -> &[usize] {
        &self.length_per_key
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn get(&self, key: &str) -> PipelineResult<Tensor> {
        let k = self
            .keys
            .iter()
            .position(|x| x == key)
            .ok_or_else(|| PipelineError::KeyNotFound(key.to_string()))?;
        let start: usize = self.length_per_key[..k].iter().sum();
        self.values.narrow_columns(start, self.length_per_key[k])
    }

    pub fn to_dict(&self) -> PipelineResult<BTreeMap<String, Tensor>> {
        self.keys
            .iter()
            .map(|k| Ok((k.clone(), self.get(k)?)))
            .collect()
    }

    /// Same keys over a replacement values tensor of identical shape.
    pub fn with_values(&self, values: Tensor) -> PipelineResult<Self> {
        if values.shape() != self.values.shape() {
            return Err(PipelineError::TypeMismatch {
                expected: format!("{:?}", self.values.shape()),
                got: format!("{:?}", values.shape()),
            });
        }
        Ok(KeyedTensor {
            keys: self.keys.clone(),
            length_per_key: self.length_per_key.clone(),
            values,
        })
    }

    pub fn to_device(&self, device: Device) -> Self {
        KeyedTensor {
            keys: self.keys.clone(),
            length_per_key: self.length_per_key.clone(),
            values: self.values.to_device(device),
        }
    }

    pub fn record_stream(&self, stream: &Stream) {
        self.values.record_stream(stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kjt() -> KeyedJaggedTensor {
        // f1: [1, 2], [3]   f2: [], [4, 5]
        KeyedJaggedTensor::from_lengths(
            vec!["f1".to_string(), "f2".to_string()],
            Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0]),
            vec![2, 1, 0, 2],
        )
        .unwrap()
    }

    #[test]
    fn test_kjt_layout() {
        let kjt = kjt();
        assert_eq!(kjt.stride(), 2);
        assert_eq!(kjt.length_per_key(), vec![3, 2]);
        assert_eq!(kjt.offsets(), vec![0, 2, 3, 3, 5]);
        assert_eq!(kjt.bag(0, 0), &[1.0, 2.0]);
        assert_eq!(kjt.bag(1, 0), &[] as &[f32]);
        assert_eq!(kjt.bag(1, 1), &[4.0, 5.0]);
    }

    #[test]
    fn test_kjt_get() {
        let jt = kjt().get("f2").unwrap();
        assert_eq!(jt.lengths(), &[0, 2]);
        assert_eq!(jt.values().data(), &[4.0, 5.0]);
        assert!(matches!(kjt().get("f9"), Err(PipelineError::KeyNotFound(_))));
    }

    #[test]
    fn test_kjt_select() {
        let selected = kjt().select(&["f2".to_string()]).unwrap();
        assert_eq!(selected.keys(), &["f2".to_string()]);
        assert_eq!(selected.lengths(), &[0, 2]);
        assert_eq!(selected.values().data(), &[4.0, 5.0]);
        assert!(kjt().select(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_kjt_validation() {
        let bad = KeyedJaggedTensor::new(
            vec!["f1".to_string()],
            Tensor::from_slice(&[1.0]),
            None,
            vec![1, 1],
            2,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_keyed_tensor_get() {
        let values = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]).unwrap();
        let kt = KeyedTensor::new(vec!["a".to_string(), "b".to_string()], vec![1, 2], values).unwrap();
        assert_eq!(kt.get("b").unwrap().data(), &[2.0, 3.0, 5.0, 6.0]);
        assert_eq!(kt.to_dict().unwrap().len(), 2);

        let wrong = Tensor::zeros(vec![3, 3]);
        assert!(kt.with_values(wrong).is_err());
    }
}
