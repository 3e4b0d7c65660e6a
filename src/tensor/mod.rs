//! Host tensor handles and the jagged batch types built on them

pub mod jagged;

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::backend::{Device, Stream, StreamId};
use crate::error::{PipelineError, PipelineResult};

pub use jagged::{JaggedTensor, KeyedJaggedTensor, KeyedTensor};

/// Reference-counted dense f32 tensor.
///
/// Cloning a `Tensor` yields another handle to the same tensor: stream
/// records made through either handle are visible through both. Views such
/// as [`Tensor::reshape`] and [`Tensor::detach_with_grad`] share the data
/// buffer but are distinct tensors.
#[derive(Clone)]
pub struct Tensor {
    inner: Arc<TensorInner>,
}

struct TensorInner {
    data: Arc<[f32]>,
    shape: Vec<usize>,
    device: Device,
    requires_grad: bool,
    recorded_streams: Mutex<Vec<StreamId>>,
}

impl Tensor {
    pub fn from_vec(data: Vec<f32>, shape: Vec<usize>) -> PipelineResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(PipelineError::TypeMismatch {
                expected: format!("{} elements for shape {:?}", expected, shape),
                got: format!("{} elements", data.len()),
            });
        }
        Ok(Self::build(Arc::from(data), shape, Device::Cpu, false))
    }

    /// 1-D tensor over `data`.
    pub fn from_slice(data: &[f32]) -> Self {
        Self::build(Arc::from(data), vec![data.len()], Device::Cpu, false)
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self::build(Arc::from(vec![0.0; numel]), shape, Device::Cpu, false)
    }

    fn build(data: Arc<[f32]>, shape: Vec<usize>, device: Device, requires_grad: bool) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                data,
                shape,
                device,
                requires_grad,
                recorded_streams: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn data(&self) -> &[f32] {
        &self.inner.data
    }

    pub fn shape(&self) -> &[usize] {
        &self.inner.shape
    }

    pub fn numel(&self) -> usize {
        self.inner.data.len()
    }

    pub fn device(&self) -> Device {
        self.inner.device
    }

    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad
    }

    /// Copy of this tensor placed on `device`. Returns the same handle when
    /// it already lives there.
    pub fn to_device(&self, device: Device) -> Tensor {
        if device == self.device() {
            return self.clone();
        }
        Self::build(
            Arc::from(self.data()),
            self.inner.shape.clone(),
            device,
            self.inner.requires_grad,
        )
    }

    /// New gradient-tracking leaf over the same data, cut off from whatever
    /// produced this tensor.
    pub fn detach_with_grad(&self) -> Tensor {
        Self::build(
            Arc::clone(&self.inner.data),
            self.inner.shape.clone(),
            self.inner.device,
            true,
        )
    }

    pub fn reshape(&self, shape: Vec<usize>) -> PipelineResult<Tensor> {
        let numel: usize = shape.iter().product();
        if numel != self.numel() {
            return Err(PipelineError::TypeMismatch {
                expected: format!("{} elements", self.numel()),
                got: format!("shape {:?}", shape),
            });
        }
        Ok(Self::build(
            Arc::clone(&self.inner.data),
            shape,
            self.inner.device,
            self.inner.requires_grad,
        ))
    }

    /// Elementwise map into a fresh tensor on the same device.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        let data: Vec<f32> = self.data().iter().map(|&x| f(x)).collect();
        Self::build(Arc::from(data), self.inner.shape.clone(), self.inner.device, false)
    }

    pub fn add(&self, other: &Tensor) -> PipelineResult<Tensor> {
        if self.shape() != other.shape() {
            return Err(PipelineError::TypeMismatch {
                expected: format!("shape {:?}", self.shape()),
                got: format!("shape {:?}", other.shape()),
            });
        }
        let data: Vec<f32> = self
            .data()
            .iter()
            .zip(other.data())
            .map(|(a, b)| a + b)
            .collect();
        Ok(Self::build(Arc::from(data), self.inner.shape.clone(), self.inner.device, false))
    }

    /// Columns `[start, start + len)` of a 2-D tensor.
    pub fn narrow_columns(&self, start: usize, len: usize) -> PipelineResult<Tensor> {
        let (rows, cols) = self.dims2()?;
        if start + len > cols {
            return Err(PipelineError::IndexOutOfRange {
                index: (start + len) as i64,
                len: cols,
            });
        }
        let mut data = Vec::with_capacity(rows * len);
        for row in self.data().chunks(cols) {
            data.extend_from_slice(&row[start..start + len]);
        }
        Ok(Self::build(Arc::from(data), vec![rows, len], self.inner.device, false))
    }

    /// Concatenate 2-D tensors with the same row count along columns.
    pub fn cat_columns(parts: &[Tensor]) -> PipelineResult<Tensor> {
        let Some(first) = parts.first() else {
            return Ok(Tensor::zeros(vec![0, 0]));
        };
        let (rows, _) = first.dims2()?;
        let mut widths = Vec::with_capacity(parts.len());
        for part in parts {
            let (r, c) = part.dims2()?;
            if r != rows {
                return Err(PipelineError::TypeMismatch {
                    expected: format!("{} rows", rows),
                    got: format!("{} rows", r),
                });
            }
            widths.push(c);
        }
        let total: usize = widths.iter().sum();
        let mut data = Vec::with_capacity(rows * total);
        for row in 0..rows {
            for (part, &width) in parts.iter().zip(&widths) {
                data.extend_from_slice(&part.data()[row * width..(row + 1) * width]);
            }
        }
        Ok(Self::build(Arc::from(data), vec![rows, total], first.device(), false))
    }

    fn dims2(&self) -> PipelineResult<(usize, usize)> {
        match self.shape() {
            [rows, cols] => Ok((*rows, *cols)),
            other => Err(PipelineError::TypeMismatch {
                expected: "2-D tensor".to_string(),
                got: format!("shape {:?}", other),
            }),
        }
    }

    /// Mark the tensor as used by `stream` so its memory outlives the work
    /// queued there.
    pub fn record_stream(&self, stream: &Stream) {
        if let Ok(mut recorded) = self.inner.recorded_streams.lock() {
            if !recorded.contains(&stream.id()) {
                recorded.push(stream.id());
            }
        }
    }

    pub fn recorded_streams(&self) -> Vec<StreamId> {
        self.inner
            .recorded_streams
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Both handles refer to the same tensor.
    pub fn same_tensor(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.inner.data, &other.inner.data)
    }

    /// Element-for-element equality including the sign of zero and NaN
    /// payloads.
    pub fn bit_eq(&self, other: &Tensor) -> bool {
        self.shape() == other.shape()
            && self
                .data()
                .iter()
                .zip(other.data())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.shape() == other.shape() && self.data() == other.data()
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.inner.shape)
            .field("device", &self.inner.device)
            .field("requires_grad", &self.inner.requires_grad)
            .field("data", &self.inner.data)
            .finish()
    }
}
