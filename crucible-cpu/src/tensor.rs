//! CPU tensor implementation.

use std::sync::Arc;

use crucible::dtype::DType;
use crucible::tensor::Tensor;

/// A CPU-resident tensor backed by shared byte storage.
///
/// Uses `Arc<Vec<u8>>` so clones and `slice_view` are cheap (shared
/// backing). Kernels accumulate in f32 regardless of storage dtype;
/// f16/bf16 data is widened on read and rounded on store.
#[derive(Clone)]
pub struct CpuTensor {
    data: Arc<Vec<u8>>,
    offset: usize,
    shape: Vec<usize>,
    dtype: DType,
}

impl CpuTensor {
    /// Create a tensor from an f32 slice.
    #[must_use]
    pub fn from_f32(shape: &[usize], data: &[f32]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            numel,
            "data len {} != shape product {numel}",
            data.len()
        );
        Self {
            data: Arc::new(bytemuck::cast_slice(data).to_vec()),
            offset: 0,
            shape: shape.to_vec(),
            dtype: DType::F32,
        }
    }

    /// Create a tensor from f32 data, rounding through the target float
    /// dtype. This is the reduced-precision input path: the stored values
    /// are exactly what an f16/bf16 buffer would hold.
    ///
    /// # Panics
    /// Panics if `dtype` is not a float dtype or the data length is wrong.
    #[must_use]
    pub fn from_f32_cast(shape: &[usize], data: &[f32], dtype: DType) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(data.len(), numel);
        let bytes = match dtype {
            DType::F32 => bytemuck::cast_slice(data).to_vec(),
            DType::F16 => {
                let halves: Vec<half::f16> =
                    data.iter().map(|&v| half::f16::from_f32(v)).collect();
                bytemuck::cast_slice(&halves).to_vec()
            }
            DType::BF16 => {
                let halves: Vec<half::bf16> =
                    data.iter().map(|&v| half::bf16::from_f32(v)).collect();
                bytemuck::cast_slice(&halves).to_vec()
            }
            other => panic!("from_f32_cast: unsupported dtype {other}"),
        };
        Self {
            data: Arc::new(bytes),
            offset: 0,
            shape: shape.to_vec(),
            dtype,
        }
    }

    /// Create a zero-filled f32 tensor.
    #[must_use]
    pub fn zeros_f32(shape: &[usize]) -> Self {
        Self::zeros(shape, DType::F32)
    }

    /// Create a zero-filled tensor of the given dtype.
    #[must_use]
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            data: Arc::new(vec![0u8; numel * dtype.size_in_bytes()]),
            offset: 0,
            shape: shape.to_vec(),
            dtype,
        }
    }

    /// Get the data as an f32 slice.
    ///
    /// # Panics
    /// Panics if dtype is not F32.
    #[must_use]
    pub fn as_f32_slice(&self) -> &[f32] {
        assert_eq!(self.dtype, DType::F32, "expected F32 tensor");
        if self.numel() == 0 {
            // An empty Vec<u8> has a dangling 1-aligned pointer, which
            // bytemuck rejects even for zero-length casts.
            return &[];
        }
        let start = self.offset;
        let end = start + self.numel() * 4;
        bytemuck::cast_slice(&self.data[start..end])
    }

    /// Get the data as a mutable f32 slice.
    ///
    /// # Panics
    /// Panics if dtype is not F32.
    pub fn as_f32_slice_mut(&mut self) -> &mut [f32] {
        assert_eq!(self.dtype, DType::F32, "expected F32 tensor");
        let start = self.offset;
        let numel = self.numel();
        if numel == 0 {
            return &mut [];
        }
        let end = start + numel * 4;
        let data = Arc::make_mut(&mut self.data);
        bytemuck::cast_slice_mut(&mut data[start..end])
    }

    /// Get the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        let start = self.offset;
        let end = start + self.size_in_bytes();
        &self.data[start..end]
    }

    /// Convert to an f32 Vec, widening from bf16/f16 if necessary.
    #[must_use]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        if self.numel() == 0 {
            return Vec::new();
        }
        match self.dtype {
            DType::F32 => self.as_f32_slice().to_vec(),
            DType::BF16 => {
                let bf16s: &[half::bf16] = bytemuck::cast_slice(self.as_bytes());
                bf16s.iter().map(|v| v.to_f32()).collect()
            }
            DType::F16 => {
                let f16s: &[half::f16] = bytemuck::cast_slice(self.as_bytes());
                f16s.iter().map(|v| v.to_f32()).collect()
            }
            other => panic!("to_f32_vec: unsupported dtype {other}"),
        }
    }

    /// Overwrite this tensor's contents with f32 data, rounding to the
    /// tensor's dtype. This is the kernel output store path.
    ///
    /// # Panics
    /// Panics if the length does not match or dtype is not a float dtype.
    pub fn copy_from_f32(&mut self, data: &[f32]) {
        assert_eq!(data.len(), self.numel());
        let start = self.offset;
        let end = start + self.size_in_bytes();
        let dtype = self.dtype;
        let bytes = &mut Arc::make_mut(&mut self.data)[start..end];
        match dtype {
            DType::F32 => bytemuck::cast_slice_mut(bytes).copy_from_slice(data),
            DType::F16 => {
                let halves: &mut [half::f16] = bytemuck::cast_slice_mut(bytes);
                for (h, &v) in halves.iter_mut().zip(data) {
                    *h = half::f16::from_f32(v);
                }
            }
            DType::BF16 => {
                let halves: &mut [half::bf16] = bytemuck::cast_slice_mut(bytes);
                for (h, &v) in halves.iter_mut().zip(data) {
                    *h = half::bf16::from_f32(v);
                }
            }
            other => panic!("copy_from_f32: unsupported dtype {other}"),
        }
    }
}

impl Tensor for CpuTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn reshape(&self, shape: &[usize]) -> Self {
        let new_numel: usize = shape.iter().product();
        assert_eq!(
            self.numel(),
            new_numel,
            "reshape: {} elements != {new_numel} elements",
            self.numel()
        );
        Self {
            data: Arc::clone(&self.data),
            offset: self.offset,
            shape: shape.to_vec(),
            dtype: self.dtype,
        }
    }

    fn slice_view(&self, offset: usize, shape: &[usize]) -> Self {
        let elem_size = self.dtype.size_in_bytes();
        let byte_offset = self.offset + offset * elem_size;
        let new_numel: usize = shape.iter().product();
        assert!(
            byte_offset + new_numel * elem_size <= self.data.len(),
            "slice_view out of bounds"
        );
        Self {
            data: Arc::clone(&self.data),
            offset: byte_offset,
            shape: shape.to_vec(),
            dtype: self.dtype,
        }
    }
}
