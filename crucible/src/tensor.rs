//! Tensor trait definition

use crate::dtype::DType;

/// Core tensor trait that defines the interface for all tensor implementations
///
/// Different backends (CPU, GPU, ...) implement this trait to provide
/// hardware-specific tensor storage while maintaining a unified interface.
/// Attention kernels are written against `B::Tensor` where `B: Backend`.
pub trait Tensor: Sized {
    /// Returns the shape of the tensor as a slice of dimensions
    fn shape(&self) -> &[usize];

    /// Returns the data type of tensor elements
    fn dtype(&self) -> DType;

    /// Create a view with a different shape (same data, same number of elements).
    ///
    /// # Panics
    /// Panics if the new shape has a different number of elements.
    #[must_use]
    fn reshape(&self, shape: &[usize]) -> Self;

    /// Create a zero-copy sub-slice view starting at element `offset` with the
    /// given `shape`.
    ///
    /// # Panics
    /// Panics if the view extends beyond the backing allocation.
    #[must_use]
    fn slice_view(&self, offset: usize, shape: &[usize]) -> Self;

    /// Returns the total number of elements in the tensor
    fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Returns the number of dimensions (rank) of the tensor
    fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Returns the stride for each dimension
    fn strides(&self) -> Vec<usize> {
        let shape = self.shape();
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Returns the size of the tensor data in bytes
    fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype().size_in_bytes()
    }
}
