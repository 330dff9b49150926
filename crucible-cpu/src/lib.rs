//! CPU backend for Crucible.
//!
//! Implements the attention op traits with AVX2+FMA (x86-64) or NEON
//! (AArch64) SIMD. Reduced-precision tensors (f16/bf16) are widened to
//! f32 for compute; softmax statistics always accumulate in f32.
//!
//! This backend doubles as the correctness baseline for other backends:
//! it carries the brute-force [`ReferenceAttentionOps`] oracle alongside
//! the optimized paths.
//!
//! [`ReferenceAttentionOps`]: crucible::backend::ReferenceAttentionOps

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod ops;
pub mod simd;
pub mod tensor;

use crucible::backend::Backend;

pub use tensor::CpuTensor;

/// Marker type for the CPU backend.
///
/// All op trait impls are on this type. Code parameterised by
/// `B: Backend` can use `CpuBackend` to run on CPU.
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Tensor = CpuTensor;
}

/// Check that the current CPU supports the required SIMD features.
///
/// Call this once at startup before using the backend.
///
/// # Errors
/// Returns an error if AVX2+FMA is missing on x86-64.
pub fn check_cpu_support() -> crucible::Result<()> {
    simd::check_cpu_support()
}
