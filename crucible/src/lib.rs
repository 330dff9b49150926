//! Crucible: batched attention over a paged KV cache
//!
//! This crate provides the core types and traits for the attention engine
//! of an autoregressive inference server: the error taxonomy, dtype and
//! tensor seams, CSR paging structures, and the op traits that backends
//! implement. Backend-specific kernels (CPU, GPU, ...) live in separate
//! crates.

pub mod backend;
pub mod dtype;
pub mod error;
pub mod paging;
pub mod tensor;

pub use backend::{
    Backend, DecodeAttentionOps, ExtendAttentionOps, PrefillAttentionOps, ReferenceAttentionOps,
};
pub use dtype::DType;
pub use error::{Error, Result};
pub use paging::{MaskSpec, PageIndex};
pub use tensor::Tensor;
