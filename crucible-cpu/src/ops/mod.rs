//! CPU implementations of the attention op traits.

pub mod decode;
pub mod extend;
pub mod prefill;
pub mod reference;

use crucible::dtype::DType;
use crucible::tensor::Tensor;
use crucible::{Error, Result};

use crate::tensor::CpuTensor;

/// Dimensions of a rank-3 tensor `(tokens, heads, head_dim)`.
fn dims3(t: &CpuTensor) -> Result<[usize; 3]> {
    let s = t.shape();
    if s.len() != 3 {
        return Err(Error::ShapeMismatch {
            expected: vec![3],
            got: vec![s.len()],
        });
    }
    Ok([s[0], s[1], s[2]])
}

/// All inputs must share one floating-point dtype; returns it.
fn common_float_dtype(tensors: &[&CpuTensor]) -> Result<DType> {
    let first = tensors[0].dtype();
    if !first.is_float() {
        return Err(Error::DtypeMismatch {
            expected: "a float dtype".into(),
            got: first.to_string(),
        });
    }
    for t in &tensors[1..] {
        if t.dtype() != first {
            return Err(Error::DtypeMismatch {
                expected: first.to_string(),
                got: t.dtype().to_string(),
            });
        }
    }
    Ok(first)
}

/// `out` must have exactly this shape and a float dtype.
fn check_out(out: &CpuTensor, expected: &[usize]) -> Result<()> {
    if out.shape() != expected {
        return Err(Error::ShapeMismatch {
            expected: expected.to_vec(),
            got: out.shape().to_vec(),
        });
    }
    if !out.dtype().is_float() {
        return Err(Error::DtypeMismatch {
            expected: "a float dtype".into(),
            got: out.dtype().to_string(),
        });
    }
    Ok(())
}

/// Query heads must be an integer multiple of key/value heads.
fn check_head_grouping(q_heads: usize, kv_heads: usize) -> Result<()> {
    if kv_heads == 0 || q_heads % kv_heads != 0 {
        return Err(Error::ShapeMismatch {
            expected: vec![kv_heads],
            got: vec![q_heads],
        });
    }
    Ok(())
}

/// Numerically stable softmax over `scores` in place; returns the
/// normalizing sum. Masked entries are `NEG_INFINITY` on input and come
/// out as exact zeros. Returns 0.0 for an all-masked row (the caller
/// leaves the output row at zero).
fn softmax_inplace(scores: &mut [f32]) -> f32 {
    let max_score = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max_score == f32::NEG_INFINITY {
        // All masked: exp(-inf - -inf) would be NaN. Well-defined zero row.
        scores.fill(0.0);
        return 0.0;
    }
    let mut sum = 0.0f32;
    for score in scores.iter_mut() {
        *score = (*score - max_score).exp();
        sum += *score;
    }
    sum
}
