//! Backend trait and attention op trait definitions.
//!
//! Kernels are generic over `B: Backend` and express their compute
//! requirements through op traits (`PrefillAttentionOps`, etc.). Each
//! backend (CPU, GPU, ...) implements these with its own tensor type.
//!
//! # Design notes
//!
//! - **Op traits extend `Backend`** — they use `Self::Tensor` from the
//!   supertrait, avoiding repetition.
//! - **Index tables are plain slices / structs**, not tensors: offset
//!   tables are bookkeeping owned by the scheduler, and [`PageIndex`] /
//!   [`MaskSpec`] carry their validation with them.
//! - **The KV buffer is read-only for the duration of a call.** Callers
//!   must not mutate it concurrently; no internal locking is provided.

use crate::paging::{MaskSpec, PageIndex};
use crate::tensor::Tensor;
use crate::Result;

// ---- Core backend trait ----

/// A compute backend (CPU, GPU, etc.).
pub trait Backend: 'static {
    /// The tensor type for this backend (e.g., `CpuTensor`).
    type Tensor: Tensor + Clone;
}

// ---- Op traits ----

/// Dense causal (or non-causal) attention over a batch of fresh sequences
/// with no pre-existing cache.
pub trait PrefillAttentionOps: Backend {
    /// Scaled dot-product attention per sequence, over that sequence's own
    /// token range only.
    ///
    /// `q`/`k`/`v` are `(total_tokens, heads, head_dim)` with all sequences
    /// concatenated along the token axis; sequence `i` occupies rows
    /// `start_loc[i] .. start_loc[i] + seq_len[i]`. With `is_causal`, query
    /// position `p` (local to its sequence) attends to keys at positions
    /// `<= p`. `max_seq_len` is an upper bound over `seq_len`, a tiling
    /// hint only.
    ///
    /// Output is written to `out` (same shape as `q`) and is independent of
    /// the other sequences in the batch.
    #[allow(clippy::too_many_arguments)]
    fn prefill_attention(
        q: &Self::Tensor,
        k: &Self::Tensor,
        v: &Self::Tensor,
        out: &mut Self::Tensor,
        start_loc: &[i32],
        seq_len: &[i32],
        max_seq_len: usize,
        is_causal: bool,
    ) -> Result<()>;
}

/// Attention for newly computed ("extend") tokens against the concatenation
/// of their sequence's cached prefix and the new tokens themselves.
pub trait ExtendAttentionOps: Backend {
    /// Each extend query token attends to (a) its sequence's cached prefix,
    /// resolved through `pages`, and (b) the extend tokens of the same
    /// sequence up to and including itself. A present `mask` further
    /// restricts that pattern (it can exclude pairs, never widen them).
    ///
    /// `q_extend`/`k_extend`/`v_extend` are `(total_extend, heads, dim)`
    /// with sequence `i`'s extend tokens at rows
    /// `qo_indptr[i] .. qo_indptr[i+1]`. `k_cache`/`v_cache` are the shared
    /// KV buffer, `(num_slots, kv_heads, dim)`. `max_extend_len` is a
    /// tiling hint, not a correctness constraint.
    ///
    /// A zero-length prefix (pure prefill) and an extend length exceeding
    /// the prefix length are both ordinary inputs.
    #[allow(clippy::too_many_arguments)]
    fn extend_attention(
        q_extend: &Self::Tensor,
        k_extend: &Self::Tensor,
        v_extend: &Self::Tensor,
        out: &mut Self::Tensor,
        k_cache: &Self::Tensor,
        v_cache: &Self::Tensor,
        qo_indptr: &[i32],
        pages: &PageIndex<'_>,
        mask: Option<&MaskSpec<'_>>,
        max_extend_len: usize,
    ) -> Result<()>;
}

/// Single-token decode attention with parallel split-KV reduction.
///
/// Both variants share one contract: `q` is `(batch, q_heads, head_dim)`,
/// one query token per sequence; `out` is `(batch, q_heads, v_head_dim)`.
/// `acc` is a caller-provided f32 scratch accumulator of shape
/// `(batch, q_heads, num_kv_splits, v_head_dim + 1)` — each split's row
/// holds its normalized partial output with the running log-sum-exp in the
/// final slot. It is consumed within the call and never persisted.
///
/// The result must be invariant to `num_kv_splits` up to float rounding.
/// A sequence with zero cached tokens is rejected with `EmptyRange`.
pub trait DecodeAttentionOps: Backend {
    /// Per-head variant: each query head resolves its own key/value head
    /// (`q_heads % kv_heads == 0`), with no load sharing across heads.
    #[allow(clippy::too_many_arguments)]
    fn decode_attention_normal(
        q: &Self::Tensor,
        k_cache: &Self::Tensor,
        v_cache: &Self::Tensor,
        out: &mut Self::Tensor,
        pages: &PageIndex<'_>,
        acc: &mut Self::Tensor,
        num_kv_splits: usize,
        scale: f32,
    ) -> Result<()>;

    /// Grouped-query variant: query heads share key/value heads
    /// (`q_heads % kv_heads == 0`). K/V loads are shared across the group,
    /// but per-head output is mathematically identical to the normal
    /// variant applied per head.
    #[allow(clippy::too_many_arguments)]
    fn decode_attention_grouped(
        q: &Self::Tensor,
        k_cache: &Self::Tensor,
        v_cache: &Self::Tensor,
        out: &mut Self::Tensor,
        pages: &PageIndex<'_>,
        acc: &mut Self::Tensor,
        num_kv_splits: usize,
        scale: f32,
    ) -> Result<()>;

    /// Dispatch on head layout: normal when `q_heads == kv_heads`,
    /// grouped otherwise.
    #[allow(clippy::too_many_arguments)]
    fn decode_attention(
        q: &Self::Tensor,
        k_cache: &Self::Tensor,
        v_cache: &Self::Tensor,
        out: &mut Self::Tensor,
        pages: &PageIndex<'_>,
        acc: &mut Self::Tensor,
        num_kv_splits: usize,
        scale: f32,
    ) -> Result<()> {
        let q_heads = q.shape().get(1).copied().unwrap_or(0);
        let kv_heads = k_cache.shape().get(1).copied().unwrap_or(0);
        if q_heads == kv_heads {
            Self::decode_attention_normal(q, k_cache, v_cache, out, pages, acc, num_kv_splits, scale)
        } else {
            Self::decode_attention_grouped(q, k_cache, v_cache, out, pages, acc, num_kv_splits, scale)
        }
    }
}

/// Brute-force dense attention oracle used to validate the optimized paths.
pub trait ReferenceAttentionOps: Backend {
    /// For each sequence, gather its full logical key/value range
    /// (`prefix ++ extend`) by direct indexing — no paging — and compute
    /// dense causally-masked attention for the extend queries.
    ///
    /// Sequence `i`'s tokens live at cache rows
    /// `start_loc[r] .. start_loc[r] + seq_len[r]` where `r = req_idx[i]`;
    /// the final `seq_len[r] - prefix_len[r]` of them are the extend tokens
    /// whose queries are in `q_extend`. Deliberately unoptimized.
    #[allow(clippy::too_many_arguments)]
    fn reference_attention(
        q_extend: &Self::Tensor,
        out: &mut Self::Tensor,
        k_cache: &Self::Tensor,
        v_cache: &Self::Tensor,
        req_idx: &[i32],
        start_loc: &[i32],
        seq_len: &[i32],
        prefix_len: &[i32],
        max_len: usize,
    ) -> Result<()>;
}
