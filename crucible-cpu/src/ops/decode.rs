//! DecodeAttentionOps implementation: single-token decode attention with
//! parallel split-KV reduction.
//!
//! Stage 1 partitions each sequence's cached range into `num_kv_splits`
//! contiguous chunks and computes, per (sequence, head, split), a
//! chunk-normalized partial output plus its log-sum-exp, stored in the
//! caller's accumulator. Stage 2 merges the splits with the standard
//! log-sum-exp combination rule. The merge is associative, so the result
//! is invariant to the split count up to float rounding.
//!
//! The grouped variant shares each K/V row load across all query heads of
//! a group; its per-head arithmetic is identical to the normal variant.

use crucible::backend::DecodeAttentionOps;
use crucible::paging::PageIndex;
use crucible::tensor::Tensor;
use crucible::{DType, Error, Result};
use rayon::prelude::*;

use crate::ops::{check_head_grouping, check_out, common_float_dtype, dims3};
use crate::simd;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// The KV range `[start, end)` handled by split `s` of `num_splits`.
fn split_range(len: usize, num_splits: usize, s: usize) -> (usize, usize) {
    let chunk = len.div_ceil(num_splits);
    let start = s * chunk;
    (start.min(len), ((s + 1) * chunk).min(len))
}

/// Number of leading non-empty splits for a sequence of `len` tokens.
fn splits_used(len: usize, num_splits: usize) -> usize {
    len.div_ceil(len.div_ceil(num_splits))
}

struct DecodeDims {
    batch: usize,
    h_q: usize,
    h_kv: usize,
    d: usize,
    d_v: usize,
}

/// Shared input-contract validation for both decode variants.
#[allow(clippy::too_many_arguments)]
fn validate(
    q: &CpuTensor,
    k_cache: &CpuTensor,
    v_cache: &CpuTensor,
    out: &CpuTensor,
    pages: &PageIndex<'_>,
    acc: &CpuTensor,
    num_kv_splits: usize,
) -> Result<DecodeDims> {
    let [batch, h_q, d] = dims3(q)?;
    let [num_slots, h_kv, kc_d] = dims3(k_cache)?;
    let [vc_slots, vc_heads, d_v] = dims3(v_cache)?;

    if kc_d != d {
        return Err(Error::ShapeMismatch {
            expected: vec![num_slots, h_kv, d],
            got: k_cache.shape().to_vec(),
        });
    }
    if vc_slots != num_slots || vc_heads != h_kv {
        return Err(Error::ShapeMismatch {
            expected: vec![num_slots, h_kv, d_v],
            got: v_cache.shape().to_vec(),
        });
    }
    check_head_grouping(h_q, h_kv)?;
    common_float_dtype(&[q, k_cache, v_cache])?;
    check_out(out, &[batch, h_q, d_v])?;

    if num_kv_splits == 0 {
        return Err(Error::Other("num_kv_splits must be > 0".into()));
    }
    let acc_shape = [batch, h_q, num_kv_splits, d_v + 1];
    if acc.shape() != acc_shape {
        return Err(Error::ShapeMismatch {
            expected: acc_shape.to_vec(),
            got: acc.shape().to_vec(),
        });
    }
    if acc.dtype() != DType::F32 {
        return Err(Error::DtypeMismatch {
            expected: DType::F32.to_string(),
            got: acc.dtype().to_string(),
        });
    }

    if pages.num_seqs() != batch {
        return Err(Error::InvalidOffsetTable(format!(
            "kv_indptr covers {} sequences, batch is {batch}",
            pages.num_seqs()
        )));
    }
    for b in 0..batch {
        pages.require_non_empty(b)?;
        for &slot in pages.slots(b) {
            if slot as usize >= num_slots {
                return Err(Error::IndexOutOfRange {
                    index: slot as usize,
                    len: num_slots,
                });
            }
        }
    }

    Ok(DecodeDims {
        batch,
        h_q,
        h_kv,
        d,
        d_v,
    })
}

/// Stage 1 for one (sequence, head, split): chunk-local stable softmax
/// statistics, written as `[normalized partial output | lse]`.
#[allow(clippy::too_many_arguments)]
fn stage1_split(
    q_vec: &[f32],
    kf: &[f32],
    vf: &[f32],
    slots: &[i32],
    range: (usize, usize),
    kv_h: usize,
    h_kv: usize,
    d: usize,
    d_v: usize,
    scale: f32,
    row: &mut [f32],
) {
    let (start, end) = range;
    let mut dots = Vec::with_capacity(end - start);
    for pos in start..end {
        let k_off = (slots[pos] as usize * h_kv + kv_h) * d;
        dots.push(scale * simd::dot_f32(q_vec, &kf[k_off..k_off + d]));
    }

    let local_max = dots.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut e_sum = 0.0f32;
    let acc_v = &mut row[..d_v];
    acc_v.fill(0.0);
    for (idx, &dot) in dots.iter().enumerate() {
        let w = (dot - local_max).exp();
        e_sum += w;
        let v_off = (slots[start + idx] as usize * h_kv + kv_h) * d_v;
        simd::axpy_f32(acc_v, w, &vf[v_off..v_off + d_v]);
    }
    // e_sum >= exp(0) = 1: the chunk max always contributes.
    simd::vec_scale(acc_v, 1.0 / e_sum);
    row[d_v] = local_max + e_sum.ln();
}

/// Stage 2: merge the non-empty splits of each (sequence, head) with the
/// log-sum-exp combination rule.
fn reduce_splits(
    acc: &[f32],
    pages: &PageIndex<'_>,
    num_splits: usize,
    h_q: usize,
    d_v: usize,
    of: &mut [f32],
) {
    of.par_chunks_mut(d_v).enumerate().for_each(|(bh, out_row)| {
        let b = bh / h_q;
        let used = splits_used(pages.cached_len(b), num_splits);
        let rows = &acc[bh * num_splits * (d_v + 1)..];

        let mut global_max = f32::NEG_INFINITY;
        for s in 0..used {
            global_max = global_max.max(rows[s * (d_v + 1) + d_v]);
        }
        let mut e_sum = 0.0f32;
        for s in 0..used {
            let row = &rows[s * (d_v + 1)..(s + 1) * (d_v + 1)];
            let w = (row[d_v] - global_max).exp();
            e_sum += w;
            simd::axpy_f32(out_row, w, &row[..d_v]);
        }
        simd::vec_scale(out_row, 1.0 / e_sum);
    });
}

impl DecodeAttentionOps for CpuBackend {
    fn decode_attention_normal(
        q: &CpuTensor,
        k_cache: &CpuTensor,
        v_cache: &CpuTensor,
        out: &mut CpuTensor,
        pages: &PageIndex<'_>,
        acc: &mut CpuTensor,
        num_kv_splits: usize,
        scale: f32,
    ) -> Result<()> {
        let DecodeDims {
            batch,
            h_q,
            h_kv,
            d,
            d_v,
        } = validate(q, k_cache, v_cache, out, pages, acc, num_kv_splits)?;
        let gqa_ratio = h_q / h_kv;

        let qf = q.to_f32_vec();
        let kf = k_cache.to_f32_vec();
        let vf = v_cache.to_f32_vec();

        let acc_f = acc.as_f32_slice_mut();
        acc_f
            .par_chunks_mut(num_kv_splits * (d_v + 1))
            .enumerate()
            .for_each(|(bh, rows)| {
                let (b, h) = (bh / h_q, bh % h_q);
                let slots = pages.slots(b);
                let q_off = bh * d;
                let q_vec = &qf[q_off..q_off + d];
                for s in 0..num_kv_splits {
                    let range = split_range(slots.len(), num_kv_splits, s);
                    if range.0 >= range.1 {
                        continue;
                    }
                    let row = &mut rows[s * (d_v + 1)..(s + 1) * (d_v + 1)];
                    stage1_split(
                        q_vec,
                        &kf,
                        &vf,
                        slots,
                        range,
                        h / gqa_ratio,
                        h_kv,
                        d,
                        d_v,
                        scale,
                        row,
                    );
                }
            });

        let mut of = vec![0.0f32; batch * h_q * d_v];
        reduce_splits(acc_f, pages, num_kv_splits, h_q, d_v, &mut of);
        out.copy_from_f32(&of);
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn decode_attention_grouped(
        q: &CpuTensor,
        k_cache: &CpuTensor,
        v_cache: &CpuTensor,
        out: &mut CpuTensor,
        pages: &PageIndex<'_>,
        acc: &mut CpuTensor,
        num_kv_splits: usize,
        scale: f32,
    ) -> Result<()> {
        let DecodeDims {
            batch,
            h_q,
            h_kv,
            d,
            d_v,
            ..
        } = validate(q, k_cache, v_cache, out, pages, acc, num_kv_splits)?;
        let group = h_q / h_kv;

        let qf = q.to_f32_vec();
        let kf = k_cache.to_f32_vec();
        let vf = v_cache.to_f32_vec();

        // One parallel unit per (sequence, kv head); the group's query
        // heads share every K/V row load within it.
        let acc_f = acc.as_f32_slice_mut();
        acc_f
            .par_chunks_mut(group * num_kv_splits * (d_v + 1))
            .enumerate()
            .for_each(|(bg, rows)| {
                let (b, kv_h) = (bg / h_kv, bg % h_kv);
                let slots = pages.slots(b);

                for s in 0..num_kv_splits {
                    let (start, end) = split_range(slots.len(), num_kv_splits, s);
                    if start >= end {
                        continue;
                    }
                    let npos = end - start;

                    // Scores for all group members against the shared keys.
                    let mut dots = vec![0.0f32; group * npos];
                    for (idx, &slot) in slots[start..end].iter().enumerate() {
                        let k_off = (slot as usize * h_kv + kv_h) * d;
                        let k_row = &kf[k_off..k_off + d];
                        for g in 0..group {
                            let h = kv_h * group + g;
                            let q_off = (b * h_q + h) * d;
                            dots[g * npos + idx] =
                                scale * simd::dot_f32(&qf[q_off..q_off + d], k_row);
                        }
                    }

                    // Per-member chunk-local max, then exponentiate in place.
                    let mut local_max = vec![f32::NEG_INFINITY; group];
                    let mut e_sum = vec![0.0f32; group];
                    for g in 0..group {
                        let member = &mut dots[g * npos..(g + 1) * npos];
                        let m = member.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                        local_max[g] = m;
                        for w in member.iter_mut() {
                            *w = (*w - m).exp();
                            e_sum[g] += *w;
                        }
                    }

                    // Weighted-value accumulation with shared V row loads.
                    let mut acc_v = vec![0.0f32; group * d_v];
                    for (idx, &slot) in slots[start..end].iter().enumerate() {
                        let v_off = (slot as usize * h_kv + kv_h) * d_v;
                        let v_row = &vf[v_off..v_off + d_v];
                        for g in 0..group {
                            simd::axpy_f32(
                                &mut acc_v[g * d_v..(g + 1) * d_v],
                                dots[g * npos + idx],
                                v_row,
                            );
                        }
                    }

                    for g in 0..group {
                        let member = &mut acc_v[g * d_v..(g + 1) * d_v];
                        simd::vec_scale(member, 1.0 / e_sum[g]);
                        let row = &mut rows
                            [(g * num_kv_splits + s) * (d_v + 1)..(g * num_kv_splits + s + 1) * (d_v + 1)];
                        row[..d_v].copy_from_slice(member);
                        row[d_v] = local_max[g] + e_sum[g].ln();
                    }
                }
            });

        let mut of = vec![0.0f32; batch * h_q * d_v];
        reduce_splits(acc_f, pages, num_kv_splits, h_q, d_v, &mut of);
        out.copy_from_f32(&of);
        Ok(())
    }
}
