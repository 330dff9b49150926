//! PrefillAttentionOps implementation: dense causal (or non-causal)
//! attention over a batch of fresh sequences with no pre-existing cache.
//!
//! Query rows are parallelized with Rayon; each row attends only within
//! its own sequence's token window, so no cross-sequence state exists.

use crucible::backend::PrefillAttentionOps;
use crucible::tensor::Tensor;
use crucible::{Error, Result};
use rayon::prelude::*;

use crate::ops::{check_head_grouping, check_out, common_float_dtype, dims3, softmax_inplace};
use crate::simd;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl PrefillAttentionOps for CpuBackend {
    fn prefill_attention(
        q: &CpuTensor,
        k: &CpuTensor,
        v: &CpuTensor,
        out: &mut CpuTensor,
        start_loc: &[i32],
        seq_len: &[i32],
        _max_seq_len: usize,
        is_causal: bool,
    ) -> Result<()> {
        let [total, h_q, d] = dims3(q)?;
        let [k_total, h_kv, k_d] = dims3(k)?;
        let [v_total, v_heads, d_v] = dims3(v)?;

        if k_total != total || k_d != d {
            return Err(Error::ShapeMismatch {
                expected: vec![total, h_kv, d],
                got: k.shape().to_vec(),
            });
        }
        if v_total != total || v_heads != h_kv {
            return Err(Error::ShapeMismatch {
                expected: vec![total, h_kv, d_v],
                got: v.shape().to_vec(),
            });
        }
        check_head_grouping(h_q, h_kv)?;
        common_float_dtype(&[q, k, v])?;
        check_out(out, &[total, h_q, d_v])?;

        if start_loc.len() != seq_len.len() {
            return Err(Error::InvalidOffsetTable(format!(
                "start_loc has {} entries, seq_len has {}",
                start_loc.len(),
                seq_len.len()
            )));
        }

        // Resolve every token row to its sequence window up front, so the
        // whole call fails before any write if a range is out of bounds.
        let mut rows: Vec<Option<(usize, usize, usize)>> = vec![None; total];
        for (&start, &len) in start_loc.iter().zip(seq_len) {
            if start < 0 || len < 0 {
                return Err(Error::InvalidOffsetTable(format!(
                    "negative sequence range ({start}, {len})"
                )));
            }
            let (start, len) = (start as usize, len as usize);
            if start + len > total {
                return Err(Error::IndexOutOfRange {
                    index: start + len,
                    len: total,
                });
            }
            for pos in 0..len {
                rows[start + pos] = Some((start, pos, len));
            }
        }

        let qf = q.to_f32_vec();
        let kf = k.to_f32_vec();
        let vf = v.to_f32_vec();
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (d as f32).sqrt();
        let gqa_ratio = h_q / h_kv;

        let mut of = vec![0.0f32; total * h_q * d_v];
        of.par_chunks_mut(h_q * d_v)
            .enumerate()
            .for_each(|(t, out_row)| {
                let Some((base, pos, len)) = rows[t] else {
                    return;
                };
                let window = if is_causal { pos + 1 } else { len };

                for h in 0..h_q {
                    let kv_h = h / gqa_ratio;
                    let q_off = (t * h_q + h) * d;
                    let q_vec = &qf[q_off..q_off + d];

                    let mut scores = Vec::with_capacity(window);
                    for kv_pos in 0..window {
                        let k_off = ((base + kv_pos) * h_kv + kv_h) * d;
                        scores.push(scale * simd::dot_f32(q_vec, &kf[k_off..k_off + d]));
                    }

                    let sum = softmax_inplace(&mut scores);
                    if sum <= 0.0 {
                        continue;
                    }
                    let inv = 1.0 / sum;
                    let acc = &mut out_row[h * d_v..(h + 1) * d_v];
                    for (kv_pos, &score) in scores.iter().enumerate() {
                        if score > 0.0 {
                            let v_off = ((base + kv_pos) * h_kv + kv_h) * d_v;
                            simd::axpy_f32(acc, score * inv, &vf[v_off..v_off + d_v]);
                        }
                    }
                }
            });

        out.copy_from_f32(&of);
        Ok(())
    }
}
