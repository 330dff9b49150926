//! ReferenceAttentionOps implementation: a serial, dense oracle.
//!
//! Gathers each sequence's full logical K/V range by direct cache indexing
//! (no paging) and computes causally-masked attention for the extend
//! queries the obvious way. Deliberately unoptimized; kept simple enough
//! to be checked by eye.

use crucible::backend::ReferenceAttentionOps;
use crucible::tensor::Tensor;
use crucible::{Error, Result};

use crate::ops::{check_head_grouping, check_out, common_float_dtype, dims3, softmax_inplace};
use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl ReferenceAttentionOps for CpuBackend {
    #[allow(clippy::too_many_lines)]
    fn reference_attention(
        q_extend: &CpuTensor,
        out: &mut CpuTensor,
        k_cache: &CpuTensor,
        v_cache: &CpuTensor,
        req_idx: &[i32],
        start_loc: &[i32],
        seq_len: &[i32],
        prefix_len: &[i32],
        _max_len: usize,
    ) -> Result<()> {
        let [total_extend, h_q, d] = dims3(q_extend)?;
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
        common_float_dtype(&[q_extend, k_cache, v_cache])?;
        check_out(out, &[total_extend, h_q, d_v])?;

        // Resolve and bounds-check every sequence before computing anything.
        struct Seq {
            base: usize,
            len: usize,
            prefix: usize,
        }
        let mut seqs = Vec::with_capacity(req_idx.len());
        let mut extend_total = 0usize;
        for (i, &r) in req_idx.iter().enumerate() {
            let r = usize::try_from(r)
                .map_err(|_| Error::InvalidOffsetTable(format!("req_idx[{i}] is negative")))?;
            if r >= start_loc.len() || r >= seq_len.len() || r >= prefix_len.len() {
                return Err(Error::IndexOutOfRange {
                    index: r,
                    len: start_loc.len().min(seq_len.len()).min(prefix_len.len()),
                });
            }
            if start_loc[r] < 0 || seq_len[r] < 0 || prefix_len[r] < 0 {
                return Err(Error::InvalidOffsetTable(format!(
                    "negative entry for request {r}"
                )));
            }
            let (base, len, prefix) = (
                start_loc[r] as usize,
                seq_len[r] as usize,
                prefix_len[r] as usize,
            );
            if prefix > len {
                return Err(Error::InvalidOffsetTable(format!(
                    "prefix_len[{r}] = {prefix} exceeds seq_len[{r}] = {len}"
                )));
            }
            if base + len > num_slots {
                return Err(Error::IndexOutOfRange {
                    index: base + len,
                    len: num_slots,
                });
            }
            extend_total += len - prefix;
            seqs.push(Seq { base, len, prefix });
        }
        if extend_total != total_extend {
            return Err(Error::ShapeMismatch {
                expected: vec![extend_total, h_q, d],
                got: q_extend.shape().to_vec(),
            });
        }

        let qf = q_extend.to_f32_vec();
        let kf = k_cache.to_f32_vec();
        let vf = v_cache.to_f32_vec();
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (d as f32).sqrt();
        let gqa_ratio = h_q / h_kv;

        let mut of = vec![0.0f32; total_extend * h_q * d_v];
        let mut q_row = 0usize;
        for seq in &seqs {
            let extend = seq.len - seq.prefix;
            for j in 0..extend {
                // Query j sits at logical position prefix + j; it attends to
                // every cached token at or before it.
                let visible = seq.prefix + j + 1;
                for h in 0..h_q {
                    let kv_h = h / gqa_ratio;
                    let q_off = (q_row * h_q + h) * d;
                    let q_vec = &qf[q_off..q_off + d];

                    let mut scores = Vec::with_capacity(visible);
                    for pos in 0..visible {
                        let k_off = ((seq.base + pos) * h_kv + kv_h) * d;
                        scores.push(scale * simd_free_dot(q_vec, &kf[k_off..k_off + d]));
                    }

                    let sum = softmax_inplace(&mut scores);
                    if sum <= 0.0 {
                        continue;
                    }
                    let acc = &mut of[(q_row * h_q + h) * d_v..(q_row * h_q + h + 1) * d_v];
                    for (pos, &score) in scores.iter().enumerate() {
                        let w = score / sum;
                        let v_off = ((seq.base + pos) * h_kv + kv_h) * d_v;
                        for (a, &x) in acc.iter_mut().zip(&vf[v_off..v_off + d_v]) {
                            *a += w * x;
                        }
                    }
                }
                q_row += 1;
            }
        }

        out.copy_from_f32(&of);
        Ok(())
    }
}

/// Plain scalar dot product. The oracle stays independent of the SIMD
/// kernels it is used to check.
fn simd_free_dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
