//! ExtendAttentionOps implementation: attention for newly computed tokens
//! against their sequence's cached prefix (resolved through the page
//! index) plus the new tokens themselves, causally.
//!
//! An optional mask intersects the causal+prefix attendance pattern. Extend
//! token rows are parallelized with Rayon.

use crucible::backend::ExtendAttentionOps;
use crucible::paging::{check_offsets, MaskSpec, PageIndex};
use crucible::tensor::Tensor;
use crucible::{Error, Result};
use rayon::prelude::*;

use crate::ops::{check_head_grouping, check_out, common_float_dtype, dims3, softmax_inplace};
use crate::simd;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl ExtendAttentionOps for CpuBackend {
    #[allow(clippy::too_many_lines)]
    fn extend_attention(
        q_extend: &CpuTensor,
        k_extend: &CpuTensor,
        v_extend: &CpuTensor,
        out: &mut CpuTensor,
        k_cache: &CpuTensor,
        v_cache: &CpuTensor,
        qo_indptr: &[i32],
        pages: &PageIndex<'_>,
        mask: Option<&MaskSpec<'_>>,
        _max_extend_len: usize,
    ) -> Result<()> {
        let [total_extend, h_q, d] = dims3(q_extend)?;
        let [ke_total, h_kv, ke_d] = dims3(k_extend)?;
        let [ve_total, ve_heads, d_v] = dims3(v_extend)?;
        let [num_slots, kc_heads, kc_d] = dims3(k_cache)?;
        let [vc_slots, vc_heads, vc_d] = dims3(v_cache)?;

        if ke_total != total_extend || ke_d != d {
            return Err(Error::ShapeMismatch {
                expected: vec![total_extend, h_kv, d],
                got: k_extend.shape().to_vec(),
            });
        }
        if ve_total != total_extend || ve_heads != h_kv {
            return Err(Error::ShapeMismatch {
                expected: vec![total_extend, h_kv, d_v],
                got: v_extend.shape().to_vec(),
            });
        }
        if kc_heads != h_kv || kc_d != d {
            return Err(Error::ShapeMismatch {
                expected: vec![num_slots, h_kv, d],
                got: k_cache.shape().to_vec(),
            });
        }
        if vc_slots != num_slots || vc_heads != h_kv || vc_d != d_v {
            return Err(Error::ShapeMismatch {
                expected: vec![num_slots, h_kv, d_v],
                got: v_cache.shape().to_vec(),
            });
        }
        check_head_grouping(h_q, h_kv)?;
        common_float_dtype(&[q_extend, k_extend, v_extend, k_cache, v_cache])?;
        check_out(out, &[total_extend, h_q, d_v])?;

        check_offsets("qo_indptr", qo_indptr, total_extend)?;
        let batch = qo_indptr.len() - 1;
        if pages.num_seqs() != batch {
            return Err(Error::InvalidOffsetTable(format!(
                "kv_indptr covers {} sequences, qo_indptr covers {batch}",
                pages.num_seqs()
            )));
        }

        // Everything below must be resolvable before any output is written.
        for i in 0..batch {
            for &slot in pages.slots(i) {
                if slot as usize >= num_slots {
                    return Err(Error::IndexOutOfRange {
                        index: slot as usize,
                        len: num_slots,
                    });
                }
            }
        }

        // Per-token (sequence, local query position) and pre-resolved mask
        // rows. Mask rows span prefix keys first, then extend keys.
        let mut rows: Vec<(usize, usize)> = Vec::with_capacity(total_extend);
        for i in 0..batch {
            let extend_len = (qo_indptr[i + 1] - qo_indptr[i]) as usize;
            for qi in 0..extend_len {
                rows.push((i, qi));
            }
        }
        let mask_rows: Option<Vec<&[bool]>> = match mask {
            None => None,
            Some(spec) => {
                if spec.num_seqs() != batch {
                    return Err(Error::InvalidOffsetTable(format!(
                        "mask_offsets covers {} sequences, qo_indptr covers {batch}",
                        spec.num_seqs()
                    )));
                }
                let mut resolved = Vec::with_capacity(total_extend);
                for i in 0..batch {
                    let extend_len = (qo_indptr[i + 1] - qo_indptr[i]) as usize;
                    let row_len = pages.cached_len(i) + extend_len;
                    let need = extend_len * row_len;
                    if spec.block_len(i) != need {
                        return Err(Error::ShapeMismatch {
                            expected: vec![need],
                            got: vec![spec.block_len(i)],
                        });
                    }
                    for qi in 0..extend_len {
                        resolved.push(spec.row(i, qi, row_len)?);
                    }
                }
                Some(resolved)
            }
        };

        let qf = q_extend.to_f32_vec();
        let kef = k_extend.to_f32_vec();
        let vef = v_extend.to_f32_vec();
        let kcf = k_cache.to_f32_vec();
        let vcf = v_cache.to_f32_vec();
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (d as f32).sqrt();
        let gqa_ratio = h_q / h_kv;

        let mut of = vec![0.0f32; total_extend * h_q * d_v];
        of.par_chunks_mut(h_q * d_v)
            .enumerate()
            .for_each(|(t, out_row)| {
                let (i, qi) = rows[t];
                let slots = pages.slots(i);
                let prefix_len = slots.len();
                let extend_base = qo_indptr[i] as usize;
                let mask_row = mask_rows.as_ref().map(|m| m[t]);
                // Causal: this query sees the whole prefix plus extend
                // tokens up to and including itself.
                let visible = prefix_len + qi + 1;

                for h in 0..h_q {
                    let kv_h = h / gqa_ratio;
                    let q_off = (t * h_q + h) * d;
                    let q_vec = &qf[q_off..q_off + d];

                    let mut scores = Vec::with_capacity(visible);
                    for j in 0..prefix_len {
                        if mask_row.is_some_and(|m| !m[j]) {
                            scores.push(f32::NEG_INFINITY);
                            continue;
                        }
                        let k_off = (slots[j] as usize * h_kv + kv_h) * d;
                        scores.push(scale * simd::dot_f32(q_vec, &kcf[k_off..k_off + d]));
                    }
                    for j in 0..=qi {
                        if mask_row.is_some_and(|m| !m[prefix_len + j]) {
                            scores.push(f32::NEG_INFINITY);
                            continue;
                        }
                        let k_off = ((extend_base + j) * h_kv + kv_h) * d;
                        scores.push(scale * simd::dot_f32(q_vec, &kef[k_off..k_off + d]));
                    }

                    let sum = softmax_inplace(&mut scores);
                    if sum <= 0.0 {
                        continue;
                    }
                    let inv = 1.0 / sum;
                    let acc = &mut out_row[h * d_v..(h + 1) * d_v];
                    for (j, &score) in scores.iter().enumerate() {
                        if score <= 0.0 {
                            continue;
                        }
                        let v_off = if j < prefix_len {
                            (slots[j] as usize * h_kv + kv_h) * d_v
                        } else {
                            ((extend_base + j - prefix_len) * h_kv + kv_h) * d_v
                        };
                        let src = if j < prefix_len { &vcf } else { &vef };
                        simd::axpy_f32(acc, score * inv, &src[v_off..v_off + d_v]);
                    }
                }
            });

        out.copy_from_f32(&of);
        Ok(())
    }
}
