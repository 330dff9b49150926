//! Paged KV addressing: CSR offset tables mapping logical per-sequence
//! token positions to physical slots in a shared KV buffer.
//!
//! Both structures are validated views: construction checks the CSR
//! invariants and buffer bounds once, so kernels can resolve addresses
//! without re-checking on every access. Neither owns data and neither
//! mutates anything.

#![allow(clippy::must_use_candidate)]

use crate::error::{Error, Result};

/// Validate an i32 CSR offset table: `ptr[0] == 0`, monotonic
/// non-decreasing, `ptr[last]` equal to the total element count.
///
/// Kernels use this for offset tables that have no paired index array
/// (e.g. `qo_indptr`).
///
/// # Errors
/// `InvalidOffsetTable` naming the failed invariant.
pub fn check_offsets(name: &str, ptr: &[i32], total: usize) -> Result<()> {
    let ptr64: Vec<i64> = ptr.iter().map(|&p| i64::from(p)).collect();
    check_offset_table(name, &ptr64, total)
}

/// Validate a CSR offset table: `ptr[0] == 0`, monotonic non-decreasing,
/// `ptr[last]` equal to the total element count.
fn check_offset_table(name: &str, ptr: &[i64], total: usize) -> Result<()> {
    if ptr.is_empty() {
        return Err(Error::InvalidOffsetTable(format!("{name} is empty")));
    }
    if ptr[0] != 0 {
        return Err(Error::InvalidOffsetTable(format!(
            "{name}[0] = {}, expected 0",
            ptr[0]
        )));
    }
    for w in ptr.windows(2) {
        if w[1] < w[0] {
            return Err(Error::InvalidOffsetTable(format!(
                "{name} is not monotonic non-decreasing ({} -> {})",
                w[0], w[1]
            )));
        }
    }
    let last = ptr[ptr.len() - 1];
    if last as usize != total {
        return Err(Error::InvalidOffsetTable(format!(
            "{name}[{}] = {last}, expected total element count {total}",
            ptr.len() - 1
        )));
    }
    Ok(())
}

/// CSR-style index mapping each sequence's cached-token range to physical
/// slot positions in the shared KV buffer.
///
/// `kv_indices[kv_indptr[i]..kv_indptr[i+1]]` are exactly sequence `i`'s
/// cached slot ids, in logical order. The KV buffer itself lives elsewhere
/// (owned by the serving system); this is pure lookup.
#[derive(Debug, Clone, Copy)]
pub struct PageIndex<'a> {
    indptr: &'a [i32],
    indices: &'a [i32],
}

impl<'a> PageIndex<'a> {
    /// Build a validated page index over `kv_indptr` (length B+1) and
    /// `kv_indices`. `num_slots` is the number of physical slots in the KV
    /// buffer; every entry of `kv_indices` must address a slot below it.
    ///
    /// # Errors
    /// `InvalidOffsetTable` if the CSR invariants fail, `IndexOutOfRange`
    /// if any slot id exceeds the buffer.
    pub fn new(indptr: &'a [i32], indices: &'a [i32], num_slots: usize) -> Result<Self> {
        let ptr64: Vec<i64> = indptr.iter().map(|&p| i64::from(p)).collect();
        check_offset_table("kv_indptr", &ptr64, indices.len())?;
        for &slot in indices {
            if slot < 0 || slot as usize >= num_slots {
                return Err(Error::IndexOutOfRange {
                    index: slot as usize,
                    len: num_slots,
                });
            }
        }
        Ok(Self { indptr, indices })
    }

    /// Number of sequences addressed by this index.
    pub fn num_seqs(&self) -> usize {
        self.indptr.len() - 1
    }

    /// Number of cached tokens for sequence `i`.
    ///
    /// # Panics
    /// Panics if `i >= num_seqs()`.
    pub fn cached_len(&self, i: usize) -> usize {
        (self.indptr[i + 1] - self.indptr[i]) as usize
    }

    /// Physical slot ids for sequence `i`'s cached tokens, in logical order.
    ///
    /// # Panics
    /// Panics if `i >= num_seqs()`.
    pub fn slots(&self, i: usize) -> &'a [i32] {
        &self.indices[self.indptr[i] as usize..self.indptr[i + 1] as usize]
    }

    /// Reject sequences with no cached tokens.
    ///
    /// Decode attends to the full cached history, so an empty range has no
    /// defined result; callers must not reach the kernel with one.
    ///
    /// # Errors
    /// `EmptyRange` if sequence `i` has zero cached tokens.
    pub fn require_non_empty(&self, i: usize) -> Result<()> {
        if self.cached_len(i) == 0 {
            return Err(Error::EmptyRange { seq: i });
        }
        Ok(())
    }
}

/// Optional ragged boolean attendance mask, one block per sequence.
///
/// The block for sequence `i` is `mask[offsets[i]..offsets[i+1]]`, row-major
/// over (query-position, key-position) pairs with key columns spanning the
/// cached prefix first, then the extend tokens. Its length must be
/// `extend_len * (prefix_len + extend_len)`; the consumer checks that, since
/// only it knows the per-sequence lengths.
#[derive(Debug, Clone, Copy)]
pub struct MaskSpec<'a> {
    mask: &'a [bool],
    offsets: &'a [i64],
}

impl<'a> MaskSpec<'a> {
    /// Build a validated mask over `mask` and `mask_offsets` (length B+1).
    ///
    /// # Errors
    /// `InvalidOffsetTable` if the CSR invariants fail.
    pub fn new(mask: &'a [bool], offsets: &'a [i64]) -> Result<Self> {
        check_offset_table("mask_offsets", offsets, mask.len())?;
        Ok(Self { mask, offsets })
    }

    /// Number of sequences covered by the mask.
    pub fn num_seqs(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Length of sequence `i`'s mask block.
    pub fn block_len(&self, i: usize) -> usize {
        (self.offsets[i + 1] - self.offsets[i]) as usize
    }

    /// The mask row for query position `qi` of sequence `i`, `row_len`
    /// booleans wide (prefix keys first, then extend keys).
    ///
    /// # Errors
    /// `IndexOutOfRange` if the row extends past sequence `i`'s block.
    pub fn row(&self, i: usize, qi: usize, row_len: usize) -> Result<&'a [bool]> {
        let base = self.offsets[i] as usize;
        let start = base + qi * row_len;
        let end = start + row_len;
        if end > self.offsets[i + 1] as usize {
            return Err(Error::IndexOutOfRange {
                index: end,
                len: self.offsets[i + 1] as usize,
            });
        }
        Ok(&self.mask[start..end])
    }
}
