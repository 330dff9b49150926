//! SIMD dispatch layer.
//!
//! Provides architecture-specific kernels for the attention inner loops:
//! AVX2+FMA on x86-64, NEON on AArch64. No scalar fallback — unsupported
//! platforms are a compile error.

#[cfg(target_arch = "x86_64")]
mod avx2;
#[cfg(target_arch = "aarch64")]
mod neon;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("crucible-cpu requires x86-64 (AVX2+FMA) or AArch64 (NEON)");

/// Check that the current CPU supports the required SIMD features.
///
/// On AArch64 this always succeeds (NEON is baseline).
/// On x86-64 this checks for AVX2 + FMA at runtime.
///
/// # Errors
/// Returns an error if the CPU lacks required SIMD support.
pub fn check_cpu_support() -> crucible::Result<()> {
    #[cfg(target_arch = "x86_64")]
    {
        if !is_x86_feature_detected!("avx2") || !is_x86_feature_detected!("fma") {
            return Err(crucible::Error::Other(
                "CPU backend requires AVX2 + FMA support".into(),
            ));
        }
    }
    Ok(())
}

// ---- Dispatch functions ----

/// Dot product of two f32 slices. The attention score inner loop.
#[inline]
#[must_use]
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    #[cfg(target_arch = "x86_64")]
    {
        avx2::dot_f32(a, b)
    }
    #[cfg(target_arch = "aarch64")]
    {
        neon::dot_f32(a, b)
    }
}

/// Weighted accumulate: `acc[i] += w * v[i]`. The weighted-value inner loop.
#[inline]
pub fn axpy_f32(acc: &mut [f32], w: f32, v: &[f32]) {
    debug_assert_eq!(acc.len(), v.len());
    #[cfg(target_arch = "x86_64")]
    {
        avx2::axpy_f32(acc, w, v);
    }
    #[cfg(target_arch = "aarch64")]
    {
        neon::axpy_f32(acc, w, v);
    }
}

/// In-place scalar scaling: `a[i] *= scale`. Used for the final softmax
/// normalization of an accumulated value row.
#[inline]
pub fn vec_scale(a: &mut [f32], scale: f32) {
    #[cfg(target_arch = "x86_64")]
    {
        avx2::vec_scale(a, scale);
    }
    #[cfg(target_arch = "aarch64")]
    {
        neon::vec_scale(a, scale);
    }
}
