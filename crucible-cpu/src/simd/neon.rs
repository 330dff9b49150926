//! NEON SIMD kernels for AArch64.

#[cfg(target_arch = "aarch64")]
use std::arch::aarch64::{
    vaddvq_f32, vdupq_n_f32, vfmaq_f32, vfmaq_n_f32, vld1q_f32, vmulq_f32, vst1q_f32,
};

pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    // SAFETY: NEON is baseline on AArch64, always available.
    unsafe { dot_f32_inner(a, b) }
}

#[inline]
unsafe fn dot_f32_inner(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len();
    let chunks = n / 4;
    let remainder = n % 4;

    let mut acc = vdupq_n_f32(0.0);
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    for i in 0..chunks {
        let va = vld1q_f32(a_ptr.add(i * 4));
        let vb = vld1q_f32(b_ptr.add(i * 4));
        acc = vfmaq_f32(acc, va, vb);
    }

    let mut sum = vaddvq_f32(acc);
    let tail = chunks * 4;
    for i in 0..remainder {
        sum = a[tail + i].mul_add(b[tail + i], sum);
    }
    sum
}

pub fn axpy_f32(acc: &mut [f32], w: f32, v: &[f32]) {
    unsafe {
        axpy_f32_inner(acc, w, v);
    }
}

#[inline]
unsafe fn axpy_f32_inner(acc: &mut [f32], w: f32, v: &[f32]) {
    let n = acc.len();
    let chunks = n / 4;
    let remainder = n % 4;

    for i in 0..chunks {
        let va = vld1q_f32(acc.as_ptr().add(i * 4));
        let vv = vld1q_f32(v.as_ptr().add(i * 4));
        vst1q_f32(acc.as_mut_ptr().add(i * 4), vfmaq_n_f32(va, vv, w));
    }

    let tail = chunks * 4;
    for i in 0..remainder {
        acc[tail + i] = w.mul_add(v[tail + i], acc[tail + i]);
    }
}

pub fn vec_scale(a: &mut [f32], scale: f32) {
    unsafe {
        vec_scale_inner(a, scale);
    }
}

#[inline]
unsafe fn vec_scale_inner(a: &mut [f32], scale: f32) {
    let n = a.len();
    let chunks = n / 4;
    let remainder = n % 4;
    let vs = vdupq_n_f32(scale);

    for i in 0..chunks {
        let va = vld1q_f32(a.as_ptr().add(i * 4));
        vst1q_f32(a.as_mut_ptr().add(i * 4), vmulq_f32(va, vs));
    }

    let tail = chunks * 4;
    for i in 0..remainder {
        a[tail + i] *= scale;
    }
}
