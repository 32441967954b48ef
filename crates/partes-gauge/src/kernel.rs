// SPDX-License-Identifier: Apache-2.0

//! Gauge kernels: small, strictly-linear-in-`n` units of compute used to
//! translate a wall-clock duration into an integer "amount of work".
//!
//! Every variant avoids allocation and syscalls in `run`, and routes its
//! accumulator through [`std::hint::black_box`] so the optimiser cannot
//! prove the loop is dead and elide it -- the userspace equivalent of a
//! hand-written volatile counter.

use std::hint::black_box;

/// A unit of repeatable, linear-time work.
///
/// `run(n)` must take time linear in `n` and must not allocate or make
/// syscalls; `init`/`cleanup` bracket the measured region and may do
/// whatever setup a concrete kernel needs (e.g. checking CPU feature
/// support).
pub trait Gauge: Send + Sync {
    /// One-time setup before any `run` call.
    fn init(&mut self) {}

    /// Perform `n` units of work. Must be linear in `n`.
    fn run(&self, n: i64);

    /// One-time teardown after the last `run` call.
    fn cleanup(&mut self) {}
}

/// Scalar integer subtraction loop: `n` decrements of a black-boxed
/// accumulator.
#[derive(Default)]
pub struct SubScalar;

impl Gauge for SubScalar {
    fn run(&self, n: i64) {
        let mut acc: i64 = black_box(n);
        for _ in 0..n {
            acc = black_box(acc.wrapping_sub(1));
        }
        black_box(acc);
    }
}

/// Scalar fused-multiply-add loop over `f64`.
#[derive(Default)]
pub struct FmaScalar;

impl Gauge for FmaScalar {
    fn run(&self, n: i64) {
        let mut acc: f64 = black_box(1.0);
        let m = black_box(1.000_000_1_f64);
        let a = black_box(1e-9_f64);
        for _ in 0..n {
            acc = acc.mul_add(m, a);
            acc = black_box(acc);
        }
        black_box(acc);
    }
}

/// AVX2+FMA vectorised fused-multiply-add loop, 4 lanes of `f64` per step.
///
/// Falls back to [`FmaScalar`]'s behaviour at construction time if the
/// running CPU lacks `avx2`/`fma`; callers should prefer
/// [`FmaAvx2::available`] over assuming support.
#[derive(Default)]
pub struct FmaAvx2;

impl FmaAvx2 {
    /// True if the running CPU supports the instructions this kernel needs.
    pub fn available() -> bool {
        is_x86_feature_detected_avx2_fma()
    }
}

impl Gauge for FmaAvx2 {
    fn run(&self, n: i64) {
        if Self::available() {
            // Safety: `available()` confirmed avx2+fma support above.
            unsafe { avx2::run(n) }
        } else {
            FmaScalar.run(n);
        }
    }
}

/// AVX-512F vectorised fused-multiply-add loop, 8 lanes of `f64` per step.
///
/// Falls back to [`FmaAvx2`]'s behaviour (itself falling back to scalar) if
/// `avx512f` is unavailable.
#[derive(Default)]
pub struct FmaAvx512;

impl FmaAvx512 {
    /// True if the running CPU supports the instructions this kernel needs.
    pub fn available() -> bool {
        is_x86_feature_detected_avx512f()
    }
}

impl Gauge for FmaAvx512 {
    fn run(&self, n: i64) {
        if Self::available() {
            // Safety: `available()` confirmed avx512f support above.
            unsafe { avx512::run(n) }
        } else {
            FmaAvx2.run(n);
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn is_x86_feature_detected_avx2_fma() -> bool {
    std::is_x86_feature_detected!("avx2") && std::is_x86_feature_detected!("fma")
}

#[cfg(not(target_arch = "x86_64"))]
fn is_x86_feature_detected_avx2_fma() -> bool {
    false
}

#[cfg(target_arch = "x86_64")]
fn is_x86_feature_detected_avx512f() -> bool {
    std::is_x86_feature_detected!("avx512f")
}

#[cfg(not(target_arch = "x86_64"))]
fn is_x86_feature_detected_avx512f() -> bool {
    false
}

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use std::arch::x86_64::*;
    use std::hint::black_box;

    #[target_feature(enable = "avx2,fma")]
    pub(super) unsafe fn run(n: i64) {
        let m = _mm256_set1_pd(1.000_000_1);
        let a = _mm256_set1_pd(1e-9);
        let mut acc = _mm256_set1_pd(1.0);
        for _ in 0..n {
            acc = _mm256_fmadd_pd(acc, m, a);
            acc = black_box(acc);
        }
        let mut out = [0.0_f64; 4];
        _mm256_storeu_pd(out.as_mut_ptr(), acc);
        black_box(out);
    }
}

#[cfg(target_arch = "x86_64")]
mod avx512 {
    use std::arch::x86_64::*;
    use std::hint::black_box;

    #[target_feature(enable = "avx512f")]
    pub(super) unsafe fn run(n: i64) {
        let m = _mm512_set1_pd(1.000_000_1);
        let a = _mm512_set1_pd(1e-9);
        let mut acc = _mm512_set1_pd(1.0);
        for _ in 0..n {
            acc = _mm512_fmadd_pd(acc, m, a);
            acc = black_box(acc);
        }
        let mut out = [0.0_f64; 8];
        _mm512_storeu_pd(out.as_mut_ptr(), acc);
        black_box(out);
    }
}
