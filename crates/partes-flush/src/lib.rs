// SPDX-License-Identifier: Apache-2.0

//! Flush-kernel family: memory-traffic kernels run immediately before and
//! after a timed gauge block, plus the key-verification protocol that
//! checks they actually executed the intended arithmetic.
//!
//! Each variant is a value type that owns its working arrays and key
//! accumulator outright -- no slot-id parameter, no global table. The
//! measurement driver holds one instance per call site (`TA_FRONT`,
//! `TA_REAR`, `TB_FRONT`, `TB_REAR`), so four kernels of the same variant
//! coexist as four independent values rather than four entries in a
//! shared map.

use partes_error::{Error, Result};

/// Fixed fill value used to seed the `b` (and, where present, `c`) working
/// array. Arbitrary but must be nonzero so every variant's `key_target`
/// closed form is nontrivial.
const FILL_B: f64 = 2.0;
const FILL_C: f64 = 3.0;
const SCALE_K: f64 = 1.000_001;
const TRIAD_K: f64 = 2.0;
const POW_P: f64 = 2.0;

const BYTES_PER_ELEMENT_COPY: usize = 16;
const BYTES_PER_ELEMENT_SCALE: usize = 16;
const BYTES_PER_ELEMENT_ADD: usize = 24;
const BYTES_PER_ELEMENT_TRIAD: usize = 24;
const BYTES_PER_ELEMENT_POW: usize = 16;
const BYTES_PER_ELEMENT_DGEMM: usize = 24;
const BYTES_PER_ELEMENT_BROADCAST: usize = 8;

const KEY_TOLERANCE: f64 = 1e-6;

/// A memory-traffic kernel bracketing the timed gauge region.
///
/// `init` allocates the working set for the requested size and returns the
/// actual allocated size in KiB (which may round down from the request).
/// `run` performs one pass of the kernel's arithmetic; `update_key` folds
/// the pass's output into the running key accumulator and clears the
/// output array; `check_key` compares the accumulated key against the
/// analytically derived target after `ntests` passes.
pub trait FlushKernel: Send + Sync {
    /// Allocate working arrays sized from `flush_kib`. Returns the actual
    /// allocated size in KiB, which may be smaller than requested.
    fn init(&mut self, flush_kib: usize) -> Result<usize>;

    /// Run one pass of the kernel's arithmetic.
    fn run(&mut self);

    /// Fold this pass's output into the key accumulator, then zero it.
    fn update_key(&mut self);

    /// Compare the accumulated key against the analytical target after
    /// `ntests` passes. Returns the relative gap; the error variant
    /// carries the same value for diagnostics and is treated as
    /// non-fatal by the driver (a [`Error::KeyCheckFailed`] is a
    /// diagnostic, not a reason to abort).
    fn check_key(&mut self, ntests: u64) -> Result<f64>;

    /// Release working arrays. Most variants can rely on `Drop`; kernels
    /// with extra bookkeeping (slot name, external handles) override it.
    fn cleanup(&mut self) {}
}

fn elements_for(flush_kib: usize, bytes_per_element: usize) -> usize {
    (flush_kib * 1024) / bytes_per_element
}

fn finish_check(name: &str, key: f64, key_target: f64) -> Result<f64> {
    let relative_gap = if key_target == 0.0 {
        key.abs()
    } else {
        (key - key_target).abs() / key_target.abs()
    };
    if relative_gap > KEY_TOLERANCE {
        return Err(Error::KeyCheckFailed {
            slot: name.to_string(),
            relative_gap,
        });
    }
    Ok(relative_gap)
}

/// No-op flush kernel: exercises no memory traffic. `check_key` is
/// trivially satisfied; key verification is only meaningful for variants
/// that actually move data.
#[derive(Default)]
pub struct NoneKernel;

impl FlushKernel for NoneKernel {
    fn init(&mut self, _flush_kib: usize) -> Result<usize> {
        Ok(0)
    }
    fn run(&mut self) {}
    fn update_key(&mut self) {}
    fn check_key(&mut self, _ntests: u64) -> Result<f64> {
        Ok(0.0)
    }
}

/// `a[i] = b[i]`.
pub struct CopyKernel {
    name: String,
    a: Vec<f64>,
    b: Vec<f64>,
    key: f64,
}

impl CopyKernel {
    /// Create an uninitialised copy kernel labelled `name` (used in
    /// diagnostics, e.g. `"ta_front"`).
    pub fn new(name: impl Into<String>) -> Self {
        CopyKernel {
            name: name.into(),
            a: Vec::new(),
            b: Vec::new(),
            key: 0.0,
        }
    }
}

impl FlushKernel for CopyKernel {
    fn init(&mut self, flush_kib: usize) -> Result<usize> {
        let n = elements_for(flush_kib, BYTES_PER_ELEMENT_COPY);
        self.a = vec![0.0; n];
        self.b = vec![FILL_B; n];
        self.key = 0.0;
        Ok((n * BYTES_PER_ELEMENT_COPY) / 1024)
    }

    fn run(&mut self) {
        self.a.copy_from_slice(&self.b);
    }

    fn update_key(&mut self) {
        self.key += self.a.iter().sum::<f64>();
        self.a.iter_mut().for_each(|v| *v = 0.0);
    }

    fn check_key(&mut self, ntests: u64) -> Result<f64> {
        let key_target = ntests as f64 * self.a.len() as f64 * FILL_B;
        finish_check(&self.name, self.key, key_target)
    }
}

/// `a[i] = k*b[i]; b[i] = k*a[i]` -- `b` grows geometrically across runs,
/// so `key_target` is the closed form of the resulting geometric series.
pub struct ScaleKernel {
    name: String,
    a: Vec<f64>,
    b: Vec<f64>,
    key: f64,
}

impl ScaleKernel {
    /// Create an uninitialised scale kernel labelled `name`.
    pub fn new(name: impl Into<String>) -> Self {
        ScaleKernel {
            name: name.into(),
            a: Vec::new(),
            b: Vec::new(),
            key: 0.0,
        }
    }
}

impl FlushKernel for ScaleKernel {
    fn init(&mut self, flush_kib: usize) -> Result<usize> {
        let n = elements_for(flush_kib, BYTES_PER_ELEMENT_SCALE);
        self.a = vec![0.0; n];
        self.b = vec![FILL_B; n];
        self.key = 0.0;
        Ok((n * BYTES_PER_ELEMENT_SCALE) / 1024)
    }

    fn run(&mut self) {
        for i in 0..self.a.len() {
            self.a[i] = SCALE_K * self.b[i];
            self.b[i] = SCALE_K * self.a[i];
        }
    }

    fn update_key(&mut self) {
        self.key += self.a.iter().sum::<f64>();
        self.a.iter_mut().for_each(|v| *v = 0.0);
    }

    fn check_key(&mut self, ntests: u64) -> Result<f64> {
        let n = self.a.len() as f64;
        let k2 = SCALE_K * SCALE_K;
        // sum_{j=0}^{ntests-1} k^{2j+1} = k * (k^{2*ntests} - 1) / (k^2 - 1)
        let series = if (k2 - 1.0).abs() < f64::EPSILON {
            ntests as f64
        } else {
            SCALE_K * (k2.powi(ntests as i32) - 1.0) / (k2 - 1.0)
        };
        let key_target = n * FILL_B * series;
        finish_check(&self.name, self.key, key_target)
    }
}

/// `a[i] = b[i] + c[i]`; `b`, `c` are constant across runs.
pub struct AddKernel {
    name: String,
    a: Vec<f64>,
    b: Vec<f64>,
    c: Vec<f64>,
    key: f64,
}

impl AddKernel {
    /// Create an uninitialised add kernel labelled `name`.
    pub fn new(name: impl Into<String>) -> Self {
        AddKernel {
            name: name.into(),
            a: Vec::new(),
            b: Vec::new(),
            c: Vec::new(),
            key: 0.0,
        }
    }
}

impl FlushKernel for AddKernel {
    fn init(&mut self, flush_kib: usize) -> Result<usize> {
        let n = elements_for(flush_kib, BYTES_PER_ELEMENT_ADD);
        self.a = vec![0.0; n];
        self.b = vec![FILL_B; n];
        self.c = vec![FILL_C; n];
        self.key = 0.0;
        Ok((n * BYTES_PER_ELEMENT_ADD) / 1024)
    }

    fn run(&mut self) {
        for i in 0..self.a.len() {
            self.a[i] = self.b[i] + self.c[i];
        }
    }

    fn update_key(&mut self) {
        self.key += self.a.iter().sum::<f64>();
        self.a.iter_mut().for_each(|v| *v = 0.0);
    }

    fn check_key(&mut self, ntests: u64) -> Result<f64> {
        let key_target = ntests as f64 * self.a.len() as f64 * (FILL_B + FILL_C);
        finish_check(&self.name, self.key, key_target)
    }
}

/// `a[i] = k*b[i] + c[i]`; `b`, `c` are constant across runs.
pub struct TriadKernel {
    name: String,
    a: Vec<f64>,
    b: Vec<f64>,
    c: Vec<f64>,
    key: f64,
}

impl TriadKernel {
    /// Create an uninitialised triad kernel labelled `name`.
    pub fn new(name: impl Into<String>) -> Self {
        TriadKernel {
            name: name.into(),
            a: Vec::new(),
            b: Vec::new(),
            c: Vec::new(),
            key: 0.0,
        }
    }
}

impl FlushKernel for TriadKernel {
    fn init(&mut self, flush_kib: usize) -> Result<usize> {
        let n = elements_for(flush_kib, BYTES_PER_ELEMENT_TRIAD);
        self.a = vec![0.0; n];
        self.b = vec![FILL_B; n];
        self.c = vec![FILL_C; n];
        self.key = 0.0;
        Ok((n * BYTES_PER_ELEMENT_TRIAD) / 1024)
    }

    fn run(&mut self) {
        for i in 0..self.a.len() {
            self.a[i] = TRIAD_K * self.b[i] + self.c[i];
        }
    }

    fn update_key(&mut self) {
        self.key += self.a.iter().sum::<f64>();
        self.a.iter_mut().for_each(|v| *v = 0.0);
    }

    fn check_key(&mut self, ntests: u64) -> Result<f64> {
        let key_target = ntests as f64 * self.a.len() as f64 * (TRIAD_K * FILL_B + FILL_C);
        finish_check(&self.name, self.key, key_target)
    }
}

/// `a[i] = pow(b[i], p)`; `b` is constant across runs.
pub struct PowKernel {
    name: String,
    a: Vec<f64>,
    b: Vec<f64>,
    key: f64,
}

impl PowKernel {
    /// Create an uninitialised pow kernel labelled `name`.
    pub fn new(name: impl Into<String>) -> Self {
        PowKernel {
            name: name.into(),
            a: Vec::new(),
            b: Vec::new(),
            key: 0.0,
        }
    }
}

impl FlushKernel for PowKernel {
    fn init(&mut self, flush_kib: usize) -> Result<usize> {
        let n = elements_for(flush_kib, BYTES_PER_ELEMENT_POW);
        self.a = vec![0.0; n];
        self.b = vec![FILL_B; n];
        self.key = 0.0;
        Ok((n * BYTES_PER_ELEMENT_POW) / 1024)
    }

    fn run(&mut self) {
        for i in 0..self.a.len() {
            self.a[i] = self.b[i].powf(POW_P);
        }
    }

    fn update_key(&mut self) {
        self.key += self.a.iter().sum::<f64>();
        self.a.iter_mut().for_each(|v| *v = 0.0);
    }

    fn check_key(&mut self, ntests: u64) -> Result<f64> {
        let key_target = ntests as f64 * self.a.len() as f64 * FILL_B.powf(POW_P);
        finish_check(&self.name, self.key, key_target)
    }
}

/// Dense matrix multiply `C = A*B` with `B` fixed to the identity matrix,
/// so `key_target` has a closed form (`C == A`) without a general matmul
/// correctness oracle.
pub struct DgemmKernel {
    name: String,
    dim: usize,
    a: Vec<f64>,
    c: Vec<f64>,
    key: f64,
}

impl DgemmKernel {
    /// Create an uninitialised DGEMM kernel labelled `name`.
    pub fn new(name: impl Into<String>) -> Self {
        DgemmKernel {
            name: name.into(),
            dim: 0,
            a: Vec::new(),
            c: Vec::new(),
            key: 0.0,
        }
    }
}

impl FlushKernel for DgemmKernel {
    fn init(&mut self, flush_kib: usize) -> Result<usize> {
        let elements = elements_for(flush_kib, BYTES_PER_ELEMENT_DGEMM);
        let dim = (elements as f64).sqrt().floor() as usize;
        self.dim = dim;
        self.a = vec![FILL_B; dim * dim];
        self.c = vec![0.0; dim * dim];
        self.key = 0.0;
        Ok((dim * dim * BYTES_PER_ELEMENT_DGEMM) / 1024)
    }

    fn run(&mut self) {
        // B is the identity matrix, so C = A*I = A without ever
        // materialising B: each output row is a copy of the input row.
        self.c.copy_from_slice(&self.a);
    }

    fn update_key(&mut self) {
        self.key += self.c.iter().sum::<f64>();
        self.c.iter_mut().for_each(|v| *v = 0.0);
    }

    fn check_key(&mut self, ntests: u64) -> Result<f64> {
        let key_target = ntests as f64 * (self.dim * self.dim) as f64 * FILL_B;
        finish_check(&self.name, self.key, key_target)
    }
}

/// Distributed broadcast kernel: root's buffer is rebroadcast to every
/// rank each pass via a caller-supplied broadcast function (so this crate
/// does not depend on the rank runtime directly -- see `calibrate`'s
/// `OrReduce` for the same pattern).
pub struct BroadcastKernel<'a> {
    name: String,
    a: Vec<f64>,
    key: f64,
    broadcast: Box<dyn FnMut(&[f64]) -> Vec<f64> + Send + Sync + 'a>,
}

impl<'a> BroadcastKernel<'a> {
    /// Create an uninitialised broadcast kernel labelled `name`, using
    /// `broadcast` to exchange root's buffer with every rank each pass.
    pub fn new(
        name: impl Into<String>,
        broadcast: impl FnMut(&[f64]) -> Vec<f64> + Send + Sync + 'a,
    ) -> Self {
        BroadcastKernel {
            name: name.into(),
            a: Vec::new(),
            key: 0.0,
            broadcast: Box::new(broadcast),
        }
    }
}

impl FlushKernel for BroadcastKernel<'_> {
    fn init(&mut self, flush_kib: usize) -> Result<usize> {
        let n = elements_for(flush_kib, BYTES_PER_ELEMENT_BROADCAST);
        self.a = vec![FILL_B; n];
        self.key = 0.0;
        Ok((n * BYTES_PER_ELEMENT_BROADCAST) / 1024)
    }

    fn run(&mut self) {
        self.a = (self.broadcast)(&self.a);
    }

    fn update_key(&mut self) {
        self.key += self.a.iter().sum::<f64>();
        self.a.iter_mut().for_each(|v| *v = 0.0);
    }

    fn check_key(&mut self, ntests: u64) -> Result<f64> {
        let key_target = ntests as f64 * self.a.len() as f64 * FILL_B;
        finish_check(&self.name, self.key, key_target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ntests(kernel: &mut dyn FlushKernel, ntests: u64) {
        for _ in 0..ntests {
            kernel.run();
            kernel.update_key();
        }
    }

    #[test]
    fn copy_kernel_key_matches_target() {
        let mut k = CopyKernel::new("ta_front");
        k.init(1).unwrap();
        run_ntests(&mut k, 50);
        let gap = k.check_key(50).unwrap();
        assert!(gap < 1e-9);
    }

    #[test]
    fn add_kernel_key_matches_target() {
        let mut k = AddKernel::new("ta_rear");
        k.init(1).unwrap();
        run_ntests(&mut k, 30);
        let gap = k.check_key(30).unwrap();
        assert!(gap < 1e-9);
    }

    #[test]
    fn triad_kernel_key_matches_target() {
        let mut k = TriadKernel::new("tb_front");
        k.init(1).unwrap();
        run_ntests(&mut k, 30);
        let gap = k.check_key(30).unwrap();
        assert!(gap < 1e-9);
    }

    #[test]
    fn pow_kernel_key_matches_target() {
        let mut k = PowKernel::new("tb_rear");
        k.init(1).unwrap();
        run_ntests(&mut k, 30);
        let gap = k.check_key(30).unwrap();
        assert!(gap < 1e-9);
    }

    #[test]
    fn scale_kernel_key_matches_geometric_series_target() {
        let mut k = ScaleKernel::new("ta_front");
        k.init(1).unwrap();
        run_ntests(&mut k, 10);
        let gap = k.check_key(10).unwrap();
        assert!(gap < 1e-6);
    }

    #[test]
    fn dgemm_with_identity_b_reproduces_a_after_one_run() {
        let mut k = DgemmKernel::new("ta_rear");
        k.init(1).unwrap();
        k.run();
        assert_eq!(k.c, k.a);
    }

    #[test]
    fn dgemm_kernel_key_matches_target_after_k_runs() {
        let mut k = DgemmKernel::new("ta_rear");
        k.init(1).unwrap();
        run_ntests(&mut k, 7);
        let gap = k.check_key(7).unwrap();
        assert!(gap < 1e-9);
    }

    #[test]
    fn broadcast_kernel_key_matches_target_with_identity_broadcast() {
        let mut k = BroadcastKernel::new("ta_front", |local: &[f64]| local.to_vec());
        k.init(1).unwrap();
        run_ntests(&mut k, 20);
        let gap = k.check_key(20).unwrap();
        assert!(gap < 1e-9);
    }

    #[test]
    fn none_kernel_never_fails_key_check() {
        let mut k = NoneKernel;
        k.init(64).unwrap();
        k.run();
        k.update_key();
        assert_eq!(k.check_key(1000).unwrap(), 0.0);
    }

    #[test]
    fn deliberate_key_mismatch_is_reported_as_key_check_failed() {
        let mut k = CopyKernel::new("ta_front");
        k.init(1).unwrap();
        run_ntests(&mut k, 10);
        let err = k.check_key(9).unwrap_err();
        assert!(matches!(err, Error::KeyCheckFailed { .. }));
    }
}
