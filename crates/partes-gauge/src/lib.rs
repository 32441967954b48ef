// SPDX-License-Identifier: Apache-2.0

//! Gauge kernels and gauges-per-tick calibration for `partes`.

mod calibrate;
mod kernel;

pub use calibrate::{
    calibrate, exponential_guessing, fit_sub_time, GaugeInfo, OrReduce, CONVERGE_FRAC,
    DELTA_TICK, EXP_GUESS_KMAX, FIT_XLEN, MAX_FIT_ITERS, MET_REPEAT, NUM_IGNORE_TIMING,
    PT_THRES_GUESS_FACTOR, PT_THRES_GUESS_NTICK, PT_VAR_MAX_NSTEP,
};
pub use kernel::{FmaAvx2, FmaAvx512, FmaScalar, Gauge, SubScalar};
