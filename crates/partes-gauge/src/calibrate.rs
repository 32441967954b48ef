// SPDX-License-Identifier: Apache-2.0

//! Gauges-per-tick (`gpt`) calibration: an exponential bracket search
//! followed by a bisection fit, run once per rank against its own
//! [`Timer`] and [`Gauge`].
//!
//! Both stages are collective: every rank keeps iterating until every
//! rank has either converged or asked the job to stop early, so a rank
//! that finds a stable `gpt` first does not race ahead while its peers
//! are still timing. This is realised as a distributed OR-reduction on
//! a shared break flag.

use partes_error::{Error, Result};
use partes_timer::Timer;

use crate::kernel::Gauge;

/// Number of repeats at each exponential step; the smallest elapsed time
/// across repeats is kept to reject scheduler noise.
pub const PT_VAR_MAX_NSTEP: usize = 5;

/// Largest exponent tried in the exponential bracket: `n_k = 10^k` for
/// `k` in `0..=EXP_GUESS_KMAX`.
pub const EXP_GUESS_KMAX: u32 = 10;

/// Safety margin applied to the noise-floor escape check: the measured
/// interval must be at least this many multiples of `ovh` before it is
/// trusted.
pub const PT_THRES_GUESS_FACTOR: i64 = 10;

/// Minimum tick-multiple an exponential-step measurement must span
/// before it is considered to have escaped the timer's own resolution.
pub const PT_THRES_GUESS_NTICK: i64 = 1_000;

/// `dt` in "tick units" used by the bisection fit's probe spacing.
pub const DELTA_TICK: i64 = 10;

/// Number of measurement points per bisection iteration, not counting
/// the discarded warm-up points.
pub const FIT_XLEN: usize = 32;

/// Warm-up points discarded from the front of each bisection probe run.
pub const NUM_IGNORE_TIMING: usize = 2;

/// Repeats per probe point; the minimum elapsed time is kept.
pub const MET_REPEAT: usize = 3;

/// Bracket shrinks until `|hi - lo| < CONVERGE_FRAC * gpt`.
pub const CONVERGE_FRAC: f64 = 0.01;

/// Hard cap on bisection iterations before giving up as a timer fault.
pub const MAX_FIT_ITERS: usize = 200;

/// `{cy_per_op, wtime_per_op, gpt}` as produced by [`calibrate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaugeInfo {
    /// Estimated timer ticks consumed per gauge unit at the chosen `gpt`.
    pub cy_per_op: f64,
    /// Estimated wall-clock nanoseconds per gauge unit.
    pub wtime_per_op: f64,
    /// Gauge units that correspond to one timer tick.
    pub gpt: f64,
}

/// Distributed logical OR of `local` across every rank, returning the
/// same value to all of them.
pub type OrReduce<'a> = dyn FnMut(bool) -> bool + 'a;

fn and_reduce(or_reduce: &mut OrReduce<'_>, local: bool) -> bool {
    !or_reduce(!local)
}

/// Exponential bracket search: grows `n = 10^k` until a measurement
/// clearly escapes the timer's noise floor, or any rank signals an
/// early stop.
///
/// Returns a first guess at `gpt` (gauge units per tick) derived from
/// the smallest `n` whose elapsed time was trusted.
pub fn exponential_guessing(
    gauge: &dyn Gauge,
    timer: &dyn Timer,
    tick: i64,
    ovh: i64,
    or_reduce: &mut OrReduce<'_>,
) -> Result<f64> {
    let mut last_trusted: Option<(i64, i64)> = None; // (n, elapsed)

    for k in 0..=EXP_GUESS_KMAX {
        let n = 10_i64.pow(k);

        let mut best = i64::MAX;
        for _ in 0..PT_VAR_MAX_NSTEP {
            let t0 = timer.tick();
            gauge.run(n);
            let t1 = timer.tock();
            let d = t1 - t0;
            if d < 0 {
                return Err(Error::TimerNegative { delta: d });
            }
            best = best.min(d);
        }

        let escaped_noise_floor =
            PT_THRES_GUESS_FACTOR * best > PT_THRES_GUESS_NTICK * tick && best > PT_THRES_GUESS_FACTOR * ovh.max(1);
        if escaped_noise_floor {
            last_trusted = Some((n, best));
        }

        let local_done = last_trusted.is_some();
        let global_stop = or_reduce(local_done);
        if global_stop {
            break;
        }
    }

    let (n, elapsed) = last_trusted.ok_or(Error::TimerOverflow {
        lo: 0.0,
        hi: f64::INFINITY,
    })?;

    let wtime_per_op = elapsed as f64 / n as f64;
    if wtime_per_op <= 0.0 {
        return Err(Error::TimerOverflow {
            lo: 0.0,
            hi: 0.0,
        });
    }
    Ok(tick as f64 / wtime_per_op)
}

/// Bisection fit around `gpt_guess`: probes a widening ladder of gauge
/// counts and adjusts the bracket until successive probe deltas track
/// `dt` timer ticks apart, i.e. `gpt` gauge units really do take one
/// tick.
///
/// Collective in the same sense as [`exponential_guessing`]: a rank that
/// converges keeps calling the reduction (holding its bracket steady)
/// until every rank has converged.
pub fn fit_sub_time(
    gauge: &dyn Gauge,
    timer: &dyn Timer,
    tick: i64,
    ovh: i64,
    gpt_guess: f64,
    or_reduce: &mut OrReduce<'_>,
) -> Result<GaugeInfo> {
    assert!(gpt_guess > 0.0, "gpt_guess must be positive");

    let mut lo = (gpt_guess / 2.0).max(f64::EPSILON);
    let mut hi = gpt_guess * 2.0;
    let mut gpt = gpt_guess;

    for _ in 0..MAX_FIT_ITERS {
        let local_converged = (hi - lo) < CONVERGE_FRAC * gpt;

        if !local_converged {
            gpt = (lo + hi) / 2.0;
            let wtime_per_op = tick as f64 / gpt;
            let dx = (gpt * DELTA_TICK as f64).max(1.0) as i64;
            let n_min = ((PT_THRES_GUESS_FACTOR * ovh.max(1)) as f64 / wtime_per_op)
                .ceil()
                .max(1.0) as i64;

            let total_points = FIT_XLEN + NUM_IGNORE_TIMING;
            let mut elapsed = Vec::with_capacity(total_points);
            for i in 0..total_points {
                let n = n_min + (i as i64) * dx;
                let mut best = i64::MAX;
                for _ in 0..MET_REPEAT {
                    let t0 = timer.tick();
                    gauge.run(n);
                    let t1 = timer.tock();
                    let d = t1 - t0;
                    if d < 0 {
                        return Err(Error::TimerNegative { delta: d });
                    }
                    best = best.min(d);
                }
                elapsed.push(best);
            }

            let mut delta_sum = 0.0_f64;
            let mut delta_count = 0usize;
            for i in NUM_IGNORE_TIMING..total_points {
                let step = (elapsed[i] - elapsed[i - 1]) as f64 / tick as f64 - DELTA_TICK as f64;
                delta_sum += step;
                delta_count += 1;
            }
            let delta = delta_sum / delta_count.max(1) as f64;

            if delta < -CONVERGE_FRAC {
                lo = gpt;
            } else if delta > CONVERGE_FRAC {
                hi = gpt;
            }
            // else: within tolerance already, leave bracket as-is and let
            // the convergence check above catch it next iteration.
        }

        let global_done = and_reduce(or_reduce, (hi - lo) < CONVERGE_FRAC * gpt);
        if global_done {
            break;
        }
    }

    if (hi - lo) >= CONVERGE_FRAC * gpt {
        return Err(Error::TimerOverflow { lo, hi });
    }

    let wtime_per_op = tick as f64 / gpt;
    Ok(GaugeInfo {
        cy_per_op: 1.0 / gpt,
        wtime_per_op,
        gpt,
    })
}

/// Run both calibration stages in sequence, as the measurement driver
/// does for each rank.
pub fn calibrate(
    gauge: &dyn Gauge,
    timer: &dyn Timer,
    tick: i64,
    ovh: i64,
    or_reduce: &mut OrReduce<'_>,
) -> Result<GaugeInfo> {
    let gpt_guess = exponential_guessing(gauge, timer, tick, ovh, or_reduce)?;
    fit_sub_time(gauge, timer, tick, ovh, gpt_guess, or_reduce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// A gauge whose cost is exactly linear and noise-free: `run(n)`
    /// advances a shared nanosecond counter by `n * ns_per_unit`.
    struct LinearGauge {
        clock: std::sync::Arc<AtomicI64>,
        ns_per_unit: i64,
    }

    impl Gauge for LinearGauge {
        fn run(&self, n: i64) {
            self.clock.fetch_add(n * self.ns_per_unit, Ordering::SeqCst);
        }
    }

    /// A timer reading the same shared counter the gauge advances, so
    /// elapsed time between `tick`/`tock` exactly reflects gauge work.
    struct SharedClockTimer {
        clock: std::sync::Arc<AtomicI64>,
    }

    impl Timer for SharedClockTimer {
        fn tick(&self) -> i64 {
            self.clock.load(Ordering::SeqCst)
        }
        fn tock(&self) -> i64 {
            self.clock.load(Ordering::SeqCst)
        }
    }

    fn no_op_or_reduce(local: bool) -> bool {
        local
    }

    #[test]
    fn exponential_guessing_converges_on_a_linear_gauge() {
        let clock = std::sync::Arc::new(AtomicI64::new(0));
        let gauge = LinearGauge {
            clock: clock.clone(),
            ns_per_unit: 5,
        };
        let timer = SharedClockTimer { clock };
        let mut or_reduce: Box<OrReduce> = Box::new(no_op_or_reduce);
        let gpt = exponential_guessing(&gauge, &timer, 20, 2, &mut or_reduce).unwrap();
        assert!(gpt > 0.0);
    }

    #[test]
    fn fit_sub_time_converges_near_the_true_rate() {
        let clock = std::sync::Arc::new(AtomicI64::new(0));
        let ns_per_unit = 5_i64;
        let tick = 20_i64;
        let gauge = LinearGauge {
            clock: clock.clone(),
            ns_per_unit,
        };
        let timer = SharedClockTimer { clock };
        let true_gpt = tick as f64 / ns_per_unit as f64;

        let mut or_reduce: Box<OrReduce> = Box::new(no_op_or_reduce);
        let info = fit_sub_time(&gauge, &timer, tick, 2, true_gpt * 1.5, &mut or_reduce).unwrap();

        let rel_err = (info.gpt - true_gpt).abs() / true_gpt;
        assert!(rel_err < 0.2, "gpt={} true_gpt={}", info.gpt, true_gpt);
    }

    #[test]
    fn calibrate_runs_both_stages_end_to_end() {
        let clock = std::sync::Arc::new(AtomicI64::new(0));
        let gauge = LinearGauge {
            clock: clock.clone(),
            ns_per_unit: 3,
        };
        let timer = SharedClockTimer { clock };
        let mut or_reduce: Box<OrReduce> = Box::new(no_op_or_reduce);
        let info = calibrate(&gauge, &timer, 20, 2, &mut or_reduce).unwrap();
        assert!(info.gpt > 0.0);
        assert!(info.wtime_per_op > 0.0);
    }
}
