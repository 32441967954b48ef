// SPDX-License-Identifier: Apache-2.0

//! Timer sources and timer characterisation (`get_tspec`) for `partes`.

mod tsc;

use partes_error::{Error, Result};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A monotonic nanosecond time source.
///
/// `tick()` and `tock()` are the pre- and post-measurement reads bracketing
/// a timed region; `get_stamp()` is used for free-standing stress reads
/// during timer characterisation. For every variant here the three have
/// identical semantics except [`TscAsym`], which deliberately uses
/// asymmetric serialisation at each end of the timed region.
pub trait Timer: Send + Sync {
    /// Prepare the timer source. Infallible reads are only guaranteed after
    /// a successful `init`.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Pre-measurement read.
    fn tick(&self) -> i64;

    /// Post-measurement read.
    fn tock(&self) -> i64;

    /// An arbitrary read, used outside the timed region (e.g. for
    /// characterisation stress loops).
    fn get_stamp(&self) -> i64 {
        self.tick()
    }
}

/// Reads the OS steady monotonic clock (`clock_gettime(CLOCK_MONOTONIC)`
/// in spirit). `tick == tock == get_stamp`.
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    /// Create a new monotonic-clock timer, capturing the epoch instant.
    pub fn new() -> Self {
        MonotonicClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for MonotonicClock {
    fn tick(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }

    fn tock(&self) -> i64 {
        self.tick()
    }
}

/// Reads the process's wall-clock time and converts seconds to nanoseconds,
/// standing in for a communicator-wide wall-time function (`MPI_Wtime`) in
/// the thread-backed rank model (see DESIGN.md).
pub struct DistributedWallClock;

impl DistributedWallClock {
    /// Create a new wall-clock timer.
    pub fn new() -> Self {
        DistributedWallClock
    }
}

impl Default for DistributedWallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for DistributedWallClock {
    fn tick(&self) -> i64 {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        d.as_nanos() as i64
    }

    fn tock(&self) -> i64 {
        self.tick()
    }
}

/// Asymmetric serialised cycle-counter read pair, x86-64 only.
///
/// `tick()` serialises *before* reading TSC (`lfence; rdtsc`); `tock()`
/// reads with the self-serialising `rdtscp` then fences again
/// (`rdtscp; lfence`). This asymmetry bounds out-of-order leakage at both
/// ends of the timed region. Values are cycles, carried as `i64` "ns" by
/// convention -- calibration rescales them.
#[cfg(target_arch = "x86_64")]
pub struct TscAsym {
    has_rdtscp: bool,
}

#[cfg(target_arch = "x86_64")]
impl TscAsym {
    /// Probe CPU support. Returns `None` if `rdtscp` or an invariant TSC is
    /// unavailable -- callers should fall back to [`MonotonicClock`].
    pub fn new() -> Option<Self> {
        let features = tsc::detect_features();
        if !features.available || !features.invariant || !features.rdtscp {
            return None;
        }
        Some(TscAsym { has_rdtscp: true })
    }
}

#[cfg(target_arch = "x86_64")]
impl Timer for TscAsym {
    fn tick(&self) -> i64 {
        debug_assert!(self.has_rdtscp);
        tsc::read_serialized() as i64
    }

    fn tock(&self) -> i64 {
        tsc::read_with_id().0 as i64
    }

    fn get_stamp(&self) -> i64 {
        tsc::read_serialized() as i64
    }
}

/// `{ovh, tick}` as derived by [`characterize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSpec {
    /// Minimum observed single back-to-back `tick`/`tock` read latency, in
    /// nanoseconds (or cycles, for [`TscAsym`]). `ovh >= 0`.
    pub ovh: i64,
    /// Minimum observed positive forward delta between successive reads:
    /// the timer's grain. `tick >= 1`.
    pub tick: i64,
}

/// Characterise `timer`'s overhead and resolution.
///
/// Two barriers to cross any OS scheduling quantum, a paired-read loop to
/// find `ovh`, and a free-running stamp loop to find `tick` as the
/// smallest positive forward jump. Fails with
/// [`Error::TimerNegative`] on any non-monotonic read.
pub fn characterize(
    timer: &dyn Timer,
    ntest: usize,
    mut barrier: impl FnMut(),
) -> Result<TimerSpec> {
    assert!(ntest >= 2, "ntest must be at least 2 to observe a delta");

    barrier();
    barrier();

    let mut ovh = i64::MAX;
    for _ in 0..ntest {
        let t0 = timer.tick();
        let t1 = timer.tock();
        let d = t1 - t0;
        if d < 0 {
            return Err(Error::TimerNegative { delta: d });
        }
        ovh = ovh.min(d);
    }

    let stamps: Vec<i64> = (0..ntest).map(|_| timer.get_stamp()).collect();
    let mut tick = i64::MAX;
    for w in stamps.windows(2) {
        let d = w[1] - w[0];
        if d < 0 {
            return Err(Error::TimerNegative { delta: d });
        }
        if d > 0 {
            tick = tick.min(d);
        }
    }

    if tick == i64::MAX {
        // Every consecutive pair read identical stamps; the grain is at
        // least as coarse as the whole stress loop took to run once more.
        tick = ovh.max(1);
    }

    tracing::debug!(ovh, tick, "timer characterisation converged");
    Ok(TimerSpec { ovh, tick })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_has_sane_spec() {
        let timer = MonotonicClock::new();
        let spec = characterize(&timer, 200, || {}).unwrap();
        assert!(spec.tick >= 1);
        assert!(spec.ovh >= 0);
    }

    #[test]
    fn wallclock_has_sane_spec() {
        let timer = DistributedWallClock::new();
        let spec = characterize(&timer, 200, || {}).unwrap();
        assert!(spec.tick >= 1);
        assert!(spec.ovh >= 0);
    }

    #[test]
    fn non_monotonic_reads_are_fatal() {
        struct BrokenTimer;
        impl Timer for BrokenTimer {
            fn tick(&self) -> i64 {
                100
            }
            fn tock(&self) -> i64 {
                50
            }
        }
        let err = characterize(&BrokenTimer, 10, || {}).unwrap_err();
        assert!(matches!(err, Error::TimerNegative { delta: -50 }));
    }
}
