// SPDX-License-Identifier: Apache-2.0

//! Rank runtime for `partes`.
//!
//! Ranks are processes coordinated by a message-passing runtime offering
//! barrier/gather/broadcast/OR-reduce collectives. No MPI binding is part
//! of this crate's dependency surface, so ranks are realised as OS threads
//! inside one process (see DESIGN.md): [`run_ranks`] spawns `nrank` named
//! threads sharing a [`WorldShared`], and each thread receives a
//! [`RankHandle`] implementing [`Collectives`].
//!
//! Every rank thread must call the collectives in the same order (an SPMD
//! program), since each collective reuses a single shared scratch buffer
//! sized by the barrier's participant count.

use partes_error::{Error, Result};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread;

/// Collective operations available to a rank's driver loop.
///
/// Two-sided barrier, OR all-reduce (calibration convergence), gather
/// (bringing per-rank samples to root), and a token-ring pass used for
/// ordered stdout output.
pub trait Collectives {
    /// This rank's index in `[0, world_size())`.
    fn rank(&self) -> usize;

    /// Total number of ranks in the job.
    fn world_size(&self) -> usize;

    /// Rank 0 is root by convention.
    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Two-sided rendezvous: returns only once every rank has called it.
    fn barrier(&self);

    /// OR all-reduce: every rank observes `true` iff any rank passed `true`.
    fn or_reduce(&self, local: bool) -> bool;

    /// Gather one `f64` per rank to root. Returns `Some` only on root.
    fn gather_f64(&self, local: f64) -> Option<Vec<f64>>;

    /// Gather one `i64` sample vector per rank to root. Returns `Some` only on root.
    fn gather_samples(&self, local: &[i64]) -> Option<Vec<Vec<i64>>>;

    /// Broadcast root's buffer to every rank. Non-root callers' `root_value`
    /// is ignored; all ranks, including root, get root's data back.
    fn broadcast_f64(&self, root_value: &[f64]) -> Vec<f64>;

    /// Run `f` once per rank, strictly in ascending rank order. Every rank
    /// must call `token_ring` the same number of times, in the same relative
    /// order, for the hand-off to terminate.
    fn token_ring<F: FnMut()>(&self, f: F);
}

/// State shared by every rank thread in a [`run_ranks`] job.
struct WorldShared {
    size: usize,
    barrier: Barrier,
    or_buf: Mutex<Vec<bool>>,
    gather_f64_buf: Mutex<Vec<f64>>,
    gather_samples_buf: Mutex<Vec<Vec<i64>>>,
    broadcast_buf: Mutex<Vec<f64>>,
    token: Mutex<usize>,
    token_cv: Condvar,
}

impl WorldShared {
    fn new(size: usize) -> Self {
        WorldShared {
            size,
            barrier: Barrier::new(size),
            or_buf: Mutex::new(vec![false; size]),
            gather_f64_buf: Mutex::new(vec![0.0; size]),
            gather_samples_buf: Mutex::new(vec![Vec::new(); size]),
            broadcast_buf: Mutex::new(Vec::new()),
            token: Mutex::new(0),
            token_cv: Condvar::new(),
        }
    }
}

/// A single rank's view of the shared world; implements [`Collectives`].
#[derive(Clone)]
pub struct RankHandle {
    rank: usize,
    shared: Arc<WorldShared>,
}

impl Collectives for RankHandle {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn or_reduce(&self, local: bool) -> bool {
        {
            let mut buf = self.shared.or_buf.lock().expect("or_buf poisoned");
            buf[self.rank] = local;
        }
        self.shared.barrier.wait();
        let result = {
            let buf = self.shared.or_buf.lock().expect("or_buf poisoned");
            buf.iter().any(|&b| b)
        };
        self.shared.barrier.wait();
        result
    }

    fn gather_f64(&self, local: f64) -> Option<Vec<f64>> {
        {
            let mut buf = self.shared.gather_f64_buf.lock().expect("gather buf poisoned");
            buf[self.rank] = local;
        }
        self.shared.barrier.wait();
        let result = self
            .is_root()
            .then(|| self.shared.gather_f64_buf.lock().expect("gather buf poisoned").clone());
        self.shared.barrier.wait();
        result
    }

    fn gather_samples(&self, local: &[i64]) -> Option<Vec<Vec<i64>>> {
        {
            let mut buf = self
                .shared
                .gather_samples_buf
                .lock()
                .expect("gather buf poisoned");
            buf[self.rank] = local.to_vec();
        }
        self.shared.barrier.wait();
        let result = self.is_root().then(|| {
            self.shared
                .gather_samples_buf
                .lock()
                .expect("gather buf poisoned")
                .clone()
        });
        self.shared.barrier.wait();
        result
    }

    fn broadcast_f64(&self, root_value: &[f64]) -> Vec<f64> {
        if self.is_root() {
            let mut buf = self.shared.broadcast_buf.lock().expect("broadcast buf poisoned");
            *buf = root_value.to_vec();
        }
        self.shared.barrier.wait();
        let result = self
            .shared
            .broadcast_buf
            .lock()
            .expect("broadcast buf poisoned")
            .clone();
        self.shared.barrier.wait();
        result
    }

    fn token_ring<F: FnMut()>(&self, mut f: F) {
        let mut guard = self.shared.token.lock().expect("token poisoned");
        while *guard % self.shared.size != self.rank {
            guard = self.shared.token_cv.wait(guard).expect("token poisoned");
        }
        drop(guard);

        f();

        let mut guard = self.shared.token.lock().expect("token poisoned");
        *guard += 1;
        self.shared.token_cv.notify_all();
    }
}

/// Spawn `nrank` threads, each running `body` with its own [`RankHandle`],
/// and join all of them.
///
/// When `pin_cores` is set, rank `i` is bound to the `i`-th distinct
/// physical core reported by the platform; fails with
/// [`Error::CoreDetectionUnavailable`] or [`Error::InvalidCoreRange`] if
/// that is not possible.
pub fn run_ranks<F, T>(nrank: usize, pin_cores: bool, body: F) -> Result<Vec<T>>
where
    F: Fn(RankHandle) -> Result<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    assert!(nrank >= 1, "nrank must be at least 1");

    let core_ids = if pin_cores {
        let ids = core_affinity::get_core_ids().ok_or(Error::CoreDetectionUnavailable)?;
        if ids.len() < nrank {
            return Err(Error::InvalidCoreRange {
                nrank,
                available: ids.len(),
            });
        }
        Some(ids)
    } else {
        None
    };

    let shared = Arc::new(WorldShared::new(nrank));
    let body = Arc::new(body);

    let mut handles = Vec::with_capacity(nrank);
    for rank in 0..nrank {
        let shared = Arc::clone(&shared);
        let body = Arc::clone(&body);
        let core_id = core_ids.as_ref().map(|ids| ids[rank]);
        let thread_name = format!("partes-rank-{rank}");

        let join_handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                if let Some(core_id) = core_id {
                    let _ = core_affinity::set_for_current(core_id);
                }
                body(RankHandle { rank, shared })
            })
            .map_err(|source| Error::ThreadSpawnError {
                thread_name: thread_name.clone(),
                source,
            })?;
        handles.push((thread_name, join_handle));
    }

    let mut results = Vec::with_capacity(nrank);
    for (thread_name, join_handle) in handles {
        match join_handle.join() {
            Ok(result) => results.push(result?),
            Err(panic) => {
                return Err(Error::ThreadJoinPanic {
                    thread_name,
                    panic_message: panic_message(&panic),
                });
            }
        }
    }

    Ok(results)
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
