// SPDX-License-Identifier: Apache-2.0

//! `partes`: parallel timing-error sensor binary.
//!
//! Wires the crate family into the measurement driver:
//! parse and validate the CLI, spawn `nrank` simulated ranks, characterise
//! each rank's timer, calibrate its gauge, run the barrier-synchronised
//! measurement loop at both targets, verify flush-kernel keys, gather to
//! root, and reduce to a Wasserstein distance and quantile-gap report.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use partes_config::{Cli, FlushKernelKind, GaugeKind, Options, TimerKind};
use partes_error::{Error, Result};
use partes_flush::{
    AddKernel, BroadcastKernel, CopyKernel, DgemmKernel, FlushKernel, NoneKernel, PowKernel,
    ScaleKernel, TriadKernel,
};
use partes_gauge::{self as gauge, FmaAvx2, FmaAvx512, FmaScalar, Gauge, SubScalar};
use partes_rt::{run_ranks, Collectives, RankHandle};
use partes_timer::{self as timer, DistributedWallClock, MonotonicClock, Timer};

/// Stress-loop size for timer characterisation; independent of
/// `--ntests`, which governs the measurement loop itself.
const TIMER_CHARACTERIZE_NTEST: usize = 1000;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            // clap's own exit() call for these two kinds writes the help or
            // version text and exits 0; the caller-requested early exit
            // (`--help`/`--version`) is a normal, non-error termination of
            // the program, but still carries its own ordinal rather than 0.
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{err}");
                std::process::exit(Error::ExitFlag.ordinal());
            }
            _ => err.exit(),
        },
    };
    let opts = match Options::from_cli(cli) {
        Ok(opts) => opts,
        Err(err) => fail(&err),
    };

    init_logging(opts.log_level.as_deref());

    match run(opts) {
        Ok(()) => {}
        Err(err) => fail(&err),
    }
}

fn init_logging(log_level: Option<&str>) {
    let filter = match log_level {
        Some(spec) => EnvFilter::try_new(spec).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn fail(err: &Error) -> ! {
    eprintln!("[ERROR] in partes: {err}");
    tracing::error!(error = %err, "fatal");
    std::process::exit(err.ordinal());
}

/// Final aggregate report, computed on root only.
struct Report {
    ta_all: Vec<i64>,
    tb_all: Vec<i64>,
    wasserstein: f64,
    quantile_gaps: Vec<partes_stats::QuantileGap>,
}

fn run(opts: Options) -> Result<()> {
    check_gauge_availability(opts.gauge)?;

    std::fs::create_dir_all(&opts.out_dir).map_err(|source| Error::FileOpenFailed {
        path: opts.out_dir.clone(),
        source,
    })?;

    let opts = std::sync::Arc::new(opts);
    let nrank = opts.nrank;
    let core_pin = opts.core_pin;

    let per_rank_results: Vec<Option<Report>> = run_ranks(nrank, core_pin, {
        let opts = std::sync::Arc::clone(&opts);
        move |rank| run_one_rank(&opts, rank)
    })?;

    for report in per_rank_results.into_iter().flatten() {
        print_report(&report, opts.ntiles as usize);
    }

    Ok(())
}

fn run_one_rank(opts: &Options, rank: RankHandle) -> Result<Option<Report>> {
    let mut timer = build_timer(opts)?;
    timer.init()?;

    let rank_barrier = {
        let rank = &rank;
        move || rank.barrier()
    };
    let spec = timer::characterize(timer.as_ref(), TIMER_CHARACTERIZE_NTEST, rank_barrier)?;

    let mut gauge_impl = build_gauge(opts);
    gauge_impl.init();

    let mut or_reduce = |local: bool| rank.or_reduce(local);
    let info = gauge::calibrate(gauge_impl.as_ref(), timer.as_ref(), spec.tick, spec.ovh, &mut or_reduce)?;

    tracing::info!(
        rank = rank.rank(),
        ovh = spec.ovh,
        tick = spec.tick,
        gpt = info.gpt,
        "rank calibration complete"
    );

    let mut ta_front = build_flush_kernel(opts.fkern, "ta_front", &rank);
    let mut ta_rear = build_flush_kernel(opts.rkern, "ta_rear", &rank);
    let mut tb_front = build_flush_kernel(opts.fkern, "tb_front", &rank);
    let mut tb_rear = build_flush_kernel(opts.rkern, "tb_rear", &rank);

    let ta_front_actual = ta_front.init(opts.fsize_a)?;
    let ta_rear_actual = ta_rear.init(opts.rsize_a)?;
    let tb_front_actual = tb_front.init(opts.fsize_b)?;
    let tb_rear_actual = tb_rear.init(opts.rsize_b)?;
    tracing::debug!(
        rank = rank.rank(),
        ta_front_actual,
        ta_rear_actual,
        tb_front_actual,
        tb_rear_actual,
        "flush-kernel working sets allocated"
    );

    let ta_samples = run_measurement_loop(
        opts.ta,
        opts.ntests,
        spec.tick,
        info.gpt,
        gauge_impl.as_ref(),
        timer.as_ref(),
        &rank,
        ta_front.as_mut(),
        ta_rear.as_mut(),
    )?;

    let tb_samples = run_measurement_loop(
        opts.tb,
        opts.ntests,
        spec.tick,
        info.gpt,
        gauge_impl.as_ref(),
        timer.as_ref(),
        &rank,
        tb_front.as_mut(),
        tb_rear.as_mut(),
    )?;

    for (slot_name, kernel) in [
        ("ta_front", ta_front.as_mut()),
        ("ta_rear", ta_rear.as_mut()),
        ("tb_front", tb_front.as_mut()),
        ("tb_rear", tb_rear.as_mut()),
    ] {
        match kernel.check_key(opts.ntests as u64) {
            Ok(gap) => tracing::info!(rank = rank.rank(), slot = slot_name, relative_gap = gap, "key check ok"),
            Err(err) => tracing::warn!(rank = rank.rank(), slot = slot_name, error = %err, "key check failed"),
        }
    }

    ta_front.cleanup();
    ta_rear.cleanup();
    tb_front.cleanup();
    tb_rear.cleanup();
    gauge_impl.cleanup();

    write_csv(&opts.out_dir, "partes_ta", rank.rank(), &ta_samples)?;
    write_csv(&opts.out_dir, "partes_tb", rank.rank(), &tb_samples)?;

    let gathered_ta = rank.gather_samples(&ta_samples);
    let gathered_tb = rank.gather_samples(&tb_samples);

    rank.token_ring(|| {
        println!(
            "rank {}: ovh={} tick={} gpt={:.4}",
            rank.rank(),
            spec.ovh,
            spec.tick,
            info.gpt
        );
    });

    if !rank.is_root() {
        return Ok(None);
    }

    let ta_all: Vec<i64> = gathered_ta.expect("root always gets Some").into_iter().flatten().collect();
    let tb_all: Vec<i64> = gathered_tb.expect("root always gets Some").into_iter().flatten().collect();

    let mut ta_for_cdf = ta_all.clone();
    let mut tb_for_cdf = tb_all.clone();
    let ntiles = opts.ntiles as usize;
    let cdf_a = partes_stats::cdf(&mut ta_for_cdf, ntiles);
    let cdf_b = partes_stats::cdf(&mut tb_for_cdf, ntiles);
    let w = partes_stats::wasserstein(&cdf_a, &cdf_b, ntiles, opts.cut_p);
    let gaps = partes_stats::quantile_gaps(&cdf_a, &cdf_b);

    Ok(Some(Report {
        ta_all,
        tb_all,
        wasserstein: w,
        quantile_gaps: gaps,
    }))
}

#[allow(clippy::too_many_arguments)]
fn run_measurement_loop(
    target_ns: i64,
    ntests: i64,
    tick: i64,
    gpt: f64,
    gauge_impl: &dyn Gauge,
    timer_impl: &dyn Timer,
    rank: &RankHandle,
    front: &mut dyn FlushKernel,
    rear: &mut dyn FlushKernel,
) -> Result<Vec<i64>> {
    let n_g = ((target_ns as f64 / tick as f64) * gpt).round() as i64;
    let mut samples = Vec::with_capacity(ntests as usize);

    for _ in 0..ntests {
        rank.barrier();
        rank.barrier();

        front.run();

        let t0 = timer_impl.tick();
        gauge_impl.run(n_g);
        let t1 = timer_impl.tock();
        let delta = t1 - t0;
        if delta < 0 {
            return Err(Error::TimerNegative { delta });
        }
        samples.push(delta);

        rear.run();

        front.update_key();
        rear.update_key();
    }

    Ok(samples)
}

fn build_timer(opts: &Options) -> Result<Box<dyn Timer>> {
    match opts.timer {
        TimerKind::ClockGettime => Ok(Box::new(MonotonicClock::new())),
        TimerKind::MpiWtime => Ok(Box::new(DistributedWallClock::new())),
        TimerKind::TscAsym => {
            #[cfg(target_arch = "x86_64")]
            {
                match timer::TscAsym::new() {
                    Some(t) => Ok(Box::new(t)),
                    None => {
                        tracing::warn!(
                            "tsc_asym requested but this CPU lacks an invariant TSC or rdtscp; refusing to fall back silently"
                        );
                        Err(Error::invalid_argument(
                            "--timer tsc_asym is unsupported on this CPU (no invariant TSC or rdtscp)",
                        ))
                    }
                }
            }
            #[cfg(not(target_arch = "x86_64"))]
            {
                tracing::warn!("tsc_asym requested on a non-x86-64 target");
                Err(Error::invalid_argument(
                    "--timer tsc_asym is only available on x86-64",
                ))
            }
        }
    }
}

/// Reject an architecture-specific gauge the running CPU cannot execute,
/// instead of silently falling back to a slower kernel inside `run`.
fn check_gauge_availability(gauge_kind: GaugeKind) -> Result<()> {
    match gauge_kind {
        GaugeKind::FmaAvx2 if !FmaAvx2::available() => Err(Error::invalid_argument(
            "--gauge fma_avx2 is unsupported on this CPU (no avx2/fma)",
        )),
        GaugeKind::FmaAvx512 if !FmaAvx512::available() => Err(Error::invalid_argument(
            "--gauge fma_avx512 is unsupported on this CPU (no avx512f)",
        )),
        _ => Ok(()),
    }
}

fn build_gauge(opts: &Options) -> Box<dyn Gauge> {
    match opts.gauge {
        GaugeKind::SubScalar => Box::new(SubScalar),
        GaugeKind::FmaScalar => Box::new(FmaScalar),
        GaugeKind::FmaAvx2 => Box::new(FmaAvx2),
        GaugeKind::FmaAvx512 => Box::new(FmaAvx512),
    }
}

fn build_flush_kernel(kind: FlushKernelKind, name: &str, rank: &RankHandle) -> Box<dyn FlushKernel> {
    match kind {
        FlushKernelKind::None => Box::new(NoneKernel),
        FlushKernelKind::Copy => Box::new(CopyKernel::new(name)),
        FlushKernelKind::Scale => Box::new(ScaleKernel::new(name)),
        FlushKernelKind::Add => Box::new(AddKernel::new(name)),
        FlushKernelKind::Triad => Box::new(TriadKernel::new(name)),
        FlushKernelKind::Pow => Box::new(PowKernel::new(name)),
        FlushKernelKind::Dgemm => Box::new(DgemmKernel::new(name)),
        FlushKernelKind::MpiBcast => {
            let rank = rank.clone();
            Box::new(BroadcastKernel::new(name, move |local: &[f64]| {
                rank.broadcast_f64(local)
            }))
        }
    }
}

fn write_csv(out_dir: &Path, prefix: &str, rank: usize, samples: &[i64]) -> Result<()> {
    let path: PathBuf = out_dir.join(format!("{prefix}_r{rank}.csv"));
    let mut file = File::create(&path).map_err(|source| Error::FileOpenFailed {
        path: path.clone(),
        source,
    })?;
    for sample in samples {
        writeln!(file, "{sample}").map_err(|source| Error::FileOpenFailed {
            path: path.clone(),
            source,
        })?;
    }
    Ok(())
}

fn print_report(report: &Report, ntiles: usize) {
    println!("ntiles={ntiles} ta_n={} tb_n={}", report.ta_all.len(), report.tb_all.len());
    println!("percentile\tgap_ns");
    for gap in &report.quantile_gaps {
        println!("{}\t{}", gap.percentile, gap.gap_ns);
    }
    println!("wasserstein={:.6}", report.wasserstein);
}
