// SPDX-License-Identifier: Apache-2.0

//! CLI parsing and the immutable `Options` record for `partes`.
//!
//! `Cli::try_parse` (via `clap`'s derive API) produces a raw [`Cli`]; feed
//! it through [`Options::from_cli`] to get a validated, immutable
//! [`Options`]. Validation collects every violation into a single
//! [`partes_error::Error::InvalidArgument`] rather than stopping at the
//! first one, so a misconfigured run gets one complete error report --
//! except for a missing mandatory flag, which is its own
//! [`partes_error::Error::MissingArgument`] and short-circuits immediately.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use partes_error::{Error, Result};

/// Time source selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum TimerKind {
    /// POSIX monotonic clock.
    ClockGettime,
    /// Communicator wall-time function.
    MpiWtime,
    /// Asymmetric serialised TSC read pair (x86-64 only).
    TscAsym,
}

/// Gauge kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum GaugeKind {
    /// Integer subtract loop.
    SubScalar,
    /// Scalar FMA loop.
    FmaScalar,
    /// 256-bit wide FMA loop (AVX2).
    #[value(name = "fma_avx2")]
    FmaAvx2,
    /// 512-bit wide FMA loop (AVX-512).
    #[value(name = "fma_avx512")]
    FmaAvx512,
}

/// Flush-kernel family selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum FlushKernelKind {
    /// No memory traffic.
    None,
    /// `a[i] = k*b[i] + c[i]`.
    Triad,
    /// `a[i] = k*b[i]; b[i] = k*a[i]`.
    Scale,
    /// `a[i] = b[i]`.
    Copy,
    /// `a[i] = b[i] + c[i]`.
    Add,
    /// `a[i] = pow(b[i], p)`.
    Pow,
    /// Dense matrix multiply with an identity `B`.
    Dgemm,
    /// Distributed broadcast.
    MpiBcast,
}

/// Raw command-line flags, parsed but not yet validated.
#[derive(Debug, Parser)]
#[command(name = "partes", about = "Parallel timing-error sensor")]
pub struct Cli {
    /// Lower target interval, nanoseconds.
    ///
    /// Not marked `required` in clap: a missing mandatory flag must surface
    /// as `Error::MissingArgument` (exit 6) through `Options::from_cli`,
    /// not as clap's own usage-error exit code.
    #[arg(long)]
    pub ta: Option<i64>,

    /// Upper target interval, nanoseconds.
    #[arg(long)]
    pub tb: Option<i64>,

    /// Measurements per target.
    #[arg(long, default_value_t = 1000)]
    pub ntests: i64,

    /// CDF resolution.
    #[arg(long, default_value_t = 100)]
    pub ntiles: i32,

    /// Tail-trim fraction for Wasserstein distance, in `(0, 1]`.
    #[arg(long = "cut-p", default_value_t = 1.0)]
    pub cut_p: f64,

    /// Front-flush kernel.
    #[arg(long = "fkern", value_enum, default_value_t = FlushKernelKind::None)]
    pub fkern: FlushKernelKind,

    /// Rear-flush kernel.
    #[arg(long = "rkern", value_enum, default_value_t = FlushKernelKind::None)]
    pub rkern: FlushKernelKind,

    /// Requested front-flush working set at target `t_a`, KiB.
    #[arg(long = "fsize-a", default_value_t = 0)]
    pub fsize_a: usize,

    /// Requested front-flush working set at target `t_b`, KiB.
    #[arg(long = "fsize-b", default_value_t = 0)]
    pub fsize_b: usize,

    /// Requested rear-flush working set at target `t_a`, KiB.
    #[arg(long = "rsize-a", default_value_t = 0)]
    pub rsize_a: usize,

    /// Requested rear-flush working set at target `t_b`, KiB.
    #[arg(long = "rsize-b", default_value_t = 0)]
    pub rsize_b: usize,

    /// Time source.
    #[arg(long, value_enum, default_value_t = TimerKind::ClockGettime)]
    pub timer: TimerKind,

    /// Gauge kernel.
    #[arg(long, value_enum, default_value_t = GaugeKind::SubScalar)]
    pub gauge: GaugeKind,

    /// Number of simulated ranks.
    #[arg(long, default_value_t = 1)]
    pub nrank: usize,

    /// Pin each rank to a distinct physical core.
    #[arg(long, default_value_t = false)]
    pub core_pin: bool,

    /// Log filter, `tracing_subscriber::EnvFilter` syntax; falls back to
    /// `RUST_LOG`, then `info`.
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// Directory for per-rank CSV output.
    #[arg(long = "out-dir", default_value = ".")]
    pub out_dir: PathBuf,
}

/// Validated, immutable configuration for a run.
///
/// Carries only the *requested* flush-kernel sizes; actual post-rounding
/// sizes are returned by `FlushKernel::init` at runtime and reported
/// alongside the measurement output rather than folded back into this
/// record (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct Options {
    pub ta: i64,
    pub tb: i64,
    pub ntests: i64,
    pub ntiles: i32,
    pub cut_p: f64,
    pub fkern: FlushKernelKind,
    pub rkern: FlushKernelKind,
    pub fsize_a: usize,
    pub fsize_b: usize,
    pub rsize_a: usize,
    pub rsize_b: usize,
    pub timer: TimerKind,
    pub gauge: GaugeKind,
    pub nrank: usize,
    pub core_pin: bool,
    pub log_level: Option<String>,
    pub out_dir: PathBuf,
}

impl Options {
    /// Validate `cli`, collecting every violation before returning.
    ///
    /// Mandatory flags are checked first and independently of the
    /// accumulated-violations path below: a missing `--ta`/`--tb` must exit
    /// 6 (`Error::MissingArgument`), not 5 (`Error::InvalidArgument`), so it
    /// cannot simply join the `errors` list.
    pub fn from_cli(cli: Cli) -> Result<Options> {
        let ta = cli.ta.ok_or_else(|| Error::MissingArgument {
            flag: "ta".to_string(),
        })?;
        let tb = cli.tb.ok_or_else(|| Error::MissingArgument {
            flag: "tb".to_string(),
        })?;

        let mut errors = Vec::new();

        if ta <= 0 {
            errors.push(format!("--ta must be positive, got {ta}"));
        }
        if tb <= 0 {
            errors.push(format!("--tb must be positive, got {tb}"));
        }
        if ta > 0 && tb > 0 && ta > tb {
            errors.push(format!("--ta ({ta}) must be <= --tb ({tb})"));
        }
        if cli.ntests < 1 {
            errors.push(format!("--ntests must be >= 1, got {}", cli.ntests));
        }
        if cli.ntiles < 2 {
            errors.push(format!("--ntiles must be >= 2, got {}", cli.ntiles));
        }
        if !(cli.cut_p > 0.0 && cli.cut_p <= 1.0) {
            errors.push(format!(
                "--cut-p must be in (0, 1], got {}",
                cli.cut_p
            ));
        }
        if cli.nrank < 1 {
            errors.push(format!("--nrank must be >= 1, got {}", cli.nrank));
        }

        if !errors.is_empty() {
            return Err(Error::InvalidArgument { errors });
        }

        Ok(Options {
            ta,
            tb,
            ntests: cli.ntests,
            ntiles: cli.ntiles,
            cut_p: cli.cut_p,
            fkern: cli.fkern,
            rkern: cli.rkern,
            fsize_a: cli.fsize_a,
            fsize_b: cli.fsize_b,
            rsize_a: cli.rsize_a,
            rsize_b: cli.rsize_b,
            timer: cli.timer,
            gauge: cli.gauge,
            nrank: cli.nrank,
            core_pin: cli.core_pin,
            log_level: cli.log_level,
            out_dir: cli.out_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            ta: Some(1_000_000),
            tb: Some(2_000_000),
            ntests: 1000,
            ntiles: 100,
            cut_p: 1.0,
            fkern: FlushKernelKind::None,
            rkern: FlushKernelKind::None,
            fsize_a: 0,
            fsize_b: 0,
            rsize_a: 0,
            rsize_b: 0,
            timer: TimerKind::ClockGettime,
            gauge: GaugeKind::SubScalar,
            nrank: 1,
            core_pin: false,
            log_level: None,
            out_dir: PathBuf::from("."),
        }
    }

    #[test]
    fn valid_cli_round_trips_into_options() {
        let opts = Options::from_cli(base_cli()).unwrap();
        assert_eq!(opts.ta, 1_000_000);
        assert_eq!(opts.tb, 2_000_000);
    }

    #[test]
    fn ta_greater_than_tb_is_rejected() {
        let mut cli = base_cli();
        cli.ta = Some(10);
        cli.tb = Some(5);
        let err = Options::from_cli(cli).unwrap_err();
        assert_eq!(err.ordinal(), 5);
        assert!(err.to_string().contains("--ta"));
    }

    #[test]
    fn equal_ta_and_tb_is_permitted() {
        let mut cli = base_cli();
        cli.ta = Some(1000);
        cli.tb = Some(1000);
        assert!(Options::from_cli(cli).is_ok());
    }

    #[test]
    fn multiple_violations_are_all_collected() {
        let mut cli = base_cli();
        cli.ta = Some(-1);
        cli.cut_p = 2.0;
        cli.ntiles = 1;
        let err = Options::from_cli(cli).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("--ta"));
        assert!(message.contains("--cut-p"));
        assert!(message.contains("--ntiles"));
    }

    #[test]
    fn missing_ta_is_reported_as_missing_argument() {
        let mut cli = base_cli();
        cli.ta = None;
        let err = Options::from_cli(cli).unwrap_err();
        assert_eq!(err.ordinal(), 6);
        assert!(matches!(err, Error::MissingArgument { ref flag } if flag == "ta"));
    }

    #[test]
    fn missing_tb_is_reported_as_missing_argument() {
        let mut cli = base_cli();
        cli.tb = None;
        let err = Options::from_cli(cli).unwrap_err();
        assert_eq!(err.ordinal(), 6);
        assert!(matches!(err, Error::MissingArgument { ref flag } if flag == "tb"));
    }
}
