//! tiled-scatter: Run the scatter-nd kernel with random, colliding indices and
//! check the result against a host reference.

use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use tiled_kernels::cli;
use tiled_kernels::registry::hardware::HardwareInfo;
use tiled_kernels::{AccumulationMode, ScatterIndexSet, ScatterKernel, Tensor, TensorDtype};

#[derive(Parser)]
#[command(name = "tiled-scatter", about = "Benchmark the scatter-nd kernel")]
struct Args {
    /// Destination shape as ROWSxCOLS (e.g., "1024x64")
    #[arg(short = 'd', long, default_value = "1024x64", value_parser = validate_dest)]
    dest: (usize, usize),

    /// Number of update rows; indices are drawn uniformly and may collide
    #[arg(short = 'u', long, default_value = "4096")]
    updates: usize,

    /// Accumulation mode: overwrite, sum, max
    #[arg(long, default_value = "sum", value_parser = validate_mode)]
    mode: AccumulationMode,

    /// Element type: f32, f16, bf16, i32
    #[arg(long, default_value = "f32", value_parser = validate_dtype)]
    dtype: TensorDtype,

    /// Timed iterations; the destination is reset before each
    #[arg(short = 'n', long, default_value = "10")]
    iterations: usize,

    /// Random seed for indices and data
    #[arg(short = 's', long, default_value = "0")]
    seed: u64,

    /// Compute backend: auto, cpu, cuda
    #[arg(long, default_value = "auto")]
    backend: String,

    /// Emit a JSON report instead of text
    #[arg(long)]
    json: bool,

    /// Write the JSON report to a file (implies --json)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Enable launch profiling (prints to stderr)
    #[arg(long)]
    profile: bool,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

fn validate_dest(s: &str) -> Result<(usize, usize), String> {
    match cli::parse_dims(s)?.as_slice() {
        &[rows, cols] => Ok((rows, cols)),
        _ => Err(format!("'{}': expected ROWSxCOLS", s)),
    }
}

fn validate_mode(s: &str) -> Result<AccumulationMode, String> {
    AccumulationMode::parse(s)
        .ok_or_else(|| format!("Unknown mode '{}'. Options: overwrite, sum, max", s))
}

fn validate_dtype(s: &str) -> Result<TensorDtype, String> {
    TensorDtype::parse(s)
        .ok_or_else(|| format!("Unknown dtype '{}'. Options: f32, f16, bf16, i32", s))
}

#[derive(Serialize)]
struct Report {
    backend: &'static str,
    hardware: HardwareInfo,
    dtype: &'static str,
    mode: AccumulationMode,
    rows: usize,
    cols: usize,
    updates: usize,
    distinct_rows: usize,
    iterations: usize,
    mean_ms: f64,
    min_ms: f64,
    elements_per_sec: f64,
    max_abs_error: f32,
    passed: bool,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Values exactly representable in every supported dtype.
fn random_values(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-64i32..64) as f32 * 0.25).collect()
}

/// Host reference and, per element, the values an overwrite may leave behind.
fn reference(
    initial: &[f32],
    rows: &[usize],
    updates: &[f32],
    cols: usize,
    mode: AccumulationMode,
) -> (Vec<f64>, Vec<Vec<f32>>) {
    let mut acc: Vec<f64> = initial.iter().map(|&v| v as f64).collect();
    let mut contenders: Vec<Vec<f32>> = vec![Vec::new(); initial.len()];
    for (r, &row) in rows.iter().enumerate() {
        for j in 0..cols {
            let u = updates[r * cols + j];
            let slot = row * cols + j;
            match mode {
                AccumulationMode::Overwrite => contenders[slot].push(u),
                AccumulationMode::Sum => acc[slot] += u as f64,
                AccumulationMode::Max => acc[slot] = acc[slot].max(u as f64),
            }
        }
    }
    (acc, contenders)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.profile {
        std::env::set_var("TILED_PROFILE", "1");
    }
    let (rows, cols) = args.dest;
    let backend = cli::backend::resolve_backend(Some(&args.backend))?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let row_ids: Vec<usize> = (0..args.updates).map(|_| rng.gen_range(0..rows)).collect();
    let initial = random_values(&mut rng, rows * cols);
    let update_vals = random_values(&mut rng, args.updates * cols);

    let indices = ScatterIndexSet::new(row_ids.iter().map(|&r| r as i64).collect());
    let init_host = Tensor::from_f32_as(vec![rows, cols], &initial, args.dtype);
    let upd_host = Tensor::from_f32_as(vec![args.updates, cols], &update_vals, args.dtype);
    let updates = backend.upload(&upd_host)?;

    let mut times = Vec::with_capacity(args.iterations);
    let mut dest = backend.upload(&init_host)?;
    ScatterKernel::execute(backend.as_ref(), &indices, &updates.view(), &dest.view(), args.mode)?;
    backend.sync_device()?;
    backend.reset_profile();
    for _ in 0..args.iterations {
        dest = backend.upload(&init_host)?;
        let start = Instant::now();
        ScatterKernel::execute(backend.as_ref(), &indices, &updates.view(), &dest.view(), args.mode)?;
        backend.sync_device()?;
        times.push(start.elapsed().as_secs_f64() * 1000.0);
    }

    let got = backend.download(&dest.view())?.to_f32_vec();
    let (want, contenders) = reference(
        &init_host.to_f32_vec(),
        &row_ids,
        &upd_host.to_f32_vec(),
        cols,
        args.mode,
    );

    let mut max_abs_error = 0.0f32;
    let mut passed = true;
    for (i, &g) in got.iter().enumerate() {
        if args.mode == AccumulationMode::Overwrite && !contenders[i].is_empty() {
            if !contenders[i].contains(&g) {
                passed = false;
            }
            continue;
        }
        let err = (g as f64 - want[i]).abs() as f32;
        max_abs_error = max_abs_error.max(err);
    }
    // Quarter-steps stay exact in f32 and i32; half types round once per hit.
    let mut hits = vec![0usize; rows];
    for &r in &row_ids {
        hits[r] += 1;
    }
    let max_hits = hits.iter().copied().max().unwrap_or(0) as f32;
    let tolerance = if args.dtype.is_reduced_precision() {
        want.iter().fold(0.0f64, |m, v| m.max(v.abs())) as f32 * args.dtype.epsilon() * max_hits
    } else {
        0.0
    };
    passed &= max_abs_error <= tolerance;

    let mean_ms = if times.is_empty() {
        0.0
    } else {
        times.iter().sum::<f64>() / times.len() as f64
    };
    let min_ms = times.iter().copied().fold(f64::INFINITY, f64::min);
    let min_ms = if min_ms.is_finite() { min_ms } else { 0.0 };
    let elements_per_sec = if mean_ms > 0.0 {
        (args.updates * cols) as f64 / (mean_ms / 1000.0)
    } else {
        0.0
    };

    if args.profile {
        eprintln!("{}", backend.profile_summary());
    }

    let report = Report {
        backend: backend.name(),
        hardware: HardwareInfo::detect(),
        dtype: args.dtype.as_str(),
        mode: args.mode,
        rows,
        cols,
        updates: args.updates,
        distinct_rows: hits.iter().filter(|&&h| h > 0).count(),
        iterations: args.iterations,
        mean_ms,
        min_ms,
        elements_per_sec,
        max_abs_error,
        passed,
    };

    if args.json || args.output.is_some() {
        cli::write_report(&report, args.output.as_deref())?;
    } else {
        println!(
            "{} {} {} {}x{} <- {} rows ({} distinct): {:.3} ms mean, {:.3} ms min, {:.3e} elem/s",
            report.backend,
            report.dtype,
            args.mode.as_str(),
            rows,
            cols,
            args.updates,
            report.distinct_rows,
            mean_ms,
            min_ms,
            elements_per_sec
        );
        println!(
            "max abs error {:.3e}: {}",
            max_abs_error,
            if passed { "ok" } else { "FAILED" }
        );
    }

    if !passed {
        return Err("scatter result differs from host reference".into());
    }
    Ok(())
}
