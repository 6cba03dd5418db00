//! tiled-gemm: Run the tiled GEMM kernel on random operands and report timings.

use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use tiled_kernels::cli;
use tiled_kernels::registry::hardware::HardwareInfo;
use tiled_kernels::{DeviceTensor, GemmKernel, Tensor, TensorDtype, TilePlan};

#[derive(Parser)]
#[command(name = "tiled-gemm", about = "Benchmark the tiled GEMM kernel")]
struct Args {
    /// Problem size as MxNxK (e.g., "512x512x256")
    #[arg(short = 'd', long, default_value = "256x256x256", value_parser = validate_triple)]
    dims: Triple,

    /// Element type: f32, f16, bf16
    #[arg(long, default_value = "f32", value_parser = validate_dtype)]
    dtype: TensorDtype,

    /// Timed iterations after one warmup launch
    #[arg(short = 'n', long, default_value = "10")]
    iterations: usize,

    /// Fixed block tile as BMxBNxBK (overrides the planner)
    #[arg(long, value_parser = validate_triple)]
    tile: Option<Triple>,

    /// Random seed for operand data
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

#[derive(Clone, Copy, Debug)]
struct Triple(usize, usize, usize);

fn validate_triple(s: &str) -> Result<Triple, String> {
    match cli::parse_dims(s)?.as_slice() {
        &[a, b, c] => Ok(Triple(a, b, c)),
        _ => Err(format!("'{}': expected three dimensions, e.g. 64x64x16", s)),
    }
}

fn validate_dtype(s: &str) -> Result<TensorDtype, String> {
    match TensorDtype::parse(s) {
        Some(d) if d.is_float() => Ok(d),
        _ => Err(format!("Unknown dtype '{}'. Options: f32, f16, bf16", s)),
    }
}

#[derive(Serialize)]
struct PlanReport {
    block: [usize; 3],
    thread: [usize; 2],
    threads_per_group: usize,
    groups: usize,
    scratch_bytes: usize,
}

#[derive(Serialize)]
struct Report {
    backend: &'static str,
    hardware: HardwareInfo,
    dtype: &'static str,
    m: usize,
    n: usize,
    k: usize,
    plan: PlanReport,
    iterations: usize,
    mean_ms: f64,
    min_ms: f64,
    gflops: f64,
    max_abs_error: f32,
    tolerance: f32,
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

fn random_operand(rng: &mut StdRng, rows: usize, cols: usize, dtype: TensorDtype) -> Tensor {
    let data: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
    Tensor::from_f32_as(vec![rows, cols], &data, dtype)
}

/// Row-major f64 reference product of the rounded operands.
fn reference(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let acc: f64 = (0..k).map(|p| a[i * k + p] as f64 * b[p * n + j] as f64).sum();
            out[i * n + j] = acc as f32;
        }
    }
    out
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.profile {
        std::env::set_var("TILED_PROFILE", "1");
    }
    let Triple(m, n, k) = args.dims;
    let backend = cli::backend::resolve_backend(Some(&args.backend))?;

    let plan = match args.tile {
        Some(Triple(bm, bn, bk)) => TilePlan::fixed(
            m,
            n,
            k,
            args.dtype.byte_width(),
            (bm, bn, bk),
            (1, 1),
            backend.limits(),
        )?,
        None => backend.plan_gemm(m, n, k, args.dtype)?,
    };

    let mut rng = StdRng::seed_from_u64(args.seed);
    let a_host = random_operand(&mut rng, m, k, args.dtype);
    let b_host = random_operand(&mut rng, k, n, args.dtype);
    let a = backend.upload(&a_host)?;
    let b = backend.upload(&b_host)?;
    let c = DeviceTensor::new(
        backend.alloc(m * n * args.dtype.byte_width())?,
        args.dtype,
        vec![m, n],
    )?;

    GemmKernel::execute(backend.as_ref(), &a.view(), &b.view(), &c.view(), &plan)?;
    backend.sync_device()?;
    backend.reset_profile();

    let mut times = Vec::with_capacity(args.iterations);
    for _ in 0..args.iterations {
        let start = Instant::now();
        GemmKernel::execute(backend.as_ref(), &a.view(), &b.view(), &c.view(), &plan)?;
        backend.sync_device()?;
        times.push(start.elapsed().as_secs_f64() * 1000.0);
    }

    let got = backend.download(&c.view())?.to_f32_vec();
    let want = reference(&a_host.to_f32_vec(), &b_host.to_f32_vec(), m, n, k);
    let max_abs_error = cli::max_abs_diff(&got, &want);
    // Output rounding to the storage type dominates for half precision.
    let tolerance = (k as f32 * f32::EPSILON * 4.0).max(args.dtype.epsilon() * 2.0 * k as f32);

    let mean_ms = if times.is_empty() {
        0.0
    } else {
        times.iter().sum::<f64>() / times.len() as f64
    };
    let min_ms = times.iter().copied().fold(f64::INFINITY, f64::min);
    let min_ms = if min_ms.is_finite() { min_ms } else { 0.0 };
    let gflops = if mean_ms > 0.0 {
        2.0 * (m * n * k) as f64 / (mean_ms * 1e6)
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
        m,
        n,
        k,
        plan: PlanReport {
            block: [plan.block_m(), plan.block_n(), plan.block_k()],
            thread: [plan.thread_m(), plan.thread_n()],
            threads_per_group: plan.threads_per_group(),
            groups: plan.groups(),
            scratch_bytes: plan.scratch_bytes(),
        },
        iterations: args.iterations,
        mean_ms,
        min_ms,
        gflops,
        max_abs_error,
        tolerance,
        passed: max_abs_error <= tolerance,
    };

    if args.json || args.output.is_some() {
        cli::write_report(&report, args.output.as_deref())?;
    } else {
        println!(
            "{} {} {}x{}x{}: block {}x{}x{}, {} groups, {:.3} ms mean, {:.3} ms min, {:.2} GFLOP/s",
            report.backend,
            report.dtype,
            m,
            n,
            k,
            plan.block_m(),
            plan.block_n(),
            plan.block_k(),
            plan.groups(),
            mean_ms,
            min_ms,
            gflops
        );
        println!(
            "max abs error {:.3e} (tolerance {:.3e}): {}",
            max_abs_error,
            tolerance,
            if report.passed { "ok" } else { "FAILED" }
        );
    }

    if !report.passed {
        return Err(format!(
            "result differs from reference by {:.3e} (tolerance {:.3e})",
            max_abs_error, tolerance
        )
        .into());
    }
    Ok(())
}
