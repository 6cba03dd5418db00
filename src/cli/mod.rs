//! Shared CLI utilities for the benchmark binaries.

pub mod backend;

use std::path::Path;

use serde::Serialize;

use crate::error::Result;

/// Initialize tracing/logging to stderr.
///
/// If `disable` is true, no output is produced.
/// Otherwise respects `RUST_LOG` env var, defaulting to WARN.
pub fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Serialize `report` as pretty JSON to `path`, or to stdout when `path` is `None`.
pub fn write_report<T: Serialize>(report: &T, path: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    match path {
        Some(p) => std::fs::write(p, json + "\n")?,
        None => println!("{}", json),
    }
    Ok(())
}

/// Parse a dimension list like `"128x64x32"` or `"4,4"`.
pub fn parse_dims(s: &str) -> std::result::Result<Vec<usize>, String> {
    let dims: std::result::Result<Vec<usize>, _> = s
        .split(|c| c == 'x' || c == ',')
        .map(|part| part.trim().parse::<usize>())
        .collect();
    match dims {
        Ok(d) if !d.is_empty() && d.iter().all(|&v| v > 0) => Ok(d),
        Ok(_) => Err(format!("'{}': dimensions must be positive", s)),
        Err(_) => Err(format!("'{}' is not a dimension list (e.g. 128x64x32)", s)),
    }
}

/// Largest absolute elementwise difference between two equally sized slices.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dims_separators() {
        assert_eq!(parse_dims("128x64x32").unwrap(), vec![128, 64, 32]);
        assert_eq!(parse_dims("4,4").unwrap(), vec![4, 4]);
        assert_eq!(parse_dims("7").unwrap(), vec![7]);
    }

    #[test]
    fn test_parse_dims_rejects_zero_and_garbage() {
        assert!(parse_dims("4x0").unwrap_err().contains("positive"));
        assert!(parse_dims("axb").unwrap_err().contains("not a dimension list"));
        assert!(parse_dims("").is_err());
    }

    #[test]
    fn test_write_report_to_file() {
        #[derive(Serialize)]
        struct Report {
            backend: &'static str,
            ms: f64,
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_report(&Report { backend: "cpu", ms: 1.5 }, Some(&path)).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["backend"], "cpu");
        assert_eq!(parsed["ms"], 1.5);
    }

    #[test]
    fn test_write_report_bad_path() {
        let err = write_report(&1u32, Some(Path::new("/nonexistent/dir/out.json")));
        assert!(err.is_err());
    }

    #[test]
    fn test_max_abs_diff() {
        assert_eq!(max_abs_diff(&[1.0, 2.0], &[1.0, 2.5]), 0.5);
        assert_eq!(max_abs_diff(&[], &[]), 0.0);
    }

    #[test]
    fn test_init_logging_disabled_does_not_panic() {
        init_logging(true);
    }
}
