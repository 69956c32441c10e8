//! # Summaries and Sinks
//!
//! Training and evaluation steps produce a [`Summary`] of named scalars and
//! histograms. Summaries go to a [`SummarySink`]; model state goes to a
//! [`CheckpointSink`]. Both are fire-and-forget from the loop's point of
//! view: a failing sink is logged and the run continues.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Distribution statistics of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub sum_squares: f64,
    pub count: usize,
}

impl Histogram {
    /// Summarize every element of `tensor`.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let flat = tensor.to_dtype(DType::F32)?.flatten_all()?;
        let count = flat.elem_count();
        if count == 0 {
            return Ok(Self {
                min: 0.0,
                max: 0.0,
                sum: 0.0,
                sum_squares: 0.0,
                count,
            });
        }
        Ok(Self {
            min: f64::from(flat.min(0)?.to_scalar::<f32>()?),
            max: f64::from(flat.max(0)?.to_scalar::<f32>()?),
            sum: f64::from(flat.sum_all()?.to_scalar::<f32>()?),
            sum_squares: f64::from(flat.sqr()?.sum_all()?.to_scalar::<f32>()?),
            count,
        })
    }

    /// Mean of the summarized values.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Fraction of exactly-zero elements in `tensor`.
pub fn zero_fraction(tensor: &Tensor) -> Result<f64> {
    if tensor.elem_count() == 0 {
        return Ok(0.0);
    }
    let zeros = tensor.eq(0.0)?.to_dtype(DType::F32)?.mean_all()?;
    Ok(f64::from(zeros.to_scalar::<f32>()?))
}

/// Named scalars and histograms recorded for one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub scalars: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, Histogram>,
}

impl Summary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a scalar, replacing any previous value under `name`.
    pub fn scalar(&mut self, name: impl Into<String>, value: f64) {
        self.scalars.insert(name.into(), value);
    }

    /// Record a histogram, replacing any previous value under `name`.
    pub fn histogram(&mut self, name: impl Into<String>, histogram: Histogram) {
        self.histograms.insert(name.into(), histogram);
    }

    /// Look up a scalar.
    pub fn get_scalar(&self, name: &str) -> Option<f64> {
        self.scalars.get(name).copied()
    }
}

/// Destination for per-step summaries.
pub trait SummarySink {
    /// Record `summary` for global step `step`.
    fn write(&mut self, step: u64, summary: &Summary) -> Result<()>;
}

/// Destination for model state.
pub trait CheckpointSink {
    /// Persist the current model state for `step` and return where it went.
    fn save(&mut self, step: u64) -> Result<PathBuf>;
}

#[derive(Serialize)]
struct Event<'a> {
    step: u64,
    wall_time: f64,
    #[serde(flatten)]
    summary: &'a Summary,
}

/// Appends one JSON object per summary to `<dir>/events.jsonl`.
pub struct JsonlSummaryWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSummaryWriter {
    /// Open (creating if needed) the event file under `dir`.
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join("events.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Location of the event file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SummarySink for JsonlSummaryWriter {
    fn write(&mut self, step: u64, summary: &Summary) -> Result<()> {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let event = Event {
            step,
            wall_time,
            summary,
        };
        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn histogram_statistics() {
        let t = Tensor::new(&[[1.0f32, -2.0], [3.0, 0.0]], &Device::Cpu).unwrap();
        let h = Histogram::from_tensor(&t).unwrap();
        assert_eq!(h.count, 4);
        assert_abs_diff_eq!(h.min, -2.0);
        assert_abs_diff_eq!(h.max, 3.0);
        assert_abs_diff_eq!(h.sum, 2.0);
        assert_abs_diff_eq!(h.sum_squares, 14.0);
        assert_abs_diff_eq!(h.mean(), 0.5);
    }

    #[test]
    fn zero_fraction_counts_exact_zeros() {
        let t = Tensor::new(&[0.0f32, 1.0, 0.0, 0.5], &Device::Cpu).unwrap();
        assert_abs_diff_eq!(zero_fraction(&t).unwrap(), 0.5);
    }

    #[test]
    fn jsonl_writer_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = JsonlSummaryWriter::create(dir.path().join("train")).unwrap();

        let mut summary = Summary::new();
        summary.scalar("loss", 1.5);
        summary.scalar("accuracy", 0.25);
        writer.write(1, &summary).unwrap();
        writer.write(2, &summary).unwrap();

        let content = std::fs::read_to_string(writer.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let event: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(event["step"], 2);
        assert_eq!(event["scalars"]["loss"], 1.5);
    }
}
