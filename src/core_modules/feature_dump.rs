// THEORY:
// The feature dump is a diagnostic CSV with one row per finalized group: its
// frame, its name, all feature values in classifier order, the final decision
// and the Hough lines it was judged on. It is what a forest gets retrained and
// audited from, so the column order follows the `Feature` enum exactly.

use crate::core_modules::features::Feature;
use crate::core_modules::frame::ProcessedFrame;
use crate::core_modules::hough::Line;
use crate::error::{EraserError, Result};
use std::fs::File;
use std::path::{Path, PathBuf};

pub struct FeatureDump {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: usize,
}

impl FeatureDump {
    /// Creates the file and writes the header row.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path).map_err(|err| write_error(path, err))?;
        let mut header = vec!["frame".to_string(), "group".to_string()];
        header.extend(Feature::ALL.iter().map(|feature| feature.name().to_string()));
        header.extend(["paint", "reason", "score", "lines"].map(String::from));
        writer
            .write_record(&header)
            .map_err(|err| write_error(path, err))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            rows: 0,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Appends one row per group of a finalized frame.
    pub fn append(&mut self, frame: &ProcessedFrame) -> Result<()> {
        for group in &frame.groups {
            let decision = group.decision().or_else(|| frame.decision(&group.tag));
            let mut record = vec![frame.index.to_string(), group.name()];
            record.extend(group.features.values().iter().map(|value| value.to_string()));
            record.push(decision.is_some_and(|d| d.will_paint()).to_string());
            record.push(decision.map(|d| d.reason.to_string()).unwrap_or_default());
            record.push(
                decision
                    .and_then(|d| d.score)
                    .map(|score| score.to_string())
                    .unwrap_or_default(),
            );
            record.push(format_lines(&group.lines));
            self.writer
                .write_record(&record)
                .map_err(|err| write_error(&self.path, err))?;
            self.rows += 1;
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// `theta:rho:count` per line, joined by `;`.
pub fn format_lines(lines: &[Line]) -> String {
    lines
        .iter()
        .map(|line| format!("{}:{}:{}", line.theta, line.rho, line.count))
        .collect::<Vec<_>>()
        .join(";")
}

fn write_error(path: &Path, err: csv::Error) -> EraserError {
    EraserError::Write {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
