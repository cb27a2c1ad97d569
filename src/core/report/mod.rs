//! Throughput aggregation for the benchmark harness.
//!
//! Collects per-structure samples across repeats and writes the best
//! sample per structure as `<structure> <value>` lines, one file per
//! benchmark, ready for plotting.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("no samples were recorded for benchmark {0}")]
    Empty(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct Results {
    name: String,
    values: BTreeMap<String, Vec<u64>>,
}

impl Results {
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn add_result(&mut self, structure: &str, value: u64) {
        self.values
            .entry(structure.to_owned())
            .or_default()
            .push(value);
    }

    pub fn best(&self, structure: &str) -> Option<u64> {
        self.values
            .get(structure)
            .and_then(|samples| samples.iter().copied().max())
    }

    /// Writes `<structure> <best-sample>` lines to `<dir>/<name>.dat`.
    pub fn finish(&self, dir: &Path) -> Result<PathBuf, ReportError> {
        if self.values.is_empty() {
            return Err(ReportError::Empty(self.name.clone()));
        }

        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.dat", self.name));
        let mut file = fs::File::create(&path)?;
        for (structure, samples) in &self.values {
            let best = samples.iter().copied().max().unwrap_or(0);
            writeln!(file, "{structure} {best}")?;
        }
        info!(file = %path.display(), "wrote benchmark results");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn keeps_the_best_sample_per_structure() {
        let mut results = Results::start("unit");
        results.add_result("avltree", 120);
        results.add_result("avltree", 180);
        results.add_result("avltree", 150);
        assert_eq!(results.best("avltree"), Some(180));
        assert_eq!(results.best("cbtree"), None);
    }

    #[test]
    fn finish_writes_one_line_per_structure() {
        let mut results = Results::start("unit-write");
        results.add_result("nbbst", 42);
        results.add_result("lfmst", 77);

        let dir = std::env::temp_dir().join("conset-report-test");
        let path = results.finish(&dir).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("nbbst 42"));
        assert!(text.contains("lfmst 77"));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn finish_rejects_empty_runs() {
        let results = Results::start("unit-empty");
        assert!(results.finish(&std::env::temp_dir()).is_err());
    }
}
