use std::{collections::HashMap, fs::File, io::Read, path::Path};

use anyhow::{anyhow, Error};

use crate::AtmosphericParameter;

/// Long-run column means from the archival dataset.
///
/// Built once at startup and shared read-only, usually as `Arc<HistoricalFallback>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoricalFallback {
    means: HashMap<AtmosphericParameter, f64>,
    rows: usize,
}

impl HistoricalFallback {
    pub fn from_csv(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)
            .map_err(|e| anyhow!("failed to open historical data {}: {}", path.display(), e))?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, Error> {
        let mut reader = csv::Reader::from_reader(reader);
        let headers = reader.headers()?.clone();
        let columns: Vec<(AtmosphericParameter, usize)> = AtmosphericParameter::ALL
            .iter()
            .filter_map(|p| {
                headers
                    .iter()
                    .position(|h| h.trim() == p.column())
                    .map(|i| (*p, i))
            })
            .collect();
        if columns.is_empty() {
            return Err(anyhow!("historical data has none of the expected columns"));
        }

        let mut sums: HashMap<AtmosphericParameter, (f64, usize)> = HashMap::new();
        let mut rows = 0;
        for record in reader.records() {
            let record = record?;
            rows += 1;
            for (param, index) in &columns {
                let Some(value) = record
                    .get(*index)
                    .and_then(|v| v.trim().parse::<f64>().ok())
                    .filter(|v| v.is_finite())
                else {
                    continue;
                };
                let entry = sums.entry(*param).or_insert((0.0, 0));
                entry.0 += value;
                entry.1 += 1;
            }
        }

        let means = sums
            .into_iter()
            .filter(|(_, (_, count))| *count > 0)
            .map(|(param, (sum, count))| (param, sum / count as f64))
            .collect();
        Ok(Self { means, rows })
    }

    pub fn from_means(means: impl IntoIterator<Item = (AtmosphericParameter, f64)>) -> Self {
        Self {
            means: means.into_iter().collect(),
            rows: 0,
        }
    }

    pub fn value(&self, param: AtmosphericParameter) -> Option<f64> {
        self.means.get(&param).copied()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }
}
