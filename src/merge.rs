use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use tracing::warn;

use crate::domain::{Record, Sample};

/// Outer-union merge of per-signal series into schema-ordered records.
#[derive(Debug, Clone)]
pub struct SeriesMerger {
    schema: Vec<String>,
}

impl SeriesMerger {
    pub fn new<I, T>(schema: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            schema: schema.into_iter().map(Into::into).collect(),
        }
    }

    /// Every date seen in any series yields one record, sorted ascending.
    /// Within a series the first sample for a date wins. Series whose name is
    /// not part of the schema are ignored.
    pub fn merge(&self, series: &[(&str, &[Sample])], location: &str) -> Vec<Record> {
        let width = self.schema.len();
        let mut rows: BTreeMap<NaiveDate, Vec<Option<f64>>> = BTreeMap::new();
        let mut claimed: HashSet<(usize, NaiveDate)> = HashSet::new();

        for (name, samples) in series {
            let Some(column) = self.schema.iter().position(|s| s.as_str() == *name) else {
                warn!(signal = %name, "series not in schema, ignoring");
                continue;
            };
            for sample in samples.iter() {
                if claimed.insert((column, sample.date)) {
                    rows.entry(sample.date).or_insert_with(|| vec![None; width])[column] =
                        sample.value;
                }
            }
        }

        rows.into_iter()
            .map(|(date, values)| Record {
                date,
                values,
                location: location.to_string(),
            })
            .collect()
    }
}
