use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8PathBuf;
use csv::{StringRecord, WriterBuilder};
use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::ResolvedConfig;
use crate::error::AqError;
use crate::fs_util::write_atomic;
use crate::hyperlocal::HYPERLOCAL_HEADER;

#[derive(Debug, Clone, Serialize)]
pub struct JoinReport {
    pub output: String,
    pub rows_written: usize,
    pub rows_with_features: usize,
    pub duplicate_rows_dropped: usize,
    pub common: Vec<String>,
    pub only_features: Vec<String>,
    pub only_series: Vec<String>,
}

/// Left join of the satellite store onto the hyperlocal store, keyed on
/// `location` = `station` after aliasing.
pub struct FeatureJoin {
    series: CheckpointStore,
    features: CheckpointStore,
    output: Utf8PathBuf,
    aliases: BTreeMap<String, String>,
}

impl FeatureJoin {
    pub fn new(config: &ResolvedConfig) -> Self {
        Self {
            series: CheckpointStore::new(
                config.output.clone(),
                config.header(),
                config.min_resume_bytes,
            ),
            features: CheckpointStore::new(
                config.hyperlocal.output.clone(),
                HYPERLOCAL_HEADER.iter().map(|s| s.to_string()).collect(),
                config.min_resume_bytes,
            ),
            output: config.merge.output.clone(),
            aliases: config.merge.station_aliases.clone(),
        }
    }

    /// Satellite columns followed by every feature column except `station`.
    pub fn header(&self) -> Vec<String> {
        self.series
            .header()
            .iter()
            .cloned()
            .chain(self.features.header().iter().skip(1).cloned())
            .collect()
    }

    /// Rows come out sorted by (location, date). A (location, date) pair
    /// repeated at a resume boundary keeps its last occurrence.
    pub fn run(&self) -> Result<JoinReport, AqError> {
        let series_rows = self.series.read_rows()?;
        let feature_rows = self.features.read_rows()?;

        let mut features: BTreeMap<String, StringRecord> = BTreeMap::new();
        for row in feature_rows {
            let station = row.get(0).unwrap_or_default();
            let location = self
                .aliases
                .get(station)
                .map_or(station, String::as_str)
                .to_string();
            if features.contains_key(&location) {
                warn!(station, "station listed twice in feature store, keeping first");
                continue;
            }
            features.insert(location, row);
        }

        let location_column = self.series.header().len() - 1;
        let total = series_rows.len();
        let mut joined: BTreeMap<(String, String), StringRecord> = BTreeMap::new();
        for row in series_rows {
            let location = row.get(location_column).unwrap_or_default().to_string();
            let date = row.get(0).unwrap_or_default().to_string();
            joined.insert((location, date), row);
        }
        let duplicate_rows_dropped = total - joined.len();

        let locations: BTreeSet<&str> = joined.keys().map(|(location, _)| location.as_str()).collect();
        let stations: BTreeSet<&str> = features.keys().map(String::as_str).collect();
        let common: Vec<String> = locations.intersection(&stations).map(|s| s.to_string()).collect();
        let only_features: Vec<String> = stations.difference(&locations).map(|s| s.to_string()).collect();
        let only_series: Vec<String> = locations.difference(&stations).map(|s| s.to_string()).collect();
        if !only_series.is_empty() {
            warn!(locations = ?only_series, "locations without hyperlocal features");
        }

        let empty = vec![""; self.features.header().len() - 1];
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
        writer.write_record(self.header()).map_err(csv_error)?;
        let mut rows_with_features = 0;
        for ((location, _), row) in &joined {
            let extra: Vec<&str> = match features.get(location) {
                Some(feature) => {
                    rows_with_features += 1;
                    feature.iter().skip(1).collect()
                }
                None => empty.clone(),
            };
            writer
                .write_record(row.iter().chain(extra))
                .map_err(csv_error)?;
        }
        let bytes = writer.into_inner().map_err(|err| AqError::Filesystem(err.to_string()))?;
        write_atomic(self.output.as_std_path(), &bytes)?;

        info!(
            output = %self.output,
            rows = joined.len(),
            rows_with_features,
            "joined hyperlocal features onto satellite series"
        );
        Ok(JoinReport {
            output: self.output.to_string(),
            rows_written: joined.len(),
            rows_with_features,
            duplicate_rows_dropped,
            common,
            only_features,
            only_series,
        })
    }
}

fn csv_error(err: csv::Error) -> AqError {
    AqError::Filesystem(err.to_string())
}
