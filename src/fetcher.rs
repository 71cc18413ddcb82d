use std::thread;
use std::time::Duration;

use chrono::DateTime;
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{Coordinates, DateRange, Sample, Signal};
use crate::error::AqError;
use crate::region::{RegionClient, RegionQuery, RegionTable};

pub const TIME_COLUMN: &str = "time";

/// Blocking wait used for rate limiting and retry backoff.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

/// Runs `op`, and on error runs it exactly once more after `delay`.
pub fn call_with_retry<T, F>(
    sleeper: &dyn Sleeper,
    delay: Duration,
    label: &str,
    mut op: F,
) -> Result<T, AqError>
where
    F: FnMut() -> Result<T, AqError>,
{
    match op() {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!(%label, error = %err, "request failed, retrying once");
            sleeper.sleep(delay);
            op().inspect_err(|err| warn!(%label, error = %err, "retry failed, skipping"))
        }
    }
}

/// Outcome of one signal fetch. `failed` is set only when both attempts
/// errored; an empty series with `failed == false` means "no data".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesFetch {
    pub samples: Vec<Sample>,
    pub failed: bool,
}

pub struct RetryingFetcher<C: RegionClient, S: Sleeper> {
    client: C,
    sleeper: S,
    retry_delay: Duration,
    scale_m: u32,
}

impl<C: RegionClient, S: Sleeper> RetryingFetcher<C, S> {
    pub fn new(client: C, sleeper: S, retry_delay: Duration, scale_m: u32) -> Self {
        Self {
            client,
            sleeper,
            retry_delay,
            scale_m,
        }
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    pub fn fetch(&self, signal: &Signal, point: Coordinates, range: DateRange) -> SeriesFetch {
        let query = RegionQuery {
            collection: signal.collection.clone(),
            band: signal.band.clone(),
            point,
            range,
            scale_m: self.scale_m,
        };
        let label = format!("{} {}..{}", signal.name, range.start, range.end);
        match call_with_retry(&self.sleeper, self.retry_delay, &label, || {
            self.client.get_region(&query)
        }) {
            Ok(table) => SeriesFetch {
                samples: parse_samples(&table, &signal.band),
                failed: false,
            },
            Err(_) => SeriesFetch {
                samples: Vec::new(),
                failed: true,
            },
        }
    }
}

/// Converts a region table into samples, dropping rows that lack a usable
/// timestamp or carry a non-numeric value.
pub fn parse_samples(table: &RegionTable, band: &str) -> Vec<Sample> {
    if table.rows.is_empty() {
        return Vec::new();
    }
    let (Some(time_index), Some(value_index)) = (table.column(TIME_COLUMN), table.column(band))
    else {
        warn!(header = ?table.header, %band, "region header lacks time or band column");
        return Vec::new();
    };

    let mut samples = Vec::with_capacity(table.rows.len());
    let mut skipped = 0usize;
    for row in &table.rows {
        match parse_row(row, time_index, value_index) {
            Some(sample) => samples.push(sample),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(skipped, %band, "dropped malformed samples");
    }
    samples
}

fn parse_row(row: &[Value], time_index: usize, value_index: usize) -> Option<Sample> {
    let millis = match row.get(time_index)? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|v| v.is_finite()).map(|v| v as i64))?,
        _ => return None,
    };
    let date = DateTime::from_timestamp_millis(millis)?.date_naive();
    let value = match row.get(value_index)? {
        Value::Null => None,
        Value::Number(number) => Some(number.as_f64()?),
        _ => return None,
    };
    Some(Sample { date, value })
}
