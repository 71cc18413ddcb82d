use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use serde_json::json;

use aqsat_extract::domain::{Coordinates, DateRange, Signal};
use aqsat_extract::error::AqError;
use aqsat_extract::fetcher::{RetryingFetcher, Sleeper, call_with_retry};
use aqsat_extract::region::{RegionClient, RegionQuery, RegionTable};

#[derive(Clone, Default)]
struct RecordingSleeper(Arc<Mutex<Vec<Duration>>>);

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.0.lock().unwrap().push(duration);
    }
}

/// Fails the first `failures` calls, then answers with one sample.
struct FlakyRegion {
    failures: usize,
    calls: Mutex<usize>,
}

impl FlakyRegion {
    fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: Mutex::new(0),
        }
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl RegionClient for FlakyRegion {
    fn get_region(&self, query: &RegionQuery) -> Result<RegionTable, AqError> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        if *calls <= self.failures {
            return Err(AqError::BackendStatus {
                status: 429,
                message: "Too many concurrent aggregations".to_string(),
            });
        }
        Ok(RegionTable {
            header: vec!["id".into(), "time".into(), query.band.clone()],
            rows: vec![vec![json!("img"), json!(1_706_745_600_000i64), json!(3.25)]],
        })
    }
}

fn signal() -> Signal {
    Signal {
        name: "NO2".to_string(),
        collection: "COPERNICUS/S5P/NRTI/L3_NO2".parse().unwrap(),
        band: "tropospheric_NO2_column_number_density".to_string(),
        unit: "mol/m^2".to_string(),
    }
}

fn range() -> DateRange {
    DateRange {
        start: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        end: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
    }
}

fn point() -> Coordinates {
    Coordinates::new(28.6473, 77.3185).unwrap()
}

#[test]
fn transient_failure_is_retried_once_after_delay() {
    let client = FlakyRegion::new(1);
    let sleeper = RecordingSleeper::default();
    let fetcher = RetryingFetcher::new(&client, sleeper.clone(), Duration::from_secs(5), 1000);

    let fetch = fetcher.fetch(&signal(), point(), range());
    assert!(!fetch.failed);
    assert_eq!(fetch.samples.len(), 1);
    assert_eq!(fetch.samples[0].date, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
    assert_eq!(fetch.samples[0].value, Some(3.25));
    assert_eq!(client.calls(), 2);
    assert_eq!(*sleeper.0.lock().unwrap(), vec![Duration::from_secs(5)]);
}

#[test]
fn second_failure_yields_empty_series() {
    let client = FlakyRegion::new(usize::MAX);
    let sleeper = RecordingSleeper::default();
    let fetcher = RetryingFetcher::new(&client, sleeper.clone(), Duration::from_secs(5), 1000);

    let fetch = fetcher.fetch(&signal(), point(), range());
    assert!(fetch.failed);
    assert!(fetch.samples.is_empty());
    assert_eq!(client.calls(), 2);
    assert_eq!(sleeper.0.lock().unwrap().len(), 1);
}

#[test]
fn success_does_not_sleep() {
    let sleeper = RecordingSleeper::default();
    let value = call_with_retry(&sleeper, Duration::from_secs(5), "noop", || {
        Ok::<_, AqError>(7)
    })
    .unwrap();
    assert_eq!(value, 7);
    assert!(sleeper.0.lock().unwrap().is_empty());
}
