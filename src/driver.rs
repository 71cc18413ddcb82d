use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::ResolvedConfig;
use crate::domain::{Location, Period, Sample, Signal, WorkUnit};
use crate::error::AqError;
use crate::fetcher::{RetryingFetcher, Sleeper};
use crate::merge::SeriesMerger;
use crate::region::RegionClient;
use crate::resume::{ResumePlan, ResumeState, plan_units};
use crate::units::enumerate_units;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
    pub unit: Option<UnitOutcome>,
}

impl ProgressEvent {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
            unit: None,
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Shared stop flag, checked between units.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitOutcome {
    pub location: String,
    pub period: Period,
    pub succeeded: usize,
    pub empty: usize,
    pub failed: usize,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub output: String,
    pub resume: ResumeState,
    pub discarded_corrupt_store: bool,
    pub units_total: usize,
    pub units_skipped: usize,
    pub units_processed: usize,
    pub units_empty: usize,
    pub records_written: usize,
    pub failed_signal_calls: usize,
    pub cancelled: bool,
}

pub struct ExtractionDriver<C: RegionClient, S: Sleeper> {
    fetcher: RetryingFetcher<C, S>,
    merger: SeriesMerger,
    store: CheckpointStore,
    signals: Vec<Signal>,
    locations: Vec<Location>,
    start_year: i32,
    call_delay: Duration,
}

impl<C: RegionClient, S: Sleeper> ExtractionDriver<C, S> {
    pub fn new(config: &ResolvedConfig, client: C, sleeper: S) -> Self {
        Self {
            fetcher: RetryingFetcher::new(client, sleeper, config.retry_delay, config.scale_m),
            merger: SeriesMerger::new(config.signals.iter().map(|signal| signal.name.clone())),
            store: CheckpointStore::new(
                config.output.clone(),
                config.header(),
                config.min_resume_bytes,
            ),
            signals: config.signals.clone(),
            locations: config.locations.clone(),
            start_year: config.start_year,
            call_delay: config.call_delay,
        }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Read-only view of what a run would do. A corrupt store is reported
    /// as an error rather than discarded.
    pub fn plan(&self, today: NaiveDate) -> Result<ResumePlan, AqError> {
        let checkpoint = self.store.read_last_unit()?;
        let units = enumerate_units(&self.locations, self.start_year, today);
        Ok(plan_units(&units, checkpoint.as_ref()))
    }

    pub fn run(
        &self,
        today: NaiveDate,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, AqError> {
        let mut discarded = false;
        let checkpoint = match self.store.read_last_unit() {
            Ok(checkpoint) => checkpoint,
            Err(err @ AqError::CorruptCheckpoint { .. }) => {
                warn!(error = %err, "checkpoint store unreadable, starting from scratch");
                sink.event(ProgressEvent::message(format!(
                    "phase=Resume; discarding corrupt store: {err}"
                )));
                self.store.discard()?;
                discarded = true;
                None
            }
            Err(err) => return Err(err),
        };
        if self.store.ensure_header()? {
            info!(path = %self.store.path(), "created new output file");
        }

        let units = enumerate_units(&self.locations, self.start_year, today);
        let plan = plan_units(&units, checkpoint.as_ref());
        sink.event(ProgressEvent::message(format!(
            "phase=Resume; {}; {} of {} units pending",
            describe(&plan.state),
            plan.pending.len(),
            units.len()
        )));

        let mut summary = RunSummary {
            output: self.store.path().to_string(),
            resume: plan.state.clone(),
            discarded_corrupt_store: discarded,
            units_total: units.len(),
            units_skipped: plan.skipped,
            units_processed: 0,
            units_empty: 0,
            records_written: 0,
            failed_signal_calls: 0,
            cancelled: false,
        };

        for unit in &plan.pending {
            if cancel.is_cancelled() {
                info!(next = %unit, "cancelled before unit");
                summary.cancelled = true;
                break;
            }
            let start = Instant::now();
            let outcome = self.process_unit(unit, today)?;
            summary.units_processed += 1;
            summary.records_written += outcome.records;
            summary.failed_signal_calls += outcome.failed;
            if outcome.records == 0 {
                summary.units_empty += 1;
            }
            sink.event(ProgressEvent {
                message: format!(
                    "phase=Store; {unit}: {} records, {} ok, {} empty, {} failed",
                    outcome.records, outcome.succeeded, outcome.empty, outcome.failed
                ),
                elapsed: Some(start.elapsed()),
                unit: Some(outcome),
            });
        }

        if !summary.cancelled {
            info!(path = %self.store.path(), records = summary.records_written, "extraction complete");
        }
        Ok(summary)
    }

    fn process_unit(&self, unit: &WorkUnit, today: NaiveDate) -> Result<UnitOutcome, AqError> {
        let range = unit.period.date_range(today);
        info!(unit = %unit, "processing");

        let fetched = self
            .signals
            .iter()
            .map(|signal| {
                self.fetcher.sleeper().sleep(self.call_delay);
                self.fetcher.fetch(signal, unit.location.coordinates, range)
            })
            .collect::<Vec<_>>();

        let series = self
            .signals
            .iter()
            .zip(&fetched)
            .map(|(signal, fetch)| (signal.name.as_str(), fetch.samples.as_slice()))
            .collect::<Vec<(&str, &[Sample])>>();
        let records = self.merger.merge(&series, &unit.location.name);
        let written = self.store.append(&records)?;

        let failed = fetched.iter().filter(|fetch| fetch.failed).count();
        let succeeded = fetched
            .iter()
            .filter(|fetch| !fetch.failed && !fetch.samples.is_empty())
            .count();
        if written == 0 {
            warn!(unit = %unit, failed, "no data for unit");
        }
        Ok(UnitOutcome {
            location: unit.location.name.clone(),
            period: unit.period,
            succeeded,
            empty: fetched.len() - failed - succeeded,
            failed,
            records: written,
        })
    }
}

pub fn describe(state: &ResumeState) -> String {
    match state {
        ResumeState::Fresh => "starting fresh".to_string(),
        ResumeState::PartialLocation { location, period } => {
            format!("resuming {location} at {period}")
        }
        ResumeState::LocationComplete { location } => {
            format!("resuming after {location}")
        }
    }
}
