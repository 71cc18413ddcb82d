use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::driver::{ProgressEvent, ProgressSink, RunSummary};
use crate::hyperlocal::HyperlocalSummary;
use crate::join::JoinReport;
use crate::resume::ResumeState;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

/// Dry-run view printed by `aqsat plan`.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub output: String,
    pub resume: ResumeState,
    pub units_total: usize,
    pub units_skipped: usize,
    pub pending: Vec<String>,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_hyperlocal(summary: &HyperlocalSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_plan(report: &PlanReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_join(report: &JoinReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Interactive sink: every progress event becomes a log line.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}
