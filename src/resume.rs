use serde::Serialize;
use tracing::warn;

use crate::checkpoint::CheckpointState;
use crate::domain::{Location, Period, WorkUnit};

/// Where a run starts relative to the configured unit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResumeState {
    Fresh,
    /// Resume inside `location`, re-running `period` first.
    PartialLocation { location: String, period: Period },
    /// `location` and every location before it are done.
    LocationComplete { location: String },
}

#[derive(Debug, Clone)]
pub struct ResumePlan {
    pub state: ResumeState,
    pub pending: Vec<WorkUnit>,
    pub skipped: usize,
}

/// Filters the ordered unit list against the last checkpoint. Units are never
/// reordered; the checkpointed period itself is pending again, so its rows
/// may appear twice in the store.
pub fn plan_units(units: &[WorkUnit], checkpoint: Option<&CheckpointState>) -> ResumePlan {
    let fresh = || ResumePlan {
        state: ResumeState::Fresh,
        pending: units.to_vec(),
        skipped: 0,
    };
    let Some(checkpoint) = checkpoint else {
        return fresh();
    };

    let Some(first) = units
        .iter()
        .position(|unit| unit.location.name == checkpoint.location)
    else {
        warn!(location = %checkpoint.location, "checkpoint location is not configured, starting fresh");
        return fresh();
    };
    let span = units[first..]
        .iter()
        .take_while(|unit| unit.location.name == checkpoint.location)
        .count();
    let last = first + span - 1;
    let period = Period::containing(checkpoint.date);

    if period >= units[last].period {
        let start = last + 1;
        return ResumePlan {
            state: ResumeState::LocationComplete {
                location: checkpoint.location.clone(),
            },
            pending: units[start..].to_vec(),
            skipped: start,
        };
    }

    match units[first..=last]
        .iter()
        .position(|unit| unit.period == period)
    {
        Some(offset) => {
            let start = first + offset;
            ResumePlan {
                state: ResumeState::PartialLocation {
                    location: checkpoint.location.clone(),
                    period,
                },
                pending: units[start..].to_vec(),
                skipped: start,
            }
        }
        None => {
            warn!(
                location = %checkpoint.location,
                date = %checkpoint.date,
                "checkpoint date precedes the configured span, starting fresh"
            );
            fresh()
        }
    }
}

/// Station variant: each station row is atomic, so the last stored station
/// and everything before it are skipped.
pub fn plan_stations(stations: &[Location], last_station: Option<&str>) -> (ResumeState, Vec<Location>) {
    let Some(last_station) = last_station else {
        return (ResumeState::Fresh, stations.to_vec());
    };
    match stations.iter().position(|station| station.name == last_station) {
        Some(index) => (
            ResumeState::LocationComplete {
                location: last_station.to_string(),
            },
            stations[index + 1..].to_vec(),
        ),
        None => {
            warn!(station = %last_station, "checkpoint station is not configured, starting fresh");
            (ResumeState::Fresh, stations.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::enumerate_units;
    use chrono::NaiveDate;

    fn units() -> Vec<WorkUnit> {
        let locations = vec![
            Location::new("A", 1.0, 1.0).unwrap(),
            Location::new("B", 2.0, 2.0).unwrap(),
            Location::new("C", 3.0, 3.0).unwrap(),
        ];
        enumerate_units(&locations, 2024, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap())
    }

    fn checkpoint(location: &str, y: i32, m: u32, d: u32) -> CheckpointState {
        CheckpointState {
            location: location.to_string(),
            date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
        }
    }

    fn labels(plan: &ResumePlan) -> Vec<String> {
        plan.pending.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn no_checkpoint_is_fresh() {
        let plan = plan_units(&units(), None);
        assert_eq!(plan.state, ResumeState::Fresh);
        assert_eq!(plan.pending.len(), 9);
    }

    #[test]
    fn partial_location_reruns_checkpointed_period() {
        let plan = plan_units(&units(), Some(&checkpoint("B", 2024, 2, 10)));
        assert_eq!(
            plan.state,
            ResumeState::PartialLocation {
                location: "B".to_string(),
                period: Period::new(2024, 2).unwrap(),
            }
        );
        assert_eq!(plan.skipped, 4);
        assert_eq!(
            labels(&plan),
            vec!["B 2024-02", "B 2024-03", "C 2024-01", "C 2024-02", "C 2024-03"]
        );
    }

    #[test]
    fn final_period_completes_location() {
        let plan = plan_units(&units(), Some(&checkpoint("B", 2024, 3, 14)));
        assert_eq!(
            plan.state,
            ResumeState::LocationComplete {
                location: "B".to_string()
            }
        );
        assert_eq!(labels(&plan), vec!["C 2024-01", "C 2024-02", "C 2024-03"]);
    }

    #[test]
    fn unknown_location_or_early_date_is_fresh() {
        assert_eq!(
            plan_units(&units(), Some(&checkpoint("Z", 2024, 1, 1))).state,
            ResumeState::Fresh
        );
        assert_eq!(
            plan_units(&units(), Some(&checkpoint("B", 2019, 1, 1))).state,
            ResumeState::Fresh
        );
    }

    #[test]
    fn stations_skip_through_last_written() {
        let stations = vec![
            Location::new("A", 1.0, 1.0).unwrap(),
            Location::new("B", 2.0, 2.0).unwrap(),
        ];
        let (state, pending) = plan_stations(&stations, Some("A"));
        assert_matches::assert_matches!(state, ResumeState::LocationComplete { .. });
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "B");
        assert_eq!(plan_stations(&stations, Some("Q")).1.len(), 2);
    }
}
