use chrono::NaiveDate;

use aqsat_extract::checkpoint::CheckpointState;
use aqsat_extract::domain::{Location, Period};
use aqsat_extract::resume::{ResumeState, plan_units};
use aqsat_extract::units::enumerate_units;

fn locations() -> Vec<Location> {
    ["Anand Vihar", "RK Puram", "Punjabi Bagh"]
        .iter()
        .enumerate()
        .map(|(i, name)| Location::new(name, 28.0 + i as f64 / 10.0, 77.0).unwrap())
        .collect()
}

#[test]
fn resume_never_revisits_earlier_locations() {
    let today = NaiveDate::from_ymd_opt(2021, 6, 3).unwrap();
    let units = enumerate_units(&locations(), 2020, today);
    assert_eq!(units.len(), 3 * 18);

    for (index, unit) in units.iter().enumerate() {
        let checkpoint = CheckpointState {
            location: unit.location.name.clone(),
            date: unit.period.last_day().min(today),
        };
        let plan = plan_units(&units, Some(&checkpoint));
        assert!(
            plan.pending
                .iter()
                .all(|pending| pending.location.name == unit.location.name
                    || units.iter().position(|u| u == pending).unwrap() > index),
            "checkpoint {unit} re-queued an earlier location"
        );
        assert_eq!(plan.skipped + plan.pending.len(), units.len());
        match &plan.state {
            ResumeState::PartialLocation { period, .. } => {
                assert_eq!(*period, unit.period);
                assert_eq!(plan.pending[0], *unit);
            }
            ResumeState::LocationComplete { location } => {
                assert_eq!(*location, unit.location.name);
                assert_eq!(unit.period, Period::new(2021, 6).unwrap());
            }
            ResumeState::Fresh => panic!("checkpoint {unit} planned as fresh"),
        }
    }
}

#[test]
fn checkpoint_mid_month_reruns_that_month() {
    let today = NaiveDate::from_ymd_opt(2020, 4, 20).unwrap();
    let units = enumerate_units(&locations(), 2020, today);
    let checkpoint = CheckpointState {
        location: "RK Puram".to_string(),
        date: NaiveDate::from_ymd_opt(2020, 3, 11).unwrap(),
    };
    let plan = plan_units(&units, Some(&checkpoint));
    let labels: Vec<String> = plan.pending.iter().map(ToString::to_string).collect();
    assert_eq!(
        labels,
        vec![
            "RK Puram 2020-03",
            "RK Puram 2020-04",
            "Punjabi Bagh 2020-01",
            "Punjabi Bagh 2020-02",
            "Punjabi Bagh 2020-03",
            "Punjabi Bagh 2020-04",
        ]
    );
}
