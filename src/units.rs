use chrono::{Datelike, NaiveDate};

use crate::domain::{Location, Period, WorkUnit};

/// Months from January of `start_year` through the month containing `today`.
pub fn enumerate_periods(start_year: i32, today: NaiveDate) -> Vec<Period> {
    let mut periods = Vec::new();
    for year in start_year..=today.year() {
        let last_month = if year < today.year() { 12 } else { today.month() };
        periods.extend((1..=last_month).filter_map(|month| Period::new(year, month)));
    }
    periods
}

/// The full, ordered unit list for one run: locations in configured order,
/// then periods ascending.
pub fn enumerate_units(locations: &[Location], start_year: i32, today: NaiveDate) -> Vec<WorkUnit> {
    let periods = enumerate_periods(start_year, today);
    locations
        .iter()
        .flat_map(|location| {
            periods.iter().map(move |period| WorkUnit {
                location: location.clone(),
                period: *period,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn periods_stop_at_current_month() {
        let periods = enumerate_periods(2023, date(2024, 3, 9));
        assert_eq!(periods.len(), 12 + 3);
        assert_eq!(periods.first(), Period::new(2023, 1).as_ref());
        assert_eq!(periods.last(), Period::new(2024, 3).as_ref());
    }

    #[test]
    fn units_follow_location_order() {
        let locations = vec![
            Location::new("B", 1.0, 1.0).unwrap(),
            Location::new("A", 2.0, 2.0).unwrap(),
        ];
        let units = enumerate_units(&locations, 2024, date(2024, 2, 1));
        let labels: Vec<String> = units.iter().map(|unit| unit.to_string()).collect();
        assert_eq!(labels, vec!["B 2024-01", "B 2024-02", "A 2024-01", "A 2024-02"]);
    }

    #[test]
    fn start_after_today_yields_nothing() {
        assert!(enumerate_periods(2030, date(2024, 1, 1)).is_empty());
    }
}
