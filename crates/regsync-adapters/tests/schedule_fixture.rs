use std::path::PathBuf;

use chrono::NaiveDate;
use regsync_adapters::{read_ics_file, resolve_staff};
use regsync_core::StaffResolution;

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures/schedule/model_home_schedule.ics")
}

#[test]
fn model_home_schedule_fixture_parses_all_day_staffed_events() {
    let events = read_ics_file(fixture_path()).expect("fixture parses");

    let summary: Vec<_> = events
        .iter()
        .map(|e| (e.date, e.location.as_str(), e.staff.len()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (NaiveDate::from_ymd_opt(2025, 12, 6).expect("date"), "100 Oak Dr", 2),
            (NaiveDate::from_ymd_opt(2025, 12, 6).expect("date"), "14520 Desert Willow Ln", 1),
            (NaiveDate::from_ymd_opt(2025, 12, 7).expect("date"), "100 Oak Dr", 2),
        ]
    );
}

#[test]
fn unmapped_staff_are_flagged_not_fatal() {
    let events = read_ics_file(fixture_path()).expect("fixture parses");
    let third = &events[2];
    assert_eq!(third.staff, vec!["Cassandra V.", "Jordan Reyes"]);
    assert!(matches!(resolve_staff(&third.staff[0]), StaffResolution::Mapped(m) if m.full_name == "Cassandra Vasquez"));
    assert_eq!(resolve_staff(&third.staff[1]), StaffResolution::Unmapped);
}
