use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

mod common;

fn homeowner_cancels(id: &'static str, cancelled_at: &'static str) -> [&'static str; 14] {
    [
        id, "10", "20", "2026-03-12", "150.00", "", "", "", "", "homeowner", "10",
        "2026-03-01T09:00:00Z", cancelled_at, "",
    ]
}

#[test]
fn test_penalty_window_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("boundary_test.csv");
    common::write_cancellations(
        &input,
        &[
            homeowner_cancels("1", "2026-03-09T23:59:59Z"),
            homeowner_cancels("2", "2026-03-10T00:00:00Z"),
            // Seven days out is past the fee window
            homeowner_cancels("3", "2026-03-05T12:00:00Z"),
            homeowner_cancels("4", "2026-03-06T12:00:00Z"),
        ],
    )
    .unwrap();

    let mut cmd = Command::new(cargo_bin!("homeclean-ledger"));
    cmd.arg("settle").arg(&input);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(",1,3,lenient,150.00,150.00,100,25.00,"))
        .stdout(predicate::str::contains(",2,2,penalty,150.00,75.00,50,25.00,"))
        .stdout(predicate::str::contains(",3,7,lenient,150.00,150.00,100,0.00,"))
        .stdout(predicate::str::contains(",4,6,lenient,150.00,150.00,100,25.00,"));
}

#[test]
fn test_cent_precision_in_split() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("precision_test.csv");
    common::write_cancellations(
        &input,
        &[[
            "1", "10", "20;21;22", "2026-03-12", "222.22", "", "", "", "", "homeowner", "10",
            "2026-03-01T09:00:00Z", "2026-03-10T09:00:00Z", "",
        ]],
    )
    .unwrap();

    let mut cmd = Command::new(cargo_bin!("homeclean-ledger"));
    cmd.arg("settle").arg(&input);

    // 111.11 retained, 90% of it to the cleaners, the rest to the platform
    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            ",1,2,penalty,222.22,111.11,50,25.00,100.00,36.11,136.11,",
        ));
}
