use assert_cmd::cargo_bin;
use std::process::Command;

mod common;

#[test]
fn test_large_batch_streaming() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("large_test.csv");
    common::generate_batch(&input, 1_000).expect("Failed to generate large CSV");

    let output = Command::new(cargo_bin!("homeclean-ledger"))
        .arg("settle")
        .arg(&input)
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success(), "Binary failed to settle the batch");
    // Header plus one breakdown per row
    assert_eq!(String::from_utf8_lossy(&output.stdout).lines().count(), 1_001);
}

#[cfg(feature = "storage-rocksdb")]
#[test]
fn test_large_batch_streaming_db() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("large_test.csv");
    common::generate_batch(&input, 1_000).expect("Failed to generate large CSV");

    let status = Command::new(cargo_bin!("homeclean-ledger"))
        .arg("--db-path")
        .arg(dir.path().join("test_db"))
        .arg("settle")
        .arg(&input)
        .status()
        .expect("Failed to execute command");
    assert!(status.success(), "Binary failed to settle the batch");
}
