mod common;

#[test]
fn test_generate_batch() {
    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("test_generated.csv");
    common::generate_batch(&output_path, 5).expect("Failed to generate CSV");

    let content = std::fs::read_to_string(&output_path).expect("Failed to read file");
    // Header + 5 rows = 6 lines
    assert_eq!(content.lines().count(), 6);
}

#[test]
fn test_generate_batch_spreads_cleaners() {
    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("test_dist_generated.csv");
    common::generate_batch(&output_path, 100).expect("Failed to generate CSV");

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(&output_path)
        .expect("Failed to open CSV");

    let mut cleaners = std::collections::HashSet::new();
    let mut appointments = std::collections::HashSet::new();
    for result in reader.records() {
        let record = result.expect("Failed to read record");
        let cleaner: u64 = record[2].parse().expect("Failed to parse cleaner id");
        assert!((20..25).contains(&cleaner));
        cleaners.insert(cleaner);
        assert!(appointments.insert(record[0].to_string()), "appointment ids are unique");
    }

    assert_eq!(cleaners.len(), 5);
    assert_eq!(appointments.len(), 100);
}
