// Checked-in spreadsheet export used by the dev server and docs.

use wotrack_ingest::{load_snapshot_file, validate_row, RowValidationError};

fn sample_path() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sheet/sample.json")
}

#[test]
fn sample_snapshot_loads_with_one_malformed_row() {
    let snapshot = load_snapshot_file(sample_path()).expect("sample snapshot");
    assert_eq!(snapshot.sheet, "orders");
    assert_eq!(snapshot.rows.len(), 6);

    let results = snapshot.rows.iter().map(validate_row).collect::<Vec<_>>();
    let rejected = results.iter().filter(|r| r.is_err()).count();
    assert_eq!(rejected, 1);
    assert!(matches!(results[4], Err(RowValidationError::MissingExternalCode)));

    let first = results[0].as_ref().unwrap();
    assert_eq!(first.external_code, "OS-1001");
    assert_eq!(first.attributes.get("customer").map(String::as_str), Some("Padaria Silva"));

    let cancelled = results[2].as_ref().unwrap();
    assert_eq!(cancelled.completion_date_text, "-");

    let no_date_column = results[5].as_ref().unwrap();
    assert_eq!(no_date_column.completion_date_text, "-");
}
