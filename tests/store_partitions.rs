use atdw::{
    build_summary_schema, resolve_window, ConsolidatedRecord, PipelineConfig, StoreError,
    SummaryStore,
};
use chrono::{NaiveDate, NaiveDateTime};
use tempfile::TempDir;

fn record(workflow: &str, datestr: &str, atd: f64) -> ConsolidatedRecord {
    let local: NaiveDateTime = datestr
        .parse::<NaiveDate>()
        .expect("valid datestr")
        .and_hms_opt(14, 35, 0)
        .expect("valid time");
    ConsolidatedRecord {
        territory: "Baja".to_string(),
        country_name: "Mexico".to_string(),
        workflow_uuid: workflow.to_string(),
        driver_uuid: format!("drv-{workflow}"),
        delivery_trip_uuid: format!("trip-{workflow}"),
        courier_flow: "motorbike".to_string(),
        geo_archetype: "dense_urban".to_string(),
        merchant_surface: "marketplace".to_string(),
        restaurant_offered_timestamp_utc: local.and_utc(),
        order_final_state_timestamp_local: local,
        eater_request_timestamp_local: local,
        pickup_distance: 2.5,
        dropoff_distance: 4.8,
        atd_minutes: atd,
        datestr: datestr.to_string(),
    }
}

fn reference(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid reference date")
}

#[test]
fn replace_window_round_trips_rows() {
    let tmp = TempDir::new().expect("temp dir should create");
    let path = tmp.path().join("atd_weekly.sqlite");
    let schema = build_summary_schema(&PipelineConfig::default());
    let window = resolve_window(reference(2024, 6, 10)).expect("window should resolve");

    let rows = vec![
        record("wf-1", "2024-06-03", 35.0),
        record("wf-2", "2024-06-05", 42.5),
    ];

    let mut store = SummaryStore::open(&path, &schema).expect("store should open");
    let outcome = store
        .replace_window(&window, &rows)
        .expect("replace should succeed");
    assert_eq!(outcome.rows_deleted, 0);
    assert_eq!(outcome.rows_inserted, 2);

    let loaded = store.load_window(&window).expect("load should succeed");
    assert_eq!(loaded, rows);
}

#[test]
fn rerunning_the_same_window_is_idempotent() {
    let tmp = TempDir::new().expect("temp dir should create");
    let path = tmp.path().join("atd_weekly.sqlite");
    let schema = build_summary_schema(&PipelineConfig::default());
    let window = resolve_window(reference(2024, 6, 10)).expect("window should resolve");
    let rows = vec![record("wf-1", "2024-06-03", 35.0)];

    let mut store = SummaryStore::open(&path, &schema).expect("store should open");
    store
        .replace_window(&window, &rows)
        .expect("first replace should succeed");
    let second = store
        .replace_window(&window, &rows)
        .expect("second replace should succeed");

    assert_eq!(second.rows_deleted, 1);
    assert_eq!(second.rows_inserted, 1);
    assert_eq!(
        store.count_partition("2024-06-03").expect("count succeeds"),
        1
    );
    assert_eq!(store.load_all().expect("load succeeds"), rows);
}

#[test]
fn replace_leaves_partitions_outside_the_window_untouched() {
    let tmp = TempDir::new().expect("temp dir should create");
    let path = tmp.path().join("atd_weekly.sqlite");
    let schema = build_summary_schema(&PipelineConfig::default());

    // Seed the preceding week, then overwrite the following one.
    let old_window = resolve_window(reference(2024, 6, 3)).expect("window should resolve");
    let old_rows = vec![record("wf-old", "2024-05-28", 31.0)];
    let new_window = resolve_window(reference(2024, 6, 10)).expect("window should resolve");
    let new_rows = vec![record("wf-new", "2024-06-04", 33.0)];

    let mut store = SummaryStore::open(&path, &schema).expect("store should open");
    store
        .replace_window(&old_window, &old_rows)
        .expect("seed replace should succeed");
    store
        .replace_window(&new_window, &new_rows)
        .expect("overwrite replace should succeed");

    assert_eq!(
        store.count_partition("2024-05-28").expect("count succeeds"),
        1
    );
    assert_eq!(
        store.count_partition("2024-06-04").expect("count succeeds"),
        1
    );
}

#[test]
fn rows_outside_the_window_are_rejected_before_any_write() {
    let tmp = TempDir::new().expect("temp dir should create");
    let path = tmp.path().join("atd_weekly.sqlite");
    let schema = build_summary_schema(&PipelineConfig::default());
    let window = resolve_window(reference(2024, 6, 10)).expect("window should resolve");

    let mut store = SummaryStore::open(&path, &schema).expect("store should open");
    store
        .replace_window(&window, &[record("wf-1", "2024-06-03", 35.0)])
        .expect("seed replace should succeed");

    let mixed = vec![
        record("wf-2", "2024-06-04", 40.0),
        record("wf-stray", "2024-06-10", 41.0),
    ];
    let err = store
        .replace_window(&window, &mixed)
        .expect_err("stray partition should be rejected");
    assert!(matches!(
        err,
        StoreError::PartitionOutOfWindow { ref datestr, .. } if datestr == "2024-06-10"
    ));

    // The failed call must not have clobbered the seeded window.
    assert_eq!(
        store.count_partition("2024-06-03").expect("count succeeds"),
        1
    );
    assert_eq!(
        store.count_partition("2024-06-04").expect("count succeeds"),
        0
    );
}

#[test]
fn unpadded_partition_keys_cannot_enter_the_store() {
    let tmp = TempDir::new().expect("temp dir should create");
    let path = tmp.path().join("atd_weekly.sqlite");
    let schema = build_summary_schema(&PipelineConfig::default());
    let window = resolve_window(reference(2024, 6, 10)).expect("window should resolve");

    let mut store = SummaryStore::open(&path, &schema).expect("store should open");

    // An unpadded key parses to an in-window date but names a partition the
    // window's delete loop would never touch, so it must be rejected.
    let err = store
        .replace_window(&window, &[record("wf-pad", "2024-6-3", 35.0)])
        .expect_err("non-canonical partition key should be rejected");
    assert!(matches!(
        err,
        StoreError::PartitionOutOfWindow { ref datestr, .. } if datestr == "2024-6-3"
    ));
    assert!(store.load_all().expect("load succeeds").is_empty());

    // With only canonical keys, rerunning the identical window stays
    // single-copy.
    let rows = vec![record("wf-1", "2024-06-03", 35.0)];
    store
        .replace_window(&window, &rows)
        .expect("first replace should succeed");
    store
        .replace_window(&window, &rows)
        .expect("second replace should succeed");
    assert_eq!(store.load_all().expect("load succeeds"), rows);
}

#[test]
fn empty_rowset_still_clears_the_window() {
    let tmp = TempDir::new().expect("temp dir should create");
    let path = tmp.path().join("atd_weekly.sqlite");
    let schema = build_summary_schema(&PipelineConfig::default());
    let window = resolve_window(reference(2024, 6, 10)).expect("window should resolve");

    let mut store = SummaryStore::open(&path, &schema).expect("store should open");
    store
        .replace_window(&window, &[record("wf-1", "2024-06-03", 35.0)])
        .expect("seed replace should succeed");

    let outcome = store
        .replace_window(&window, &[])
        .expect("empty replace should succeed");
    assert_eq!(outcome.rows_deleted, 1);
    assert_eq!(outcome.rows_inserted, 0);
    assert!(store.load_all().expect("load succeeds").is_empty());
}

#[test]
fn store_refuses_to_open_under_a_different_schema_fingerprint() {
    let tmp = TempDir::new().expect("temp dir should create");
    let path = tmp.path().join("atd_weekly.sqlite");
    let schema = build_summary_schema(&PipelineConfig::default());

    {
        let mut store = SummaryStore::open(&path, &schema).expect("store should open");
        let window = resolve_window(reference(2024, 6, 10)).expect("window should resolve");
        store
            .replace_window(&window, &[record("wf-1", "2024-06-03", 35.0)])
            .expect("seed replace should succeed");
    }

    let other_cfg = PipelineConfig {
        target_country: "Chile".to_string(),
        ..PipelineConfig::default()
    };
    let other_schema = build_summary_schema(&other_cfg);

    let err = SummaryStore::open(&path, &other_schema)
        .err()
        .expect("mismatched fingerprint should refuse to open");
    assert!(matches!(err, StoreError::SchemaFingerprintMismatch { .. }));
}
