use std::path::PathBuf;

use atdw::{
    consolidate, init_logging, load_sources, log_app_start, logging_config_from_env,
    resolve_window, PipelineConfig, SummaryStore, DATESTR_FORMAT,
};
use chrono::{NaiveDate, Utc};

const COMPONENT: &str = "weekly_run";
const DEFAULT_SOURCES_DIR: &str = "data/sources";
const DEFAULT_STORE_PATH: &str = "data/atd_weekly.sqlite";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(COMPONENT, &logging_cfg);

    let reference = parse_reference_date()?;
    let window = resolve_window(reference)?;

    let sources_dir = std::env::var("ATDW_SOURCES_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOURCES_DIR));
    let store_path = std::env::var("ATDW_STORE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_STORE_PATH));
    let cfg = pipeline_config_from_env()?;

    println!(
        "Weekly ATD run start | reference={} window=[{}, {}] sources={} store={} country={} zone={}",
        reference,
        window.start,
        window.end,
        sources_dir.display(),
        store_path.display(),
        cfg.target_country,
        cfg.local_zone
    );

    let sources = load_sources(&sources_dir)?;
    let (schema, rows, report) = consolidate(&sources, &window, &cfg)?;

    let mut store = SummaryStore::open(&store_path, &schema)?;
    let outcome = store.replace_window(&window, &rows)?;

    println!(
        "Consolidation | input_trips={} output_rows={} dropped: window={} staging={} territory={} country_map={} country={}",
        report.input_trip_rows,
        report.output_rows,
        report.dropped_outside_window,
        report.dropped_no_staging,
        report.dropped_no_territory,
        report.dropped_no_country,
        report.dropped_country_mismatch
    );
    for (datestr, count) in &report.partition_counts {
        println!("partition {datestr} | rows={count}");
    }
    println!(
        "Store replace | deleted={} inserted={}",
        outcome.rows_deleted, outcome.rows_inserted
    );
    println!("Weekly ATD run complete.");

    Ok(())
}

fn parse_reference_date() -> Result<NaiveDate, Box<dyn std::error::Error>> {
    match std::env::var("ATDW_REFERENCE_DATE") {
        Ok(raw) => {
            let parsed = NaiveDate::parse_from_str(raw.trim(), DATESTR_FORMAT)
                .map_err(|err| format!("ATDW_REFERENCE_DATE must be YYYY-MM-DD: {err}"))?;
            Ok(parsed)
        }
        Err(_) => Ok(Utc::now().date_naive()),
    }
}

fn pipeline_config_from_env() -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut cfg = PipelineConfig::default();
    if let Ok(country) = std::env::var("ATDW_TARGET_COUNTRY") {
        if !country.trim().is_empty() {
            cfg.target_country = country.trim().to_string();
        }
    }
    if let Ok(zone) = std::env::var("ATDW_LOCAL_ZONE") {
        if !zone.trim().is_empty() {
            cfg.local_zone = zone.trim().parse()?;
        }
    }
    Ok(cfg)
}
