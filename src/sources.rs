//! Source relation rows and CSV ingestion.
//!
//! Four read-only upstream relations feed the weekly consolidation:
//! - `trip_metrics.csv`: workflow_uuid, city_id, pickup_distance_m,
//!   travel_distance_m, datestr
//! - `scope_atd_staging.csv`: workflow_uuid, driver_uuid, delivery_trip_uuid,
//!   courier_flow, restaurant_offered_timestamp_utc,
//!   order_final_state_timestamp, eater_request_timestamp_local,
//!   geo_archetype, merchant_surface
//! - `city_territory_map.csv`: city_id, territory
//! - `city_country_map.csv`: city_id, country_name
//!
//! Files are headerless, positional. `order_final_state_timestamp` and
//! `eater_request_timestamp_local` are naive wall-clock values; zone
//! resolution happens in the pipeline, not here.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripMetricsRow {
    pub workflow_uuid: String,
    pub city_id: i64,
    pub pickup_distance_m: f64,
    pub travel_distance_m: f64,
    pub datestr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeStagingRow {
    pub workflow_uuid: String,
    pub driver_uuid: String,
    pub delivery_trip_uuid: String,
    pub courier_flow: String,
    pub restaurant_offered_timestamp_utc: DateTime<Utc>,
    pub order_final_state_timestamp: NaiveDateTime,
    pub eater_request_timestamp_local: NaiveDateTime,
    pub geo_archetype: String,
    pub merchant_surface: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityTerritoryRow {
    pub city_id: i64,
    pub territory: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityCountryRow {
    pub city_id: i64,
    pub country_name: String,
}

/// The full set of source relations for one run, held in memory.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceTables {
    pub trip_metrics: Vec<TripMetricsRow>,
    pub scope_staging: Vec<ScopeStagingRow>,
    pub city_territory: Vec<CityTerritoryRow>,
    pub city_country: Vec<CityCountryRow>,
}

#[derive(Debug, Error)]
pub enum SourceLoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("{relation} record has {found} columns, expected {expected}")]
    InvalidRecordColumns {
        relation: &'static str,
        found: usize,
        expected: usize,
    },
    #[error("failed to parse field {field} value '{value}'")]
    ParseField { field: &'static str, value: String },
}

pub const TRIP_METRICS_FILE: &str = "trip_metrics.csv";
pub const SCOPE_STAGING_FILE: &str = "scope_atd_staging.csv";
pub const CITY_TERRITORY_FILE: &str = "city_territory_map.csv";
pub const CITY_COUNTRY_FILE: &str = "city_country_map.csv";

/// Loads all four relations from a directory using the fixed file names.
///
/// Any unreadable relation fails the whole load; the pipeline never runs
/// against a partial source set.
pub fn load_sources(dir: &Path) -> Result<SourceTables, SourceLoadError> {
    let trip_metrics = read_trip_metrics(&dir.join(TRIP_METRICS_FILE))?;
    let scope_staging = read_scope_staging(&dir.join(SCOPE_STAGING_FILE))?;
    let city_territory = read_city_territory(&dir.join(CITY_TERRITORY_FILE))?;
    let city_country = read_city_country(&dir.join(CITY_COUNTRY_FILE))?;

    info!(
        component = "sources",
        event = "sources.loaded",
        dir = %dir.display(),
        trip_metrics_rows = trip_metrics.len(),
        scope_staging_rows = scope_staging.len(),
        city_territory_rows = city_territory.len(),
        city_country_rows = city_country.len()
    );

    Ok(SourceTables {
        trip_metrics,
        scope_staging,
        city_territory,
        city_country,
    })
}

pub fn read_trip_metrics(path: &Path) -> Result<Vec<TripMetricsRow>, SourceLoadError> {
    read_relation(path, parse_trip_metrics_record)
}

pub fn read_scope_staging(path: &Path) -> Result<Vec<ScopeStagingRow>, SourceLoadError> {
    read_relation(path, parse_scope_staging_record)
}

pub fn read_city_territory(path: &Path) -> Result<Vec<CityTerritoryRow>, SourceLoadError> {
    read_relation(path, |record| {
        check_columns(record, "city_territory_map", 2)?;
        Ok(CityTerritoryRow {
            city_id: parse_i64(record, 0, "city_id")?,
            territory: field(record, 1),
        })
    })
}

pub fn read_city_country(path: &Path) -> Result<Vec<CityCountryRow>, SourceLoadError> {
    read_relation(path, |record| {
        check_columns(record, "city_country_map", 2)?;
        Ok(CityCountryRow {
            city_id: parse_i64(record, 0, "city_id")?,
            country_name: field(record, 1),
        })
    })
}

fn read_relation<T>(
    path: &Path,
    parse: impl Fn(&StringRecord) -> Result<T, SourceLoadError>,
) -> Result<Vec<T>, SourceLoadError> {
    let file = std::fs::File::open(path)?;
    let mut reader = csv::ReaderBuilder::new().has_headers(false).from_reader(file);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(parse(&record)?);
    }
    Ok(rows)
}

fn parse_trip_metrics_record(record: &StringRecord) -> Result<TripMetricsRow, SourceLoadError> {
    check_columns(record, "trip_metrics", 5)?;
    Ok(TripMetricsRow {
        workflow_uuid: field(record, 0),
        city_id: parse_i64(record, 1, "city_id")?,
        pickup_distance_m: parse_f64(record, 2, "pickup_distance_m")?,
        travel_distance_m: parse_f64(record, 3, "travel_distance_m")?,
        datestr: field(record, 4),
    })
}

fn parse_scope_staging_record(record: &StringRecord) -> Result<ScopeStagingRow, SourceLoadError> {
    check_columns(record, "scope_atd_staging", 9)?;
    Ok(ScopeStagingRow {
        workflow_uuid: field(record, 0),
        driver_uuid: field(record, 1),
        delivery_trip_uuid: field(record, 2),
        courier_flow: field(record, 3),
        restaurant_offered_timestamp_utc: parse_utc_timestamp(
            record,
            4,
            "restaurant_offered_timestamp_utc",
        )?,
        order_final_state_timestamp: parse_naive_timestamp(
            record,
            5,
            "order_final_state_timestamp",
        )?,
        eater_request_timestamp_local: parse_naive_timestamp(
            record,
            6,
            "eater_request_timestamp_local",
        )?,
        geo_archetype: field(record, 7),
        merchant_surface: field(record, 8),
    })
}

fn check_columns(
    record: &StringRecord,
    relation: &'static str,
    expected: usize,
) -> Result<(), SourceLoadError> {
    if record.len() != expected {
        return Err(SourceLoadError::InvalidRecordColumns {
            relation,
            found: record.len(),
            expected,
        });
    }
    Ok(())
}

fn field(record: &StringRecord, idx: usize) -> String {
    record.get(idx).unwrap_or_default().trim().to_string()
}

fn parse_i64(
    record: &StringRecord,
    idx: usize,
    field: &'static str,
) -> Result<i64, SourceLoadError> {
    let raw = record.get(idx).unwrap_or_default().trim();
    raw.parse::<i64>().map_err(|_| SourceLoadError::ParseField {
        field,
        value: raw.to_string(),
    })
}

fn parse_f64(
    record: &StringRecord,
    idx: usize,
    field: &'static str,
) -> Result<f64, SourceLoadError> {
    let raw = record.get(idx).unwrap_or_default().trim();
    raw.parse::<f64>().map_err(|_| SourceLoadError::ParseField {
        field,
        value: raw.to_string(),
    })
}

fn parse_utc_timestamp(
    record: &StringRecord,
    idx: usize,
    field: &'static str,
) -> Result<DateTime<Utc>, SourceLoadError> {
    let raw = record.get(idx).unwrap_or_default().trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    // Some extracts drop the zone designator on UTC columns.
    parse_naive(raw)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| SourceLoadError::ParseField {
            field,
            value: raw.to_string(),
        })
}

fn parse_naive_timestamp(
    record: &StringRecord,
    idx: usize,
    field: &'static str,
) -> Result<NaiveDateTime, SourceLoadError> {
    let raw = record.get(idx).unwrap_or_default().trim();
    parse_naive(raw).ok_or_else(|| SourceLoadError::ParseField {
        field,
        value: raw.to_string(),
    })
}

fn parse_naive(raw: &str) -> Option<NaiveDateTime> {
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(parsed);
        }
    }
    None
}
