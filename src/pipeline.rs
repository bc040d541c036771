//! Weekly consolidation transform: join, derive, report.
//!
//! `consolidate` is a pure function over in-memory relations; storage
//! adapters stay thin so the join/derive logic exists exactly once.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::sources::{ScopeStagingRow, SourceTables, TripMetricsRow};
use crate::window::DateWindow;

pub const SUMMARY_SCHEMA_VERSION: u32 = 1;

const METERS_PER_KM: f64 = 1_000.0;
const SECONDS_PER_MINUTE: f64 = 60.0;

/// Output column order of the consolidated summary table. `datestr` is the
/// partition discriminator and always last.
pub const SUMMARY_COLUMNS: [&str; 15] = [
    "territory",
    "country_name",
    "workflow_uuid",
    "driver_uuid",
    "delivery_trip_uuid",
    "courier_flow",
    "geo_archetype",
    "merchant_surface",
    "restaurant_offered_timestamp_utc",
    "order_final_state_timestamp_local",
    "eater_request_timestamp_local",
    "pickup_distance",
    "dropoff_distance",
    "atd_minutes",
    "datestr",
];

/// One consolidated output row, keyed for partitioning by `datestr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedRecord {
    pub territory: String,
    pub country_name: String,
    pub workflow_uuid: String,
    pub driver_uuid: String,
    pub delivery_trip_uuid: String,
    pub courier_flow: String,
    pub geo_archetype: String,
    pub merchant_surface: String,
    pub restaurant_offered_timestamp_utc: DateTime<Utc>,
    pub order_final_state_timestamp_local: NaiveDateTime,
    pub eater_request_timestamp_local: NaiveDateTime,
    /// Kilometers, scaled from the source meter value.
    pub pickup_distance: f64,
    /// Kilometers, scaled from the source travel-distance meter value.
    pub dropoff_distance: f64,
    /// Minutes between restaurant offer and final delivery state. May be
    /// negative when upstream timestamps are inconsistent; not clamped here.
    pub atd_minutes: f64,
    pub datestr: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Only rows whose city maps to this country are consolidated.
    pub target_country: String,
    /// IANA zone used to elevate the naive final-state timestamp to an
    /// absolute instant.
    pub local_zone: Tz,
    pub schema_version: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_country: "Mexico".to_string(),
            local_zone: chrono_tz::America::Mexico_City,
            schema_version: SUMMARY_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarySchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<String>,
}

/// Drop accounting and per-partition output counts for one run. Input and
/// output totals feed the external row-count/freshness checks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConsolidateReport {
    pub input_trip_rows: u64,
    pub output_rows: u64,
    pub dropped_outside_window: u64,
    pub dropped_no_staging: u64,
    pub dropped_no_territory: u64,
    pub dropped_no_country: u64,
    pub dropped_country_mismatch: u64,
    pub partition_counts: Vec<(String, u64)>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("invalid pipeline config: {0}")]
    InvalidConfig(String),
    #[error(
        "ambiguous local time {local} in zone {zone} for workflow {workflow_uuid} (DST fold)"
    )]
    AmbiguousLocalTime {
        workflow_uuid: String,
        local: NaiveDateTime,
        zone: Tz,
    },
    #[error(
        "nonexistent local time {local} in zone {zone} for workflow {workflow_uuid} (DST gap)"
    )]
    NonexistentLocalTime {
        workflow_uuid: String,
        local: NaiveDateTime,
        zone: Tz,
    },
}

/// Builds the output schema for a config, including a fingerprint over
/// everything that changes the meaning of stored rows.
pub fn build_summary_schema(cfg: &PipelineConfig) -> SummarySchema {
    let columns: Vec<String> = SUMMARY_COLUMNS.iter().map(|c| (*c).to_string()).collect();
    let fingerprint = schema_fingerprint(cfg, &columns);

    SummarySchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    }
}

/// Runs the window-filtered inner join and metric derivation.
///
/// Join semantics are strictly inner on all four relations; a trip row with
/// no staging, territory, or country match contributes nothing (counted, not
/// null-filled). Output order is deterministic: `(datestr, workflow_uuid,
/// delivery_trip_uuid)`.
pub fn consolidate(
    sources: &SourceTables,
    window: &DateWindow,
    cfg: &PipelineConfig,
) -> Result<(SummarySchema, Vec<ConsolidatedRecord>, ConsolidateReport), PipelineError> {
    validate_config(cfg)?;
    let schema = build_summary_schema(cfg);

    info!(
        component = "pipeline",
        event = "pipeline.consolidate.start",
        window_start = %window.start,
        window_end = %window.end,
        target_country = %cfg.target_country,
        local_zone = %cfg.local_zone,
        trip_rows = sources.trip_metrics.len()
    );

    // Dimension lookups. Staging keeps every row per workflow so duplicate
    // staging rows yield one output per matching pair (true inner join).
    let mut staging_by_workflow: HashMap<&str, Vec<&ScopeStagingRow>> = HashMap::new();
    for row in &sources.scope_staging {
        staging_by_workflow
            .entry(row.workflow_uuid.as_str())
            .or_default()
            .push(row);
    }
    let territory_by_city: HashMap<i64, &str> = sources
        .city_territory
        .iter()
        .map(|row| (row.city_id, row.territory.as_str()))
        .collect();
    let country_by_city: HashMap<i64, &str> = sources
        .city_country
        .iter()
        .map(|row| (row.city_id, row.country_name.as_str()))
        .collect();

    let mut report = ConsolidateReport {
        input_trip_rows: sources.trip_metrics.len() as u64,
        ..ConsolidateReport::default()
    };
    let mut output = Vec::new();

    for trip in &sources.trip_metrics {
        if !window.contains_datestr(&trip.datestr) {
            report.dropped_outside_window += 1;
            continue;
        }

        let Some(country) = country_by_city.get(&trip.city_id) else {
            report.dropped_no_country += 1;
            continue;
        };
        if *country != cfg.target_country {
            report.dropped_country_mismatch += 1;
            continue;
        }

        let Some(territory) = territory_by_city.get(&trip.city_id) else {
            report.dropped_no_territory += 1;
            continue;
        };

        let Some(staging_rows) = staging_by_workflow.get(trip.workflow_uuid.as_str()) else {
            report.dropped_no_staging += 1;
            continue;
        };

        for staging in staging_rows {
            output.push(derive_record(trip, staging, territory, country, cfg)?);
        }
    }

    output.sort_by(|a, b| {
        (&a.datestr, &a.workflow_uuid, &a.delivery_trip_uuid)
            .cmp(&(&b.datestr, &b.workflow_uuid, &b.delivery_trip_uuid))
    });

    let mut partition_counts: BTreeMap<String, u64> = BTreeMap::new();
    for record in &output {
        *partition_counts.entry(record.datestr.clone()).or_default() += 1;
    }
    report.partition_counts = partition_counts.into_iter().collect();
    report.output_rows = output.len() as u64;

    info!(
        component = "pipeline",
        event = "pipeline.consolidate.finish",
        input_trip_rows = report.input_trip_rows,
        output_rows = report.output_rows,
        dropped_outside_window = report.dropped_outside_window,
        dropped_no_staging = report.dropped_no_staging,
        dropped_no_territory = report.dropped_no_territory,
        dropped_no_country = report.dropped_no_country,
        dropped_country_mismatch = report.dropped_country_mismatch
    );

    Ok((schema, output, report))
}

fn derive_record(
    trip: &TripMetricsRow,
    staging: &ScopeStagingRow,
    territory: &str,
    country: &str,
    cfg: &PipelineConfig,
) -> Result<ConsolidatedRecord, PipelineError> {
    let final_state_instant = local_instant(
        staging.order_final_state_timestamp,
        cfg.local_zone,
        &staging.workflow_uuid,
    )?;
    let atd_minutes = (final_state_instant.timestamp()
        - staging.restaurant_offered_timestamp_utc.timestamp()) as f64
        / SECONDS_PER_MINUTE;

    Ok(ConsolidatedRecord {
        territory: territory.to_string(),
        country_name: country.to_string(),
        workflow_uuid: staging.workflow_uuid.clone(),
        driver_uuid: staging.driver_uuid.clone(),
        delivery_trip_uuid: staging.delivery_trip_uuid.clone(),
        courier_flow: staging.courier_flow.clone(),
        geo_archetype: staging.geo_archetype.clone(),
        merchant_surface: staging.merchant_surface.clone(),
        restaurant_offered_timestamp_utc: staging.restaurant_offered_timestamp_utc,
        order_final_state_timestamp_local: staging.order_final_state_timestamp,
        eater_request_timestamp_local: staging.eater_request_timestamp_local,
        pickup_distance: trip.pickup_distance_m / METERS_PER_KM,
        dropoff_distance: trip.travel_distance_m / METERS_PER_KM,
        atd_minutes,
        datestr: trip.datestr.clone(),
    })
}

/// Elevates a naive wall-clock value to an absolute instant using IANA zone
/// rules. DST folds and gaps fail the batch rather than guess an offset.
fn local_instant(
    naive: NaiveDateTime,
    zone: Tz,
    workflow_uuid: &str,
) -> Result<DateTime<Tz>, PipelineError> {
    match zone.from_local_datetime(&naive) {
        LocalResult::Single(instant) => Ok(instant),
        LocalResult::Ambiguous(_, _) => Err(PipelineError::AmbiguousLocalTime {
            workflow_uuid: workflow_uuid.to_string(),
            local: naive,
            zone,
        }),
        LocalResult::None => Err(PipelineError::NonexistentLocalTime {
            workflow_uuid: workflow_uuid.to_string(),
            local: naive,
            zone,
        }),
    }
}

fn validate_config(cfg: &PipelineConfig) -> Result<(), PipelineError> {
    if cfg.target_country.trim().is_empty() {
        return Err(PipelineError::InvalidConfig(
            "target_country must not be empty".to_string(),
        ));
    }
    if cfg.schema_version != SUMMARY_SCHEMA_VERSION {
        return Err(PipelineError::InvalidConfig(format!(
            "schema_version must equal SUMMARY_SCHEMA_VERSION ({SUMMARY_SCHEMA_VERSION})"
        )));
    }
    Ok(())
}

fn schema_fingerprint(cfg: &PipelineConfig, columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update(format!("target_country:{};", cfg.target_country));
    hasher.update(format!("local_zone:{};", cfg.local_zone));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update(";");
    }
    hex::encode(hasher.finalize())
}
