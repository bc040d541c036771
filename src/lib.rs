//! Weekly ATD consolidation core crate.
//!
//! Scope:
//! - resolution of the seven-day reporting window
//! - loading of the extracted source relations
//! - the join/derive pipeline producing the consolidated summary
//! - the transactional sqlite summary store
//! - the filterable dashboard over the stored summary

mod dashboard;
mod observability;
mod pipeline;
mod sources;
mod store;
mod window;

pub use dashboard::{
    aggregate_by, apply_filters, atd_by_day_of_week, atd_by_hour_of_day, atd_by_weekend,
    dashboard_router, demo_snapshot, kpi_summary, render_dashboard_html, DashboardQuery,
    InMemorySnapshotSource, KpiSummary, SegmentAggregate, SegmentDimension, SnapshotResponse,
    SqliteSnapshotSource, SummaryFilters, SummarySnapshot, SummarySnapshotSource,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_source_selected, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    build_summary_schema, consolidate, ConsolidateReport, ConsolidatedRecord, PipelineConfig,
    PipelineError, SummarySchema, SUMMARY_COLUMNS, SUMMARY_SCHEMA_VERSION,
};
pub use sources::{
    load_sources, read_city_country, read_city_territory, read_scope_staging, read_trip_metrics,
    CityCountryRow, CityTerritoryRow, ScopeStagingRow, SourceLoadError, SourceTables,
    TripMetricsRow, CITY_COUNTRY_FILE, CITY_TERRITORY_FILE, SCOPE_STAGING_FILE, TRIP_METRICS_FILE,
};
pub use store::{ReplaceOutcome, StoreError, SummaryStore, SUMMARY_TABLE};
pub use window::{
    resolve_window, DateWindow, WindowError, DATESTR_FORMAT, WINDOW_DAYS,
};
