//! Filterable ATD dashboard over the consolidated summary table.
//!
//! Read-side only: filters, KPIs (trips, ATD mean/median/P90), segment
//! aggregations, and temporal breakdowns, exposed as an HTML page and a JSON
//! snapshot endpoint. Consumers own any further rounding/aggregation.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use axum::{
    extract::{Query, State},
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use chrono::{Datelike, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::pipeline::{build_summary_schema, ConsolidatedRecord, PipelineConfig, SummarySchema};
use crate::store::SummaryStore;
use crate::window::DATESTR_FORMAT;

const DAY_LABELS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SummarySnapshot {
    pub rows: Vec<ConsolidatedRecord>,
}

pub trait SummarySnapshotSource: Send + Sync + 'static {
    fn snapshot(&self) -> SummarySnapshot;
}

#[derive(Clone)]
pub struct InMemorySnapshotSource {
    inner: Arc<RwLock<SummarySnapshot>>,
}

impl InMemorySnapshotSource {
    pub fn new(snapshot: SummarySnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    pub fn demo() -> Self {
        Self::new(demo_snapshot())
    }

    pub fn replace_snapshot(&self, snapshot: SummarySnapshot) {
        let mut guard = self
            .inner
            .write()
            .expect("in-memory snapshot lock should not be poisoned");
        *guard = snapshot;
    }
}

impl SummarySnapshotSource for InMemorySnapshotSource {
    fn snapshot(&self) -> SummarySnapshot {
        self.inner
            .read()
            .expect("in-memory snapshot lock should not be poisoned")
            .clone()
    }
}

/// Reads the full summary table from the sqlite store on each request. A
/// store that cannot be read serves an empty snapshot rather than a 500.
pub struct SqliteSnapshotSource {
    store_path: PathBuf,
    schema: SummarySchema,
}

impl SqliteSnapshotSource {
    pub fn new(store_path: PathBuf, cfg: &PipelineConfig) -> Self {
        Self {
            store_path,
            schema: build_summary_schema(cfg),
        }
    }
}

impl SummarySnapshotSource for SqliteSnapshotSource {
    fn snapshot(&self) -> SummarySnapshot {
        let loaded =
            SummaryStore::open(&self.store_path, &self.schema).and_then(|store| store.load_all());
        match loaded {
            Ok(rows) => SummarySnapshot { rows },
            Err(err) => {
                warn!(
                    component = "dashboard",
                    event = "dashboard.store.unreadable",
                    store_path = %self.store_path.display(),
                    error = %err
                );
                SummarySnapshot::default()
            }
        }
    }
}

/// All filters are optional and combined with AND. Categorical filters match
/// any of the listed values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SummaryFilters {
    pub territories: Option<Vec<String>>,
    pub geo_archetypes: Option<Vec<String>>,
    pub courier_flows: Option<Vec<String>>,
    pub merchant_surfaces: Option<Vec<String>>,
    /// Inclusive bounds on the eater-request date.
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub pickup_km_min: Option<f64>,
    pub pickup_km_max: Option<f64>,
    pub dropoff_km_min: Option<f64>,
    pub dropoff_km_max: Option<f64>,
}

pub fn apply_filters(
    snapshot: &SummarySnapshot,
    filters: &SummaryFilters,
) -> Vec<ConsolidatedRecord> {
    snapshot
        .rows
        .iter()
        .filter(|row| {
            matches_values(&filters.territories, &row.territory)
                && matches_values(&filters.geo_archetypes, &row.geo_archetype)
                && matches_values(&filters.courier_flows, &row.courier_flow)
                && matches_values(&filters.merchant_surfaces, &row.merchant_surface)
                && matches_date_range(filters, row)
                && matches_range(
                    filters.pickup_km_min,
                    filters.pickup_km_max,
                    row.pickup_distance,
                )
                && matches_range(
                    filters.dropoff_km_min,
                    filters.dropoff_km_max,
                    row.dropoff_distance,
                )
        })
        .cloned()
        .collect()
}

fn matches_values(selected: &Option<Vec<String>>, value: &str) -> bool {
    match selected {
        Some(values) if !values.is_empty() => values.iter().any(|v| v == value),
        _ => true,
    }
}

fn matches_date_range(filters: &SummaryFilters, row: &ConsolidatedRecord) -> bool {
    let date = row.eater_request_timestamp_local.date();
    if let Some(from) = filters.date_from {
        if date < from {
            return false;
        }
    }
    if let Some(to) = filters.date_to {
        if date > to {
            return false;
        }
    }
    true
}

fn matches_range(min: Option<f64>, max: Option<f64>, value: f64) -> bool {
    if let Some(min) = min {
        if value < min {
            return false;
        }
    }
    if let Some(max) = max {
        if value > max {
            return false;
        }
    }
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSummary {
    pub trips: u64,
    pub atd_mean: Option<f64>,
    pub atd_median: Option<f64>,
    pub atd_p90: Option<f64>,
}

pub fn kpi_summary(rows: &[ConsolidatedRecord]) -> KpiSummary {
    let mut values: Vec<f64> = rows.iter().map(|row| row.atd_minutes).collect();
    if values.is_empty() {
        return KpiSummary {
            trips: 0,
            atd_mean: None,
            atd_median: None,
            atd_p90: None,
        };
    }

    values.sort_by(|a, b| a.partial_cmp(b).expect("ATD values must not be NaN"));
    let mean = values.iter().sum::<f64>() / values.len() as f64;

    KpiSummary {
        trips: values.len() as u64,
        atd_mean: Some(mean),
        atd_median: Some(quantile(&values, 0.5)),
        atd_p90: Some(quantile(&values, 0.9)),
    }
}

// Linear-interpolated quantile over a sorted, non-empty slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let fraction = position - lower as f64;
    if lower + 1 >= sorted.len() {
        return sorted[lower];
    }
    sorted[lower] + fraction * (sorted[lower + 1] - sorted[lower])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentDimension {
    Territory,
    GeoArchetype,
    CourierFlow,
    MerchantSurface,
}

impl SegmentDimension {
    pub fn label(self) -> &'static str {
        match self {
            Self::Territory => "Territory",
            Self::GeoArchetype => "Geo archetype",
            Self::CourierFlow => "Courier flow",
            Self::MerchantSurface => "Merchant surface",
        }
    }

    fn key_of(self, row: &ConsolidatedRecord) -> &str {
        match self {
            Self::Territory => &row.territory,
            Self::GeoArchetype => &row.geo_archetype,
            Self::CourierFlow => &row.courier_flow,
            Self::MerchantSurface => &row.merchant_surface,
        }
    }
}

/// Mean ATD and trip count for one group of a segmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentAggregate {
    pub key: String,
    pub trips: u64,
    pub atd_mean: f64,
}

pub fn aggregate_by(
    rows: &[ConsolidatedRecord],
    dimension: SegmentDimension,
) -> Vec<SegmentAggregate> {
    aggregate_keys(rows, |row| dimension.key_of(row).to_string(), None)
}

/// Mean ATD and trips per day of week (Mon..Sun), empty days omitted.
pub fn atd_by_day_of_week(rows: &[ConsolidatedRecord]) -> Vec<SegmentAggregate> {
    let order: Vec<String> = DAY_LABELS.iter().map(|d| (*d).to_string()).collect();
    aggregate_keys(
        rows,
        |row| {
            let day = row
                .eater_request_timestamp_local
                .weekday()
                .num_days_from_monday();
            DAY_LABELS[day as usize].to_string()
        },
        Some(order),
    )
}

/// Mean ATD and trips per hour of day (0..23), empty hours omitted.
pub fn atd_by_hour_of_day(rows: &[ConsolidatedRecord]) -> Vec<SegmentAggregate> {
    let order: Vec<String> = (0..24).map(|h| h.to_string()).collect();
    aggregate_keys(
        rows,
        |row| row.eater_request_timestamp_local.hour().to_string(),
        Some(order),
    )
}

pub fn atd_by_weekend(rows: &[ConsolidatedRecord]) -> Vec<SegmentAggregate> {
    let order = vec!["Weekday".to_string(), "Weekend".to_string()];
    aggregate_keys(
        rows,
        |row| {
            let weekend = row
                .eater_request_timestamp_local
                .weekday()
                .num_days_from_monday()
                >= 5;
            if weekend { "Weekend" } else { "Weekday" }.to_string()
        },
        Some(order),
    )
}

fn aggregate_keys(
    rows: &[ConsolidatedRecord],
    key_of: impl Fn(&ConsolidatedRecord) -> String,
    order: Option<Vec<String>>,
) -> Vec<SegmentAggregate> {
    use std::collections::BTreeMap;

    let mut sums: BTreeMap<String, (u64, f64)> = BTreeMap::new();
    for row in rows {
        let entry = sums.entry(key_of(row)).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += row.atd_minutes;
    }

    let to_aggregate = |key: String, trips: u64, sum: f64| SegmentAggregate {
        key,
        trips,
        atd_mean: sum / trips as f64,
    };

    match order {
        // Fixed domain order (days, hours, weekend buckets); empty groups omitted.
        Some(keys) => keys
            .into_iter()
            .filter_map(|key| {
                sums.remove(&key)
                    .map(|(trips, sum)| to_aggregate(key, trips, sum))
            })
            .collect(),
        None => sums
            .into_iter()
            .map(|(key, (trips, sum))| to_aggregate(key, trips, sum))
            .collect(),
    }
}

/// Query parameters of both dashboard routes. Multi-value categorical filters
/// are comma-separated within one parameter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DashboardQuery {
    pub territory: Option<String>,
    pub geo_archetype: Option<String>,
    pub courier_flow: Option<String>,
    pub merchant_surface: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub pickup_min: Option<f64>,
    pub pickup_max: Option<f64>,
    pub dropoff_min: Option<f64>,
    pub dropoff_max: Option<f64>,
}

impl DashboardQuery {
    pub fn into_filters(self) -> SummaryFilters {
        SummaryFilters {
            territories: split_values(self.territory),
            geo_archetypes: split_values(self.geo_archetype),
            courier_flows: split_values(self.courier_flow),
            merchant_surfaces: split_values(self.merchant_surface),
            date_from: self.date_from.as_deref().and_then(parse_date),
            date_to: self.date_to.as_deref().and_then(parse_date),
            pickup_km_min: self.pickup_min,
            pickup_km_max: self.pickup_max,
            dropoff_km_min: self.dropoff_min,
            dropoff_km_max: self.dropoff_max,
        }
    }
}

fn split_values(raw: Option<String>) -> Option<Vec<String>> {
    let raw = raw?;
    let values: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATESTR_FORMAT).ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub kpis: KpiSummary,
    pub rows: Vec<ConsolidatedRecord>,
}

pub fn dashboard_router(source: Arc<dyn SummarySnapshotSource>) -> Router {
    Router::new()
        .route("/dashboard", get(get_dashboard_html))
        .route("/dashboard/snapshot", get(get_dashboard_snapshot))
        .with_state(DashboardAppState { source })
}

#[derive(Clone)]
struct DashboardAppState {
    source: Arc<dyn SummarySnapshotSource>,
}

async fn get_dashboard_html(
    State(state): State<DashboardAppState>,
    Query(query): Query<DashboardQuery>,
) -> impl IntoResponse {
    let snapshot = state.source.snapshot();
    let total = snapshot.rows.len();
    let rows = apply_filters(&snapshot, &query.into_filters());
    Html(render_dashboard_html(&rows, total))
}

async fn get_dashboard_snapshot(
    State(state): State<DashboardAppState>,
    Query(query): Query<DashboardQuery>,
) -> impl IntoResponse {
    let snapshot = state.source.snapshot();
    let rows = apply_filters(&snapshot, &query.into_filters());

    info!(
        component = "dashboard",
        event = "http.snapshot.request",
        total_rows = snapshot.rows.len(),
        filtered_rows = rows.len()
    );

    let kpis = kpi_summary(&rows);
    Json(SnapshotResponse { kpis, rows })
}

pub fn render_dashboard_html(rows: &[ConsolidatedRecord], total_rows: usize) -> String {
    let now_utc = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let kpis = kpi_summary(rows);

    let mut out = String::new();
    out.push_str("<!DOCTYPE html><html><head><meta charset=\"utf-8\">\n");
    out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    out.push_str("<title>ATD Dashboard</title>\n");
    out.push_str("<style>:root{--atd:#03c167;--bg:#f5f1e7;--card:#ffffff;--ink:#182026;--muted:#5f6a73;--line:#d7dce1;--head:#14343f}*{box-sizing:border-box}body{margin:0;color:var(--ink);font-family:\"Space Grotesk\",\"Avenir Next\",\"Segoe UI\",sans-serif;background:linear-gradient(160deg,var(--bg),#e9f0f2);min-height:100vh}.shell{max-width:1200px;margin:0 auto;padding:24px 18px 28px}.hero{background:linear-gradient(135deg,#102f3a 0%,#24576b 100%);color:#f7fbfc;border-radius:16px;padding:18px 20px}.hero h1{margin:0 0 8px;font-size:1.6rem}.hero-meta{display:flex;gap:16px;flex-wrap:wrap;font-size:.92rem;color:#dcebf0}.kpis{display:flex;gap:12px;flex-wrap:wrap;margin-top:16px}.kpi{flex:1 1 180px;background:var(--card);border:1px solid var(--line);border-radius:12px;padding:14px 16px}.kpi .label{font-size:.78rem;text-transform:uppercase;color:var(--muted)}.kpi .value{font-size:1.5rem;font-weight:700;color:var(--atd)}.card{margin-top:16px;background:var(--card);border:1px solid var(--line);border-radius:12px;overflow:hidden}.card h2{margin:0;padding:12px 14px;font-size:1rem;background:var(--head);color:#f2f7f9}table{width:100%;border-collapse:collapse}th{font-size:.78rem;text-transform:uppercase;color:var(--muted);text-align:left;padding:8px 14px;border-bottom:1px solid var(--line)}td{font-size:.86rem;padding:8px 14px;border-bottom:1px solid var(--line)}tbody tr:nth-child(even){background:#fafcfd}</style>\n");
    out.push_str("</head><body><main class=\"shell\">\n");
    out.push_str("<section class=\"hero\"><h1>ATD Dashboard</h1><div class=\"hero-meta\">");
    out.push_str(&format!(
        "<span>Filtered rows: {} / {}</span>",
        rows.len(),
        total_rows
    ));
    out.push_str(&format!("<span>Generated: {}</span>", escape_html(&now_utc)));
    out.push_str("</div></section>\n");

    out.push_str("<section class=\"kpis\">");
    push_kpi(&mut out, "Trips", &kpis.trips.to_string());
    push_kpi(&mut out, "ATD mean", &format_metric(kpis.atd_mean));
    push_kpi(&mut out, "ATD median", &format_metric(kpis.atd_median));
    push_kpi(&mut out, "ATD P90", &format_metric(kpis.atd_p90));
    out.push_str("</section>\n");

    for dimension in [
        SegmentDimension::Territory,
        SegmentDimension::GeoArchetype,
        SegmentDimension::CourierFlow,
        SegmentDimension::MerchantSurface,
    ] {
        push_aggregate_table(
            &mut out,
            &format!("Average ATD and trips by {}", dimension.label()),
            dimension.label(),
            &aggregate_by(rows, dimension),
        );
    }

    push_aggregate_table(
        &mut out,
        "Average ATD and trips by day of week",
        "Day of week",
        &atd_by_day_of_week(rows),
    );
    push_aggregate_table(
        &mut out,
        "Average ATD and trips by hour of day",
        "Hour of day",
        &atd_by_hour_of_day(rows),
    );
    push_aggregate_table(
        &mut out,
        "Weekend vs weekday",
        "Bucket",
        &atd_by_weekend(rows),
    );

    out.push_str("</main></body></html>\n");
    out
}

fn push_kpi(out: &mut String, label: &str, value: &str) {
    out.push_str(&format!(
        "<div class=\"kpi\"><div class=\"label\">{}</div><div class=\"value\">{}</div></div>",
        escape_html(label),
        escape_html(value)
    ));
}

fn push_aggregate_table(
    out: &mut String,
    title: &str,
    key_header: &str,
    groups: &[SegmentAggregate],
) {
    out.push_str("<section class=\"card\">");
    out.push_str(&format!("<h2>{}</h2>", escape_html(title)));
    out.push_str("<table><thead><tr>");
    out.push_str(&format!("<th>{}</th>", escape_html(key_header)));
    out.push_str("<th>ATD mean</th><th>Trips</th></tr></thead><tbody>");
    for group in groups {
        out.push_str(&format!(
            "<tr><td>{}</td><td>{:.2}</td><td>{}</td></tr>",
            escape_html(&group.key),
            group.atd_mean,
            group.trips
        ));
    }
    out.push_str("</tbody></table></section>\n");
}

fn format_metric(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.2}"),
        None => "-".to_string(),
    }
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Synthetic snapshot for local serving and tests: two territories spread
/// over the first week of June 2024.
pub fn demo_snapshot() -> SummarySnapshot {
    let mut rows = Vec::new();
    let territories = ["Baja", "Centro"];
    let flows = ["motorbike", "bicycle"];
    let start = NaiveDate::from_ymd_opt(2024, 6, 3).expect("valid demo date");

    for offset in 0..7u64 {
        let date = start + chrono::Days::new(offset);
        for (idx, territory) in territories.iter().enumerate() {
            let local = date
                .and_hms_opt(12 + idx as u32, 30, 0)
                .expect("valid demo time");
            rows.push(ConsolidatedRecord {
                territory: (*territory).to_string(),
                country_name: "Mexico".to_string(),
                workflow_uuid: format!("wf-demo-{offset}-{idx}"),
                driver_uuid: format!("drv-demo-{idx}"),
                delivery_trip_uuid: format!("trip-demo-{offset}-{idx}"),
                courier_flow: flows[idx % flows.len()].to_string(),
                geo_archetype: "dense_urban".to_string(),
                merchant_surface: "marketplace".to_string(),
                restaurant_offered_timestamp_utc: local.and_utc(),
                order_final_state_timestamp_local: local,
                eater_request_timestamp_local: local,
                pickup_distance: 1.5 + offset as f64 * 0.2,
                dropoff_distance: 3.0 + idx as f64,
                atd_minutes: 28.0 + offset as f64 + idx as f64 * 3.0,
                datestr: date.format(DATESTR_FORMAT).to_string(),
            });
        }
    }

    SummarySnapshot { rows }
}
