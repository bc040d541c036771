use std::sync::Arc;

use atdw::{
    dashboard_router, demo_snapshot, ConsolidatedRecord, InMemorySnapshotSource, SummarySnapshot,
};
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use tower::util::ServiceExt;

fn row(territory: &str, courier_flow: &str, atd: f64, eater_local: &str) -> ConsolidatedRecord {
    let local = chrono::NaiveDateTime::parse_from_str(eater_local, "%Y-%m-%dT%H:%M:%S")
        .expect("valid test timestamp");
    ConsolidatedRecord {
        territory: territory.to_string(),
        country_name: "Mexico".to_string(),
        workflow_uuid: format!("wf-{territory}-{courier_flow}-{atd}"),
        driver_uuid: "drv-1".to_string(),
        delivery_trip_uuid: "trip-1".to_string(),
        courier_flow: courier_flow.to_string(),
        geo_archetype: "dense_urban".to_string(),
        merchant_surface: "marketplace".to_string(),
        restaurant_offered_timestamp_utc: local.and_utc(),
        order_final_state_timestamp_local: local,
        eater_request_timestamp_local: local,
        pickup_distance: 2.5,
        dropoff_distance: 4.8,
        atd_minutes: atd,
        datestr: local.date().format("%Y-%m-%d").to_string(),
    }
}

#[tokio::test]
async fn dashboard_page_renders_kpis_and_segment_tables() {
    let source = Arc::new(InMemorySnapshotSource::new(SummarySnapshot {
        rows: vec![row("Baja", "motorbike", 35.0, "2024-06-03T14:35:00")],
    }));

    let app = dashboard_router(source);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/dashboard")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains("<table"));
    assert!(text.contains("ATD Dashboard"));
    assert!(text.contains("ATD mean"));
    assert!(text.contains("ATD P90"));
    assert!(text.contains("Average ATD and trips by Territory"));
    assert!(text.contains("Average ATD and trips by day of week"));
    assert!(text.contains("Weekend vs weekday"));
    assert!(text.contains("Baja"));
}

#[tokio::test]
async fn snapshot_endpoint_applies_query_filters() {
    let source = Arc::new(InMemorySnapshotSource::new(SummarySnapshot {
        rows: vec![
            row("Baja", "motorbike", 30.0, "2024-06-03T12:00:00"),
            row("Centro", "motorbike", 40.0, "2024-06-03T12:00:00"),
            row("Baja", "bicycle", 50.0, "2024-06-03T12:00:00"),
        ],
    }));

    let app = dashboard_router(source);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/dashboard/snapshot?territory=Baja&courier_flow=motorbike")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let rows = json["rows"].as_array().unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["territory"], "Baja");
    assert_eq!(rows[0]["courier_flow"], "motorbike");
}

#[tokio::test]
async fn snapshot_endpoint_supports_comma_separated_multi_values() {
    let source = Arc::new(InMemorySnapshotSource::new(SummarySnapshot {
        rows: vec![
            row("Baja", "motorbike", 30.0, "2024-06-03T12:00:00"),
            row("Centro", "motorbike", 40.0, "2024-06-03T12:00:00"),
            row("Norte", "motorbike", 50.0, "2024-06-03T12:00:00"),
        ],
    }));

    let app = dashboard_router(source);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/dashboard/snapshot?territory=Baja,Centro")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let rows = json["rows"].as_array().unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["territory"], "Baja");
    assert_eq!(rows[1]["territory"], "Centro");
}

#[tokio::test]
async fn snapshot_endpoint_reports_kpis_over_filtered_rows() {
    let source = Arc::new(InMemorySnapshotSource::new(SummarySnapshot {
        rows: vec![
            row("Baja", "motorbike", 10.0, "2024-06-03T12:00:00"),
            row("Baja", "motorbike", 20.0, "2024-06-03T12:00:00"),
            row("Baja", "motorbike", 30.0, "2024-06-03T12:00:00"),
            row("Centro", "motorbike", 90.0, "2024-06-03T12:00:00"),
        ],
    }));

    let app = dashboard_router(source);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/dashboard/snapshot?territory=Baja")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(json["kpis"]["trips"], 3);
    assert_eq!(json["kpis"]["atd_mean"], 20.0);
    assert_eq!(json["kpis"]["atd_median"], 20.0);
    assert_eq!(json["kpis"]["atd_p90"], 28.0);
}

#[tokio::test]
async fn snapshot_endpoint_applies_date_and_distance_bounds() {
    let mut early = row("Baja", "motorbike", 30.0, "2024-06-03T12:00:00");
    early.pickup_distance = 1.0;
    let mut late = row("Baja", "motorbike", 40.0, "2024-06-08T12:00:00");
    late.pickup_distance = 3.0;

    let source = Arc::new(InMemorySnapshotSource::new(SummarySnapshot {
        rows: vec![early, late],
    }));

    let app = dashboard_router(source);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/dashboard/snapshot?date_from=2024-06-05&pickup_min=2.0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let rows = json["rows"].as_array().unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["datestr"], "2024-06-08");
}

#[tokio::test]
async fn demo_snapshot_route_exposes_full_week() {
    let source = Arc::new(InMemorySnapshotSource::new(demo_snapshot()));

    let app = dashboard_router(source);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/dashboard/snapshot")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["rows"].as_array().unwrap().len(), 14);
    assert_eq!(json["kpis"]["trips"], 14);
}
