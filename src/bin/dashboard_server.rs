use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use atdw::{
    dashboard_router, init_logging, log_app_bind, log_app_start, log_source_selected,
    logging_config_from_env, InMemorySnapshotSource, PipelineConfig, SqliteSnapshotSource,
    SummarySnapshotSource,
};

const COMPONENT: &str = "dashboard_server";
const DEFAULT_STORE_PATH: &str = "data/atd_weekly.sqlite";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(COMPONENT, &logging_cfg);

    let addr: SocketAddr = std::env::var("ATDW_DASHBOARD_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let source: Arc<dyn SummarySnapshotSource> = source_from_env()?;
    let app = dashboard_router(source);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(COMPONENT, bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn source_from_env() -> Result<Arc<dyn SummarySnapshotSource>, Box<dyn std::error::Error>> {
    let force_demo = std::env::var("ATDW_DASHBOARD_USE_DEMO")
        .map(|raw| raw == "1" || raw.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if force_demo {
        log_source_selected(COMPONENT, "demo", Some("ATDW_DASHBOARD_USE_DEMO"));
        return Ok(Arc::new(InMemorySnapshotSource::demo()));
    }

    let store_path = PathBuf::from(
        std::env::var("ATDW_STORE_PATH").unwrap_or_else(|_| DEFAULT_STORE_PATH.to_string()),
    );
    let cfg = pipeline_config_from_env()?;

    log_source_selected(COMPONENT, "sqlite_store", None);
    Ok(Arc::new(SqliteSnapshotSource::new(store_path, &cfg)))
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
