//! Partitioned summary store over sqlite.
//!
//! The consolidated table is partitioned by `datestr`. Writes are
//! replace-range only: one transaction deletes every partition in the
//! resolved window and inserts the fresh rowset, so a window overwrite is
//! all-or-nothing and re-running the same input is idempotent. The output
//! schema fingerprint is pinned in a meta table and checked on open.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::info;

use crate::pipeline::{ConsolidatedRecord, SummarySchema};
use crate::window::DateWindow;

pub const SUMMARY_TABLE: &str = "atd_weekly_summary";
const META_SCHEMA_VERSION_KEY: &str = "schema_version";
const META_SCHEMA_FINGERPRINT_KEY: &str = "schema_fingerprint";
const NAIVE_TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("summary schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("summary schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
    #[error("row partition {datestr} is outside the window {window_start}..{window_end}")]
    PartitionOutOfWindow {
        datestr: String,
        window_start: String,
        window_end: String,
    },
    #[error("corrupt stored value '{value}' in column {column}")]
    CorruptColumn { column: &'static str, value: String },
}

/// Counts from one replace-range invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub rows_deleted: u64,
    pub rows_inserted: u64,
}

pub struct SummaryStore {
    conn: Connection,
}

impl SummaryStore {
    /// Opens (creating if needed) the store and pins the schema fingerprint.
    /// An existing store written under a different schema refuses to open.
    pub fn open(path: &Path, schema: &SummarySchema) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        ensure_schema(&conn, schema)?;

        Ok(Self { conn })
    }

    /// Replaces every partition of `window` with `rows` in one transaction.
    ///
    /// Rows outside the window are rejected before anything is written.
    /// An empty rowset still clears the window's partitions; a quiet week and
    /// a broken join look the same here and are told apart by the external
    /// row-count check.
    pub fn replace_window(
        &mut self,
        window: &DateWindow,
        rows: &[ConsolidatedRecord],
    ) -> Result<ReplaceOutcome, StoreError> {
        for row in rows {
            if !window.contains_datestr(&row.datestr) {
                return Err(StoreError::PartitionOutOfWindow {
                    datestr: row.datestr.clone(),
                    window_start: window.start.to_string(),
                    window_end: window.end.to_string(),
                });
            }
        }

        let tx = self.conn.transaction()?;
        let mut rows_deleted = 0u64;
        {
            let mut delete =
                tx.prepare(&format!("DELETE FROM {SUMMARY_TABLE} WHERE datestr = ?1"))?;
            for datestr in window.datestrs() {
                rows_deleted += delete.execute(params![datestr])? as u64;
            }

            let mut insert = tx.prepare(&format!(
                "
                INSERT INTO {SUMMARY_TABLE} (
                    territory,
                    country_name,
                    workflow_uuid,
                    driver_uuid,
                    delivery_trip_uuid,
                    courier_flow,
                    geo_archetype,
                    merchant_surface,
                    restaurant_offered_timestamp_utc,
                    order_final_state_timestamp_local,
                    eater_request_timestamp_local,
                    pickup_distance,
                    dropoff_distance,
                    atd_minutes,
                    datestr
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                "
            ))?;
            for row in rows {
                insert.execute(params![
                    row.territory,
                    row.country_name,
                    row.workflow_uuid,
                    row.driver_uuid,
                    row.delivery_trip_uuid,
                    row.courier_flow,
                    row.geo_archetype,
                    row.merchant_surface,
                    encode_utc(row.restaurant_offered_timestamp_utc),
                    encode_naive(row.order_final_state_timestamp_local),
                    encode_naive(row.eater_request_timestamp_local),
                    row.pickup_distance,
                    row.dropoff_distance,
                    row.atd_minutes,
                    row.datestr,
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "store.window.replaced",
            window_start = %window.start,
            window_end = %window.end,
            rows_deleted,
            rows_inserted = rows.len() as u64
        );

        Ok(ReplaceOutcome {
            rows_deleted,
            rows_inserted: rows.len() as u64,
        })
    }

    pub fn count_partition(&self, datestr: &str) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {SUMMARY_TABLE} WHERE datestr = ?1"),
            params![datestr],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn load_all(&self) -> Result<Vec<ConsolidatedRecord>, StoreError> {
        self.load_where("", &[])
    }

    pub fn load_window(&self, window: &DateWindow) -> Result<Vec<ConsolidatedRecord>, StoreError> {
        let start = window.start.to_string();
        let end = window.end.to_string();
        self.load_where(
            "WHERE datestr >= ?1 AND datestr <= ?2",
            &[&start as &dyn rusqlite::ToSql, &end],
        )
    }

    fn load_where(
        &self,
        clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<ConsolidatedRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "
            SELECT
                territory,
                country_name,
                workflow_uuid,
                driver_uuid,
                delivery_trip_uuid,
                courier_flow,
                geo_archetype,
                merchant_surface,
                restaurant_offered_timestamp_utc,
                order_final_state_timestamp_local,
                eater_request_timestamp_local,
                pickup_distance,
                dropoff_distance,
                atd_minutes,
                datestr
            FROM {SUMMARY_TABLE}
            {clause}
            ORDER BY datestr ASC, workflow_uuid ASC, delivery_trip_uuid ASC
            "
        ))?;

        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let offered_raw: String = row.get(8)?;
            let final_raw: String = row.get(9)?;
            let eater_raw: String = row.get(10)?;

            out.push(ConsolidatedRecord {
                territory: row.get(0)?,
                country_name: row.get(1)?,
                workflow_uuid: row.get(2)?,
                driver_uuid: row.get(3)?,
                delivery_trip_uuid: row.get(4)?,
                courier_flow: row.get(5)?,
                geo_archetype: row.get(6)?,
                merchant_surface: row.get(7)?,
                restaurant_offered_timestamp_utc: decode_utc(
                    &offered_raw,
                    "restaurant_offered_timestamp_utc",
                )?,
                order_final_state_timestamp_local: decode_naive(
                    &final_raw,
                    "order_final_state_timestamp_local",
                )?,
                eater_request_timestamp_local: decode_naive(
                    &eater_raw,
                    "eater_request_timestamp_local",
                )?,
                pickup_distance: row.get(11)?,
                dropoff_distance: row.get(12)?,
                atd_minutes: row.get(13)?,
                datestr: row.get(14)?,
            });
        }
        Ok(out)
    }
}

fn ensure_schema(conn: &Connection, schema: &SummarySchema) -> Result<(), StoreError> {
    if !table_exists(conn, SUMMARY_TABLE)? {
        conn.execute_batch(&format!(
            "
            CREATE TABLE {SUMMARY_TABLE} (
                territory TEXT NOT NULL,
                country_name TEXT NOT NULL,
                workflow_uuid TEXT NOT NULL,
                driver_uuid TEXT NOT NULL,
                delivery_trip_uuid TEXT NOT NULL,
                courier_flow TEXT NOT NULL,
                geo_archetype TEXT NOT NULL,
                merchant_surface TEXT NOT NULL,
                restaurant_offered_timestamp_utc TEXT NOT NULL,
                order_final_state_timestamp_local TEXT NOT NULL,
                eater_request_timestamp_local TEXT NOT NULL,
                pickup_distance REAL NOT NULL,
                dropoff_distance REAL NOT NULL,
                atd_minutes REAL NOT NULL,
                datestr TEXT NOT NULL
            );
            CREATE INDEX idx_{SUMMARY_TABLE}_datestr ON {SUMMARY_TABLE}(datestr);
            CREATE TABLE summary_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            ) WITHOUT ROWID;
            "
        ))?;
        write_meta(conn, schema)?;
        return Ok(());
    }

    let stored_version = read_meta(conn, META_SCHEMA_VERSION_KEY)?;
    let stored_fingerprint = read_meta(conn, META_SCHEMA_FINGERPRINT_KEY)?;

    match (stored_version, stored_fingerprint) {
        (Some(version_raw), Some(fingerprint)) => {
            let actual: u32 = version_raw.parse().map_err(|_| StoreError::CorruptColumn {
                column: "summary_meta.schema_version",
                value: version_raw.clone(),
            })?;
            if actual != schema.version {
                return Err(StoreError::SchemaVersionMismatch {
                    expected: schema.version,
                    actual,
                });
            }
            if fingerprint != schema.fingerprint {
                return Err(StoreError::SchemaFingerprintMismatch {
                    expected: schema.fingerprint.clone(),
                    actual: fingerprint,
                });
            }
            Ok(())
        }
        // Pre-fingerprint store: adopt and stamp.
        _ => write_meta(conn, schema),
    }
}

fn write_meta(conn: &Connection, schema: &SummarySchema) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO summary_meta (key, value) VALUES (?1, ?2)",
        params![META_SCHEMA_VERSION_KEY, schema.version.to_string()],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO summary_meta (key, value) VALUES (?1, ?2)",
        params![META_SCHEMA_FINGERPRINT_KEY, schema.fingerprint],
    )?;
    Ok(())
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    if !table_exists(conn, "summary_meta")? {
        return Ok(None);
    }
    let value = conn
        .query_row(
            "SELECT value FROM summary_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 LIMIT 1",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

fn encode_utc(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn encode_naive(value: NaiveDateTime) -> String {
    value.format(NAIVE_TS_FORMAT).to_string()
}

fn decode_utc(raw: &str, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| StoreError::CorruptColumn {
            column,
            value: raw.to_string(),
        })
}

fn decode_naive(raw: &str, column: &'static str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(raw, NAIVE_TS_FORMAT).map_err(|_| StoreError::CorruptColumn {
        column,
        value: raw.to_string(),
    })
}
