//! SQLite implementation of every store trait
//!
//! One database holds the raw, normalized and canonical layers plus the
//! collector bookkeeping. A single connection behind a mutex is the one
//! writer; WAL mode lets external readers inspect the file while a run is
//! writing.

use super::models::{
    CanonicalRecord, CollectorState, NewRawUnit, NormalizedRecord, PageRecord, RawUnit,
    StageState,
};
use super::{DomainStore, RawStore, StateStore, ToolStore};
use crate::config::EngineConfig;
use crate::{CollectError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use didgen::DomainId;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to SQLite database file
    pub path: PathBuf,

    /// Enable WAL mode for concurrent readers
    pub wal_mode: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("collectkit");
        path.push("collect.db");

        Self {
            path,
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

impl From<&EngineConfig> for StoreConfig {
    fn from(config: &EngineConfig) -> Self {
        Self::at(config.database.clone())
    }
}

/// SQLite-backed raw, state, tool and domain store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store database
    pub fn open(config: StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %config.path.display(), "Opening collection store");

        let conn = Connection::open(&config.path)?;
        if config.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Self::with_connection(conn)
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS _raw_units (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                params TEXT NOT NULL,
                input TEXT,
                page INTEGER,
                url TEXT NOT NULL,
                data BLOB NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS _collector_pages (
                table_name TEXT NOT NULL,
                params TEXT NOT NULL,
                input_key TEXT NOT NULL,
                page INTEGER NOT NULL,
                item_count INTEGER NOT NULL,
                total_pages INTEGER,
                next_cursor TEXT,
                has_next INTEGER NOT NULL,
                finished INTEGER NOT NULL,
                max_updated_at TEXT,
                committed_at TEXT NOT NULL,
                PRIMARY KEY (table_name, params, input_key, page)
            );

            CREATE TABLE IF NOT EXISTS _collector_state (
                connection_id INTEGER NOT NULL,
                scope TEXT NOT NULL,
                table_name TEXT NOT NULL,
                since_cursor TEXT,
                latest_success_start TEXT,
                time_after TEXT,
                run_started_at TEXT,
                run_since TEXT,
                run_incremental INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (connection_id, scope, table_name)
            );

            CREATE TABLE IF NOT EXISTS _stage_state (
                stage TEXT NOT NULL,
                params TEXT NOT NULL,
                last_raw_id INTEGER NOT NULL,
                config TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (stage, params)
            );

            CREATE TABLE IF NOT EXISTS _tool_records (
                kind TEXT NOT NULL,
                connection_id INTEGER NOT NULL,
                native_id TEXT NOT NULL,
                params TEXT NOT NULL,
                raw_table TEXT NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (kind, connection_id, native_id)
            );

            CREATE TABLE IF NOT EXISTS _domain_records (
                table_name TEXT NOT NULL,
                id TEXT NOT NULL,
                params TEXT NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (table_name, id)
            );

            CREATE INDEX IF NOT EXISTS idx_raw_units_scope ON _raw_units(table_name, params, id);
            CREATE INDEX IF NOT EXISTS idx_tool_origin ON _tool_records(raw_table, params);
            CREATE INDEX IF NOT EXISTS idx_tool_scope ON _tool_records(kind, params, connection_id, native_id);
            CREATE INDEX IF NOT EXISTS idx_domain_origin ON _domain_records(table_name, params);
            "#,
        )?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CollectError::Other("store connection lock poisoned".to_string()))
    }
}

fn ts_to_sql(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true))
}

fn ts_from_sql(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| CollectError::Other(format!("Invalid timestamp '{}' in store: {}", s, e)))
    })
    .transpose()
}

fn now_sql() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl RawStore for SqliteStore {
    fn flush_raw(&self, table: &str, params: &str) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM _raw_units WHERE table_name = ?1 AND params = ?2",
            params![table, params],
        )?;
        tracing::debug!(table, params, deleted, "Flushed raw units");
        Ok(deleted)
    }

    fn commit_page(&self, page: &PageRecord, units: &[NewRawUnit]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = now_sql();

        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO _raw_units (table_name, params, input, page, url, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for unit in units {
                insert.execute(params![
                    page.table,
                    unit.params,
                    unit.input,
                    unit.page.map(|p| p as i64),
                    unit.url,
                    unit.data,
                    now,
                ])?;
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO _collector_pages (
                table_name, params, input_key, page, item_count, total_pages,
                next_cursor, has_next, finished, max_updated_at, committed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                page.table,
                page.params,
                page.input_key,
                page.page as i64,
                page.item_count as i64,
                page.total_pages.map(|t| t as i64),
                page.next_cursor,
                page.has_next,
                page.finished,
                ts_to_sql(page.max_updated_at),
                now,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn ledger_pages(&self, table: &str, params: &str) -> Result<Vec<PageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT input_key, page, item_count, total_pages, next_cursor, has_next, finished, max_updated_at
             FROM _collector_pages WHERE table_name = ?1 AND params = ?2
             ORDER BY input_key, page",
        )?;
        let rows = stmt
            .query_map(params![table, params], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(input_key, page, item_count, total_pages, next_cursor, has_next, finished, max)| {
                    Ok(PageRecord {
                        table: table.to_string(),
                        params: params.to_string(),
                        input_key,
                        page: page as usize,
                        item_count: item_count as usize,
                        total_pages: total_pages.map(|t| t as usize),
                        next_cursor,
                        has_next,
                        finished,
                        max_updated_at: ts_from_sql(max)?,
                    })
                },
            )
            .collect()
    }

    fn clear_ledger(&self, table: &str, params: &str) -> Result<()> {
        self.conn()?.execute(
            "DELETE FROM _collector_pages WHERE table_name = ?1 AND params = ?2",
            params![table, params],
        )?;
        Ok(())
    }

    fn raw_units_after(
        &self,
        table: &str,
        params: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<RawUnit>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, input, page, url, data, created_at FROM _raw_units
             WHERE table_name = ?1 AND params = ?2 AND id > ?3
             ORDER BY id LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(params![table, params, after_id, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, input, page, url, data, created_at)| {
                Ok(RawUnit {
                    id,
                    table: table.to_string(),
                    params: params.to_string(),
                    input,
                    page: page.map(|p| p as usize),
                    url,
                    data,
                    created_at: ts_from_sql(Some(created_at))?.unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    fn count_raw(&self, table: &str, params: &str) -> Result<usize> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM _raw_units WHERE table_name = ?1 AND params = ?2",
            params![table, params],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl StateStore for SqliteStore {
    fn load_collector_state(
        &self,
        connection_id: u64,
        scope: &str,
        table: &str,
    ) -> Result<Option<CollectorState>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT since_cursor, latest_success_start, time_after, run_started_at, run_since, run_incremental
                 FROM _collector_state WHERE connection_id = ?1 AND scope = ?2 AND table_name = ?3",
                params![connection_id as i64, scope, table],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, bool>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((since, success, after, started, run_since, run_incremental)) = row else {
            return Ok(None);
        };

        Ok(Some(CollectorState {
            connection_id,
            scope: scope.to_string(),
            table: table.to_string(),
            since_cursor: ts_from_sql(since)?,
            latest_success_start: ts_from_sql(success)?,
            time_after: ts_from_sql(after)?,
            run_started_at: ts_from_sql(started)?,
            run_since: ts_from_sql(run_since)?,
            run_incremental,
        }))
    }

    fn save_collector_state(&self, state: &CollectorState) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO _collector_state (
                connection_id, scope, table_name, since_cursor, latest_success_start,
                time_after, run_started_at, run_since, run_incremental
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                state.connection_id as i64,
                state.scope,
                state.table,
                ts_to_sql(state.since_cursor),
                ts_to_sql(state.latest_success_start),
                ts_to_sql(state.time_after),
                ts_to_sql(state.run_started_at),
                ts_to_sql(state.run_since),
                state.run_incremental,
            ],
        )?;
        Ok(())
    }

    fn load_stage_state(&self, stage: &str, params: &str) -> Result<Option<StageState>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT last_raw_id, config, updated_at FROM _stage_state
                 WHERE stage = ?1 AND params = ?2",
                params![stage, params],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((last_raw_id, config, updated_at)) => Ok(Some(StageState {
                stage: stage.to_string(),
                params: params.to_string(),
                last_raw_id,
                config,
                updated_at: ts_from_sql(Some(updated_at))?.unwrap_or_else(Utc::now),
            })),
            None => Ok(None),
        }
    }

    fn save_stage_state(&self, state: &StageState) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO _stage_state (stage, params, last_raw_id, config, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                state.stage,
                state.params,
                state.last_raw_id,
                state.config,
                ts_to_sql(Some(state.updated_at)),
            ],
        )?;
        Ok(())
    }
}

type ToolRow = (String, i64, String, String, String, Vec<u8>);

fn tool_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_tool_rows(rows: Vec<ToolRow>) -> Result<Vec<NormalizedRecord>> {
    rows.into_iter()
        .map(|(kind, connection_id, native_id, params, raw_table, data)| {
            Ok(NormalizedRecord {
                kind,
                connection_id: connection_id as u64,
                native_id,
                data: serde_json::from_slice(&data)?,
                params,
                raw_table,
            })
        })
        .collect()
}

impl ToolStore for SqliteStore {
    fn upsert_normalized(&self, records: &[NormalizedRecord]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO _tool_records (kind, connection_id, native_id, params, raw_table, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for record in records {
                stmt.execute(params![
                    record.kind,
                    record.connection_id as i64,
                    record.native_id,
                    record.params,
                    record.raw_table,
                    serde_json::to_vec(&record.data)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_normalized_origin(&self, raw_table: &str, params: &str) -> Result<usize> {
        let deleted = self.conn()?.execute(
            "DELETE FROM _tool_records WHERE raw_table = ?1 AND params = ?2",
            params![raw_table, params],
        )?;
        Ok(deleted)
    }

    fn normalized_batch(
        &self,
        kind: &str,
        params: &str,
        after: Option<&(u64, String)>,
        limit: usize,
    ) -> Result<Vec<NormalizedRecord>> {
        let (after_conn, after_native) = match after {
            Some((conn_id, native)) => (*conn_id as i64, native.as_str()),
            None => (-1, ""),
        };
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT kind, connection_id, native_id, params, raw_table, data FROM _tool_records
             WHERE kind = ?1 AND params = ?2
               AND (connection_id > ?3 OR (connection_id = ?3 AND native_id > ?4))
             ORDER BY connection_id, native_id LIMIT ?5",
        )?;
        let rows = stmt
            .query_map(
                params![kind, params, after_conn, after_native, limit as i64],
                tool_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        decode_tool_rows(rows)
    }

    fn normalized_all(&self, kind: &str) -> Result<Vec<NormalizedRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT kind, connection_id, native_id, params, raw_table, data FROM _tool_records
             WHERE kind = ?1 ORDER BY connection_id, native_id",
        )?;
        let rows = stmt
            .query_map(params![kind], tool_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        decode_tool_rows(rows)
    }
}

impl DomainStore for SqliteStore {
    fn upsert_canonical(&self, records: &[CanonicalRecord]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO _domain_records (table_name, id, params, data)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for record in records {
                stmt.execute(params![
                    record.table,
                    record.id.as_str(),
                    record.params,
                    serde_json::to_vec(&record.data)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_canonical_origin(&self, table: &str, params: &str) -> Result<usize> {
        let deleted = self.conn()?.execute(
            "DELETE FROM _domain_records WHERE table_name = ?1 AND params = ?2",
            params![table, params],
        )?;
        Ok(deleted)
    }

    fn canonical_all(&self, table: &str) -> Result<Vec<CanonicalRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, params, data FROM _domain_records WHERE table_name = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![table], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, params, data)| {
                Ok(CanonicalRecord {
                    table: table.to_string(),
                    id: DomainId::from_encoded(id),
                    data: serde_json::from_slice(&data)?,
                    params,
                })
            })
            .collect()
    }
}
