//! Embedded metadata store over sqlite.
//!
//! Single-writer discipline with concurrent readers, backed by WAL journal
//! mode and a busy timeout on every pooled connection. The schema is created
//! with idempotent DDL at open, so a fresh database file is usable
//! immediately and an existing one is left untouched.

use std::path::Path;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sql_query;
use diesel::upsert::excluded;
use tracing::info;

use ha_ingest_core::config::MetadataConfig;
use ha_ingest_core::error::{IngestError, IngestResult};
use ha_ingest_core::events::{DeviceRecord, EntityRecord};

use super::models::{DeviceRow, EntityRow};
use super::schema::{devices, entities};

pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;
type SqlitePooled = PooledConnection<ConnectionManager<SqliteConnection>>;

const SCHEMA_DDL: &str = "
CREATE TABLE IF NOT EXISTS devices (
    device_id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    manufacturer TEXT,
    model TEXT,
    sw_version TEXT,
    area_id TEXT,
    entity_count INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS entities (
    entity_id TEXT PRIMARY KEY NOT NULL,
    device_id TEXT,
    domain TEXT NOT NULL,
    platform TEXT NOT NULL DEFAULT 'unknown',
    disabled BOOLEAN NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_devices_area ON devices(area_id);
CREATE INDEX IF NOT EXISTS idx_devices_manufacturer ON devices(manufacturer);
CREATE INDEX IF NOT EXISTS idx_entities_domain ON entities(domain);
CREATE INDEX IF NOT EXISTS idx_entities_device ON entities(device_id);
";

#[derive(Debug)]
struct SqlitePragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = 5000;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Handle to the embedded store; cheap to clone, pool-backed.
#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (and create if absent) the database at the configured path.
    pub fn open(config: &MetadataConfig) -> IngestResult<Self> {
        if let Some(parent) = Path::new(&config.db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    IngestError::configuration(format!(
                        "cannot create metadata directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let manager = ConnectionManager::<SqliteConnection>::new(&config.db_path);
        let pool = Pool::builder()
            .max_size(4)
            .connection_customizer(Box::new(SqlitePragmas))
            .build(manager)
            .map_err(|e| {
                IngestError::configuration(format!(
                    "cannot open metadata store {}: {}",
                    config.db_path, e
                ))
            })?;

        let store = MetadataStore { pool };
        let mut conn = store.connection()?;
        conn.batch_execute(SCHEMA_DDL).map_err(map_write_error)?;
        info!(path = %config.db_path, "metadata store ready");
        Ok(store)
    }

    fn connection(&self) -> IngestResult<SqlitePooled> {
        self.pool.get().map_err(|e| {
            IngestError::persistence_transient("metadata", format!("pool exhausted: {}", e))
        })
    }

    /// Upsert a set of devices in one transaction. The materialized entity
    /// count is preserved on conflict.
    pub fn upsert_devices(&self, records: &[DeviceRecord]) -> IngestResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let rows: Vec<DeviceRow> = records.iter().map(DeviceRow::from).collect();
        let mut conn = self.connection()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            for row in &rows {
                diesel::insert_into(devices::table)
                    .values(row)
                    .on_conflict(devices::device_id)
                    .do_update()
                    .set((
                        devices::name.eq(excluded(devices::name)),
                        devices::manufacturer.eq(excluded(devices::manufacturer)),
                        devices::model.eq(excluded(devices::model)),
                        devices::sw_version.eq(excluded(devices::sw_version)),
                        devices::area_id.eq(excluded(devices::area_id)),
                    ))
                    .execute(conn)?;
            }
            Ok(rows.len())
        })
        .map_err(map_write_error)
    }

    /// Upsert a set of entities in one transaction.
    pub fn upsert_entities(&self, records: &[EntityRecord]) -> IngestResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let rows: Vec<EntityRow> = records.iter().map(EntityRow::from).collect();
        let mut conn = self.connection()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            for row in &rows {
                diesel::insert_into(entities::table)
                    .values(row)
                    .on_conflict(entities::entity_id)
                    .do_update()
                    .set((
                        entities::device_id.eq(excluded(entities::device_id)),
                        entities::domain.eq(excluded(entities::domain)),
                        entities::platform.eq(excluded(entities::platform)),
                        entities::disabled.eq(excluded(entities::disabled)),
                    ))
                    .execute(conn)?;
            }
            Ok(rows.len())
        })
        .map_err(map_write_error)
    }

    /// Insert stub rows for entities first seen in the stream; existing rows
    /// (including richer registry data) are left untouched.
    pub fn ensure_entities(&self, records: &[EntityRecord]) -> IngestResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let rows: Vec<EntityRow> = records.iter().map(EntityRow::from).collect();
        let mut conn = self.connection()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let mut inserted = 0;
            for row in &rows {
                inserted += diesel::insert_into(entities::table)
                    .values(row)
                    .on_conflict(entities::entity_id)
                    .do_nothing()
                    .execute(conn)?;
            }
            Ok(inserted)
        })
        .map_err(map_write_error)
    }

    /// Recompute the materialized per-device entity count.
    pub fn refresh_entity_counts(&self) -> IngestResult<()> {
        let mut conn = self.connection()?;
        sql_query(
            "UPDATE devices SET entity_count = \
             (SELECT COUNT(*) FROM entities WHERE entities.device_id = devices.device_id)",
        )
        .execute(&mut conn)
        .map_err(map_write_error)?;
        Ok(())
    }

    pub fn device(&self, id: &str) -> IngestResult<Option<DeviceRow>> {
        let mut conn = self.connection()?;
        devices::table
            .find(id)
            .first::<DeviceRow>(&mut conn)
            .optional()
            .map_err(map_write_error)
    }

    pub fn entity(&self, id: &str) -> IngestResult<Option<EntityRow>> {
        let mut conn = self.connection()?;
        entities::table
            .find(id)
            .first::<EntityRow>(&mut conn)
            .optional()
            .map_err(map_write_error)
    }

    pub fn device_count(&self) -> IngestResult<i64> {
        let mut conn = self.connection()?;
        devices::table
            .count()
            .get_result(&mut conn)
            .map_err(map_write_error)
    }

    pub fn entity_count(&self) -> IngestResult<i64> {
        let mut conn = self.connection()?;
        entities::table
            .count()
            .get_result(&mut conn)
            .map_err(map_write_error)
    }
}

/// Busy/locked conditions are transient (another connection holds the write
/// lock); everything else indicates a schema or data bug and is permanent.
fn map_write_error(err: diesel::result::Error) -> IngestError {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("locked") || lowered.contains("busy") {
        IngestError::persistence_transient("metadata", message)
    } else {
        IngestError::persistence_permanent("metadata", message)
    }
}
