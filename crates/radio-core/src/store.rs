//! Station persistence.
//!
//! The reconciler only ever talks to [`StationStore`]; [`SqliteStore`] is the
//! production backend.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::{debug, info};

use crate::error::{RecorderError, Result};
use crate::station::{Schedule, Station};

pub trait StationStore: Send + Sync {
    /// All stations, ordered by name.
    fn list(&self) -> Result<Vec<Station>>;
    fn get(&self, name: &str) -> Result<Option<Station>>;
    /// Fails with [`RecorderError::Validation`] if the name is taken.
    fn create(&self, station: &Station) -> Result<()>;
    /// Fails with [`RecorderError::UnknownStation`] if nothing was deleted.
    fn delete(&self, name: &str) -> Result<()>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stations (
    name            TEXT PRIMARY KEY NOT NULL,
    source_url      TEXT NOT NULL,
    resolved_url    TEXT NOT NULL,
    always_on       INTEGER NOT NULL DEFAULT 0,
    schedule_start  TEXT,
    schedule_end    TEXT,
    record_reason   TEXT,
    created_at      TEXT NOT NULL
);
";

const COLUMNS: &str =
    "name, source_url, resolved_url, always_on, schedule_start, schedule_end, record_reason, created_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| RecorderError::StoreIo {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!("[store] opened station database {}", path.display());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // a panic mid-statement leaves sqlite itself consistent
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn station_from_row(row: &Row<'_>) -> rusqlite::Result<Station> {
    let start: Option<NaiveDateTime> = row.get(4)?;
    let end: Option<NaiveDateTime> = row.get(5)?;
    let reason: Option<String> = row.get(6)?;
    let schedule = match (start, end) {
        (Some(start), Some(end)) => Some(Schedule { start, end, reason }),
        _ => None,
    };
    let created_at: DateTime<Utc> = row.get(7)?;
    Ok(Station {
        name: row.get(0)?,
        source_url: row.get(1)?,
        resolved_url: row.get(2)?,
        always_on: row.get(3)?,
        schedule,
        created_at,
    })
}

impl StationStore for SqliteStore {
    fn list(&self) -> Result<Vec<Station>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM stations ORDER BY name"))?;
        let stations = stmt
            .query_map([], station_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stations)
    }

    fn get(&self, name: &str) -> Result<Option<Station>> {
        let conn = self.conn();
        let station = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM stations WHERE name = ?1"),
                [name],
                station_from_row,
            )
            .optional()?;
        Ok(station)
    }

    fn create(&self, station: &Station) -> Result<()> {
        let schedule = station.schedule.as_ref();
        let inserted = self.conn().execute(
            &format!("INSERT INTO stations ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                station.name,
                station.source_url,
                station.resolved_url,
                station.always_on,
                schedule.map(|s| s.start),
                schedule.map(|s| s.end),
                schedule.and_then(|s| s.reason.clone()),
                station.created_at,
            ],
        );
        match inserted {
            Ok(_) => {
                debug!("[store] created station {}", station.name);
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(RecorderError::Validation(format!(
                    "station {} already exists",
                    station.name
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, name: &str) -> Result<()> {
        let removed = self
            .conn()
            .execute("DELETE FROM stations WHERE name = ?1", [name])?;
        if removed == 0 {
            return Err(RecorderError::UnknownStation(name.to_string()));
        }
        debug!("[store] deleted station {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::StationDraft;

    fn station(name: &str, url: &str) -> Station {
        StationDraft {
            name: name.into(),
            source_url: url.into(),
            always_on: true,
            schedule: None,
        }
        .into_station(url.into())
    }

    #[test]
    fn create_list_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create(&station("B", "http://b/stream")).unwrap();
        store.create(&station("A", "http://a/stream")).unwrap();

        let names: Vec<_> = store.list().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["A", "B"]);

        store.delete("A").unwrap();
        assert!(store.get("A").unwrap().is_none());
        assert!(matches!(store.delete("A"), Err(RecorderError::UnknownStation(_))));
    }

    #[test]
    fn duplicate_name_rejected_until_deleted() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create(&station("Radio X", "http://one/stream")).unwrap();

        let again = store.create(&station("Radio X", "http://two/stream"));
        assert!(matches!(again, Err(RecorderError::Validation(_))));

        store.delete("Radio X").unwrap();
        store.create(&station("Radio X", "http://two/stream")).unwrap();
        assert_eq!(
            store.get("Radio X").unwrap().unwrap().source_url,
            "http://two/stream"
        );
    }

    #[test]
    fn schedule_round_trips_through_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("stations.db");
        let mut s = station("Night", "http://n/stream.pls");
        s.always_on = false;
        s.resolved_url = "http://n/stream".into();
        s.schedule = Some(Schedule {
            start: NaiveDateTime::parse_from_str("2024-05-01 22:00", "%Y-%m-%d %H:%M").unwrap(),
            end: NaiveDateTime::parse_from_str("2024-05-02 02:00", "%Y-%m-%d %H:%M").unwrap(),
            reason: Some("election night".into()),
        });

        {
            let store = SqliteStore::open(&path).unwrap();
            store.create(&s).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.get("Night").unwrap().unwrap();
        assert_eq!(loaded.schedule, s.schedule);
        assert_eq!(loaded.resolved_url, "http://n/stream");
        assert!(!loaded.always_on);
    }

    #[test]
    fn unwritable_database_dir_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let err = SqliteStore::open(&blocker.join("stations.db")).err().unwrap();
        match err {
            RecorderError::StoreIo { path, .. } => assert_eq!(path, blocker),
            other => panic!("expected StoreIo, got {other:?}"),
        }
    }
}
