//! Embedded relational storage (DuckDB), behind the `duckdb` feature.
//!
//! Observations are stored as JSON payloads keyed by append sequence, with the
//! timestamp in its own column so window and cutoff filters run in SQL.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use duckdb::{params, params_from_iter, Connection};

use super::{check_order, ObservationsStorage, StorageError, Window};
use crate::domain::Observation;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS observations (
    seq BIGINT PRIMARY KEY,
    ts_micros BIGINT NOT NULL,
    payload VARCHAR NOT NULL
)";

impl From<duckdb::Error> for StorageError {
    fn from(err: duckdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

pub struct DuckDbStorage {
    conn: Mutex<Connection>,
    len: usize,
    latest: Option<DateTime<Utc>>,
}

impl DuckDbStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        let (count, max_ts): (i64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MAX(ts_micros) FROM observations",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            len: usize::try_from(count).unwrap_or(0),
            latest: max_ts.and_then(DateTime::from_timestamp_micros),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Backend("connection lock poisoned".into()))
    }
}

impl ObservationsStorage for DuckDbStorage {
    fn append(&mut self, observation: Observation) -> Result<(), StorageError> {
        check_order(self.latest, &observation)?;
        let payload = serde_json::to_string(&observation)?;
        let seq = self.len as i64;
        self.lock()?.execute(
            "INSERT INTO observations (seq, ts_micros, payload) VALUES (?, ?, ?)",
            params![seq, observation.timestamp.timestamp_micros(), payload],
        )?;
        self.len += 1;
        self.latest = Some(observation.timestamp);
        Ok(())
    }

    fn read_bounded(
        &self,
        window: &Window,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, StorageError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<i64> = Vec::new();
        if let Some(c) = cutoff {
            clauses.push("ts_micros <= ?");
            args.push(c.timestamp_micros());
        }
        if let Window::Range { start, end } = window {
            clauses.push("ts_micros >= ?");
            args.push(start.timestamp_micros());
            clauses.push("ts_micros <= ?");
            args.push(end.timestamp_micros());
        }

        let mut sql = String::from("SELECT payload FROM observations");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        match window {
            Window::Last(n) => sql.push_str(&format!(" ORDER BY seq DESC LIMIT {n}")),
            _ => sql.push_str(" ORDER BY seq"),
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for payload in rows {
            out.push(serde_json::from_str::<Observation>(&payload?)?);
        }
        if matches!(window, Window::Last(_)) {
            out.reverse();
        }
        Ok(out)
    }

    fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.latest
    }

    fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GlobalState;
    use chrono::{Duration, TimeZone};

    #[test]
    fn last_window_respects_cutoff() {
        let mut storage = DuckDbStorage::in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 0..6 {
            storage
                .append(
                    Observation::new(t0 + Duration::hours(i))
                        .with_state("S", GlobalState::spot(1.0)),
                )
                .unwrap();
        }
        let cutoff = t0 + Duration::hours(3);
        let out = storage.read_bounded(&Window::Last(2), Some(cutoff)).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].timestamp, cutoff);
        assert!(out[0].timestamp < out[1].timestamp);
    }
}
