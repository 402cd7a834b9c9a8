//! SQLite implementation of the store traits.
//!
//! This is the primary storage backend for DriftSync. It uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use driftsync_core::{
    DeltaRecord, DeviceId, Digest, FetchTask, Name, Priority, StateSnapshot, TaskKey,
};

use crate::error::{Result, StoreError};
use crate::migration::{self, now_millis};
use crate::traits::{DigestLog, TaskStore};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::TaskJoin(e.to_string()))?
    }
}

/// Sequences are stored as the `i64` with the same bits, so every `u64`
/// survives a round trip. SQLite compares them signed: ordering happens in
/// Rust, and SQL only ever tests them for equality.
fn seq_to_sql(seq: u64) -> i64 {
    seq as i64
}

fn seq_from_sql(seq: i64) -> u64 {
    seq as u64
}

fn snapshot_from_rows(rows: Vec<(String, i64)>) -> Result<StateSnapshot> {
    let mut entries = Vec::with_capacity(rows.len());
    for (name, seq) in rows {
        entries.push((name.parse::<DeviceId>()?, seq_from_sql(seq)));
    }
    Ok(StateSnapshot::from_entries(entries))
}

fn digest_recorded(conn: &Connection, digest: &Digest) -> Result<bool> {
    if digest.is_origin() {
        return Ok(true);
    }
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM digest_log WHERE digest = ?1",
            params![digest.0.as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn row_to_task(
    producer: String,
    base_name: String,
    min_seq: i64,
    max_seq: i64,
    priority: i64,
) -> Result<FetchTask> {
    let priority = u8::try_from(priority)
        .map_err(|_| StoreError::InvalidData(format!("priority out of range: {}", priority)))?;
    Ok(FetchTask::new(
        producer.parse()?,
        base_name.parse()?,
        seq_from_sql(min_seq),
        seq_from_sql(max_seq),
        Priority::from_u8(priority)?,
    ))
}

#[async_trait]
impl DigestLog for SqliteStore {
    async fn update_device_seq(&self, device: &DeviceId, seq: u64) -> Result<u64> {
        let device = device.to_string();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT seq FROM device_seq WHERE device_name = ?1",
                    params![device],
                    |row| row.get(0),
                )
                .optional()?;
            let merged = existing.map_or(seq, |stored| seq_from_sql(stored).max(seq));

            tx.execute(
                "INSERT INTO device_seq (device_name, seq, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(device_name) DO UPDATE SET
                    seq = excluded.seq,
                    updated_at = excluded.updated_at",
                params![device, seq_to_sql(merged), now_millis()],
            )?;
            tx.commit()?;
            Ok(merged)
        })
        .await
    }

    async fn device_seq(&self, device: &DeviceId) -> Result<Option<u64>> {
        let device = device.to_string();

        self.blocking(move |conn| {
            let seq: Option<i64> = conn
                .query_row(
                    "SELECT seq FROM device_seq WHERE device_name = ?1",
                    params![device],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(seq.map(seq_from_sql))
        })
        .await
    }

    async fn update_locator(&self, device: &DeviceId, locator: &Name) -> Result<()> {
        let device = device.to_string();
        let locator = locator.to_string();

        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO device_seq (device_name, seq, locator, updated_at) VALUES (?1, 0, ?2, ?3)
                 ON CONFLICT(device_name) DO UPDATE SET
                    locator = excluded.locator,
                    updated_at = excluded.updated_at",
                params![device, locator, now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn locator(&self, device: &DeviceId) -> Result<Option<Name>> {
        let device = device.to_string();

        self.blocking(move |conn| {
            let locator: Option<Option<String>> = conn
                .query_row(
                    "SELECT locator FROM device_seq WHERE device_name = ?1",
                    params![device],
                    |row| row.get(0),
                )
                .optional()?;
            match locator.flatten() {
                Some(text) => Ok(Some(text.parse()?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn current_state(&self) -> Result<StateSnapshot> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT device_name, seq FROM device_seq WHERE seq != 0")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<(String, i64)>>>()?;
            snapshot_from_rows(rows)
        })
        .await
    }

    async fn remember_state(&self) -> Result<Digest> {
        self.blocking(|conn| {
            let tx = conn.transaction()?;

            let rows = {
                let mut stmt =
                    tx.prepare("SELECT device_name, seq FROM device_seq WHERE seq != 0")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<(String, i64)>>>()?;
                rows
            };
            let snapshot = snapshot_from_rows(rows)?;
            let digest = snapshot.digest();

            // Re-recording a digest replaces its rows.
            tx.execute(
                "DELETE FROM digest_snapshot WHERE digest = ?1",
                params![digest.0.as_slice()],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO digest_log (digest, recorded_at) VALUES (?1, ?2)",
                params![digest.0.as_slice(), now_millis()],
            )?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO digest_snapshot (digest, device_name, seq) VALUES (?1, ?2, ?3)",
                )?;
                for (device, seq) in snapshot.iter() {
                    insert.execute(params![digest.0.as_slice(), device.to_string(), seq_to_sql(seq)])?;
                }
            }

            tx.commit()?;
            tracing::trace!(%digest, devices = snapshot.len(), "recorded state digest");
            Ok(digest)
        })
        .await
    }

    async fn is_known_digest(&self, digest: &Digest) -> Result<bool> {
        let digest = *digest;
        self.blocking(move |conn| digest_recorded(conn, &digest)).await
    }

    async fn snapshot(&self, digest: &Digest) -> Result<Option<StateSnapshot>> {
        let digest = *digest;

        self.blocking(move |conn| {
            if !digest_recorded(conn, &digest)? {
                return Ok(None);
            }
            let mut stmt =
                conn.prepare("SELECT device_name, seq FROM digest_snapshot WHERE digest = ?1")?;
            let rows = stmt
                .query_map(params![digest.0.as_slice()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<(String, i64)>>>()?;
            snapshot_from_rows(rows).map(Some)
        })
        .await
    }

    async fn find_differences(
        &self,
        old: &Digest,
        new: &Digest,
        include_old_seq: bool,
    ) -> Result<Vec<DeltaRecord>> {
        let old = *old;
        let new = *new;

        self.blocking(move |conn| {
            for digest in [&old, &new] {
                if !digest_recorded(conn, digest)? {
                    return Err(StoreError::UnknownDigest(*digest));
                }
            }

            let mut stmt = conn.prepare(
                "SELECT n.device_name, n.seq, o.seq, d.locator
                 FROM digest_snapshot n
                 LEFT JOIN digest_snapshot o ON o.digest = ?1 AND o.device_name = n.device_name
                 LEFT JOIN device_seq d ON d.device_name = n.device_name
                 WHERE n.digest = ?2 AND (o.seq IS NULL OR o.seq != n.seq)
                 UNION ALL
                 SELECT o.device_name, NULL, o.seq, d.locator
                 FROM digest_snapshot o
                 LEFT JOIN device_seq d ON d.device_name = o.device_name
                 WHERE o.digest = ?1 AND NOT EXISTS (
                    SELECT 1 FROM digest_snapshot n
                    WHERE n.digest = ?2 AND n.device_name = o.device_name
                 )",
            )?;
            let rows = stmt
                .query_map(params![old.0.as_slice(), new.0.as_slice()], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<rusqlite::Result<Vec<(String, Option<i64>, Option<i64>, Option<String>)>>>()?;

            let mut records = Vec::with_capacity(rows.len());
            for (device, new_seq, old_seq, locator) in rows {
                let device: DeviceId = device.parse()?;
                let mut record = match new_seq {
                    Some(seq) => DeltaRecord::update(device, seq_from_sql(seq)),
                    None => DeltaRecord::delete(device),
                };
                if include_old_seq {
                    record.old_seq = Some(old_seq.map_or(0, seq_from_sql));
                }
                if let Some(locator) = locator {
                    record.locator = Some(locator.parse()?);
                }
                records.push(record);
            }
            records.sort_by(|a, b| a.device.cmp(&b.device));
            Ok(records)
        })
        .await
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn save_task(&self, task: &FetchTask) -> Result<bool> {
        let task = task.clone();

        self.blocking(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO fetch_tasks
                    (producer, base_name, min_seq, max_seq, priority, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    task.producer.to_string(),
                    task.base_name.to_string(),
                    seq_to_sql(task.min_seq),
                    seq_to_sql(task.max_seq),
                    task.priority.as_u8() as i64,
                    now_millis(),
                ],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn merge_task(&self, task: &FetchTask) -> Result<FetchTask> {
        let task = task.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let producer = task.producer.to_string();
            let base_name = task.base_name.to_string();
            let stored = tx
                .query_row(
                    "SELECT producer, base_name, min_seq, max_seq, priority
                     FROM fetch_tasks WHERE producer = ?1 AND base_name = ?2",
                    params![producer, base_name],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                )
                .optional()?;

            let merged = match stored {
                Some((producer, base, min, max, priority)) => {
                    let mut merged = row_to_task(producer, base, min, max, priority)?;
                    if merged.widen(&task) {
                        tx.execute(
                            "UPDATE fetch_tasks SET min_seq = ?3, max_seq = ?4, priority = ?5
                             WHERE producer = ?1 AND base_name = ?2",
                            params![
                                merged.producer.to_string(),
                                merged.base_name.to_string(),
                                seq_to_sql(merged.min_seq),
                                seq_to_sql(merged.max_seq),
                                merged.priority.as_u8() as i64,
                            ],
                        )?;
                    }
                    merged
                }
                None => {
                    tx.execute(
                        "INSERT INTO fetch_tasks
                            (producer, base_name, min_seq, max_seq, priority, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            producer,
                            base_name,
                            seq_to_sql(task.min_seq),
                            seq_to_sql(task.max_seq),
                            task.priority.as_u8() as i64,
                            now_millis(),
                        ],
                    )?;
                    task
                }
            };
            tx.commit()?;
            Ok(merged)
        })
        .await
    }

    async fn delete_task(&self, key: &TaskKey) -> Result<bool> {
        let producer = key.producer.to_string();
        let base_name = key.base_name.to_string();

        self.blocking(move |conn| {
            let removed = conn.execute(
                "DELETE FROM fetch_tasks WHERE producer = ?1 AND base_name = ?2",
                params![producer, base_name],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn has_task(&self, key: &TaskKey) -> Result<bool> {
        let producer = key.producer.to_string();
        let base_name = key.base_name.to_string();

        self.blocking(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM fetch_tasks WHERE producer = ?1 AND base_name = ?2",
                    params![producer, base_name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn list_tasks(&self) -> Result<Vec<FetchTask>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT producer, base_name, min_seq, max_seq, priority
                 FROM fetch_tasks ORDER BY created_at, rowid",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?
                .collect::<rusqlite::Result<Vec<(String, String, i64, i64, i64)>>>()?;

            rows.into_iter()
                .map(|(producer, base, min, max, priority)| {
                    row_to_task(producer, base, min, max, priority)
                })
                .collect()
        })
        .await
    }
}
