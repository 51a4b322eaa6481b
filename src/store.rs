//! Embedded key/value store backed by [`redb`].
//!
//! One database file per service, one table named after the service code.
//! redb gives us what the mirror relies on: an exclusive file lock (a second
//! process cannot open the store), serialized single-writer transactions, and
//! ascending lexicographic key iteration for the cleaner's full scans.

use std::path::Path;
use std::time::{Duration, Instant};

use redb::{Database, ReadableTable, Table, TableDefinition};
use tracing::debug;

use crate::error::MirrorError;

/// How long `open` keeps retrying lock acquisition before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(1);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct Store {
    db: Database,
    bucket: String,
}

impl Store {
    /// Open (creating if necessary) the store at `<dir>/<code>.db` and ensure
    /// the service table exists.
    ///
    /// Lock acquisition is retried for up to one second; a store still held
    /// by another process after that fails with
    /// [`MirrorError::StoreUnavailable`].
    pub fn open(dir: &Path, code: &str) -> Result<Self, MirrorError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| MirrorError::StoreUnavailable(format!("{}: {e}", dir.display())))?;

        let path = dir.join(format!("{code}.db"));
        let deadline = Instant::now() + LOCK_TIMEOUT;

        let db = loop {
            match Database::create(&path) {
                Ok(db) => break db,
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(MirrorError::StoreUnavailable(format!(
                        "{}: {e}",
                        path.display()
                    )));
                }
            }
        };

        let store = Self {
            db,
            bucket: code.to_string(),
        };

        // Create the table up front so read transactions never race it.
        let txn = store.db.begin_write()?;
        txn.open_table(store.table())?;
        txn.commit()?;

        debug!(path = %path.display(), bucket = %store.bucket, "store opened");
        Ok(store)
    }

    fn table(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.bucket)
    }

    /// Fetch the value stored under `key`.
    ///
    /// An absent key and an empty value are indistinguishable to callers;
    /// both fail with [`MirrorError::EmptyKey`].
    pub fn get(&self, key: &str) -> Result<Vec<u8>, MirrorError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(self.table())?;
        match table.get(key)? {
            Some(guard) if !guard.value().is_empty() => Ok(guard.value().to_vec()),
            _ => Err(MirrorError::EmptyKey),
        }
    }

    /// Store `value` under `key` in a single write transaction.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), MirrorError> {
        self.write(|bucket| bucket.put(key, value))
    }

    /// Run `f` inside one serialized read-write transaction.
    ///
    /// All puts and deletes made through the [`WriteBucket`] commit together;
    /// an error from `f` aborts the transaction.
    pub fn write<F, R>(&self, f: F) -> Result<R, MirrorError>
    where
        F: FnOnce(&mut WriteBucket<'_, '_>) -> Result<R, MirrorError>,
    {
        let txn = self.db.begin_write()?;
        let result = {
            let mut table = txn.open_table(self.table())?;
            let mut bucket = WriteBucket { table: &mut table };
            f(&mut bucket)?
        };
        txn.commit()?;
        Ok(result)
    }

    /// Visit every key/value pair in ascending lexicographic key order, on a
    /// read snapshot.
    pub fn for_each<F>(&self, mut f: F) -> Result<(), MirrorError>
    where
        F: FnMut(&str, &[u8]),
    {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(self.table())?;
        for entry in table.iter()? {
            let (key, value) = entry?;
            f(key.value(), value.value());
        }
        Ok(())
    }
}

/// Mutable view of the service table inside a [`Store::write`] transaction.
pub struct WriteBucket<'a, 'txn> {
    table: &'a mut Table<'txn, &'static str, &'static [u8]>,
}

impl WriteBucket<'_, '_> {
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MirrorError> {
        Ok(self.table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    pub fn put(&mut self, key: &str, value: &[u8]) -> Result<(), MirrorError> {
        self.table.insert(key, value)?;
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Result<(), MirrorError> {
        self.table.remove(key)?;
        Ok(())
    }

    /// Visit every key/value pair in ascending key order within this
    /// transaction, uncommitted writes included.
    pub fn for_each<F>(&self, mut f: F) -> Result<(), MirrorError>
    where
        F: FnMut(&str, &[u8]),
    {
        for entry in self.table.iter()? {
            let (key, value) = entry?;
            f(key.value(), value.value());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
