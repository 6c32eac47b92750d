use std::path::Path;

use labrpc::anyhow::Result;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{de::DeserializeOwned, Serialize};

/// A wrapper of RocksDB which provides set, get, remove and prefix scans
/// for types that derive [Serialize](serde::Serialize) and [Deserialize](serde::Deserialize).
pub struct Persistor {
    db: DB,
    sync: bool,
}

/// Writes applied atomically by [`Persistor::write`].
#[derive(Default)]
pub struct Batch {
    inner: WriteBatch,
}

impl Batch {
    /// Queue a set.
    pub fn set<K: AsRef<[u8]>, T: Serialize>(&mut self, key: K, value: &T) -> Result<()> {
        self.inner.put(key, bincode::serialize(value)?);
        Ok(())
    }

    /// Queue a removal.
    pub fn remove<K: AsRef<[u8]>>(&mut self, key: K) {
        self.inner.delete(key);
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Persistor {
    /// Open (or create) the database at `path`. With `sync` every write is
    /// flushed to stable storage before returning.
    pub fn open<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self> {
        Ok(Self {
            db: DB::open_default(path)?,
            sync,
        })
    }

    /// Open an existing database for reading. Every write fails.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            db: DB::open_for_read_only(&Options::default(), path, false)?,
            sync: false,
        })
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync);
        opts
    }

    /// Get a value by given key.
    pub fn get<K, T>(&self, key: K) -> Result<Option<T>>
    where
        K: AsRef<[u8]>,
        T: DeserializeOwned,
    {
        let opt = self.db.get(key)?;
        if let Some(v) = opt {
            Ok(Some(bincode::deserialize(&v)?))
        } else {
            Ok(None)
        }
    }

    /// Set value associated to given key.
    pub fn set<K: AsRef<[u8]>, T: Serialize>(&self, key: K, value: &T) -> Result<()> {
        Ok(self
            .db
            .put_opt(key, bincode::serialize(value)?, &self.write_options())?)
    }

    /// Remove the value of a key, if any.
    pub fn remove<K: AsRef<[u8]>>(&self, key: K) -> Result<()> {
        Ok(self.db.delete_opt(key, &self.write_options())?)
    }

    /// Apply every write of `batch` atomically.
    pub fn write(&self, batch: Batch) -> Result<()> {
        Ok(self.db.write_opt(batch.inner, &self.write_options())?)
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn scan<T: DeserializeOwned>(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, T)>> {
        let mut out = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
        {
            let (k, v) = item?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k.to_vec(), bincode::deserialize(&v)?));
        }
        Ok(out)
    }

    /// Keys starting with `prefix`, without decoding values.
    pub fn scan_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
        {
            let (k, _) = item?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push(k.to_vec());
        }
        Ok(out)
    }
}
