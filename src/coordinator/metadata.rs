//! Durable mutation log using RocksDB
//!
//! Stores:
//! - Accepted-but-unapplied state mutations (sequence → payload)
//!
//! An entry is written with a synced write before the enqueue is acknowledged
//! and deleted once the leader has applied it, so whatever remains on startup
//! is replayed in sequence order.

use crate::common::{timestamp_now_millis, Error, Result};
use rocksdb::{ColumnFamily, IteratorMode, Options, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

const CF_MUTATIONS: &str = "mutations";

/// One queued mutation as persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub seq: u64,
    pub enqueued_at: u64,
    pub payload: Vec<u8>,
}

/// Ordered, durable mutation log
pub struct MutationLog {
    db: DB,
    next_seq: AtomicU64,
}

impl MutationLog {
    /// Open or create the log
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_MUTATIONS])?;

        let next_seq = {
            let cf = db
                .cf_handle(CF_MUTATIONS)
                .ok_or_else(|| Error::MetadataCorrupted("missing mutations column family".into()))?;
            match db.iterator_cf(cf, IteratorMode::End).next() {
                Some(item) => {
                    let (key, _) = item?;
                    decode_seq(&key)? + 1
                }
                None => 1,
            }
        };

        Ok(Self {
            db,
            next_seq: AtomicU64::new(next_seq),
        })
    }

    fn cf(&self) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(CF_MUTATIONS)
            .ok_or_else(|| Error::MetadataCorrupted("missing mutations column family".into()))
    }

    /// Durably append a payload, returning its sequence number
    pub fn append(&self, payload: &[u8]) -> Result<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let record = LogRecord {
            seq,
            enqueued_at: timestamp_now_millis(),
            payload: payload.to_vec(),
        };
        let value = bincode::serialize(&record)?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .put_cf_opt(self.cf()?, seq.to_be_bytes(), value, &write_opts)?;
        Ok(seq)
    }

    /// Drop an applied entry
    pub fn remove(&self, seq: u64) -> Result<()> {
        self.db.delete_cf(self.cf()?, seq.to_be_bytes())?;
        Ok(())
    }

    /// Unapplied entries in sequence order
    pub fn pending(&self) -> Result<Vec<LogRecord>> {
        let iter = self.db.iterator_cf(self.cf()?, IteratorMode::Start);

        let mut records = Vec::new();
        for item in iter {
            let (_, value) = item?;
            let record: LogRecord = bincode::deserialize(&value)?;
            records.push(record);
        }

        Ok(records)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.pending()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_seq(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| Error::MetadataCorrupted(format!("bad sequence key length {}", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}
