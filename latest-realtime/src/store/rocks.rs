//! RocksDB-backed record store.
//!
//! Column families:
//! - `records`: one value per record, keyed `<model>/<id>`, holding the
//!   record's JSON compressed with LZ4 (size-prepended)
//!
//! Compare-and-set is read → check → write under a store-wide write guard,
//! so two updates of the same record can never both observe the old
//! version. Writes go through `WriteBatch` so each mutation lands atomically.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::interceptor::{MutationStore, UpdateRequest};
use crate::record::{EntityKind, Record, VersionedFilter};

const CF_RECORDS: &str = "records";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksStoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for RocksStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("realtime_data"),
            block_cache_size: 64 * 1024 * 1024,
            max_open_files: 256,
            sync_writes: false,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl RocksStoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            max_open_files: 64,
            sync_writes: false,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RocksStoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("{model} {id} already exists")]
    Duplicate { model: EntityKind, id: String },
}

impl From<rocksdb::Error> for RocksStoreError {
    fn from(e: rocksdb::Error) -> Self {
        RocksStoreError::Database(e.to_string())
    }
}

/// Durable [`MutationStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksStoreConfig,
    /// Serializes every read-check-write.
    write_guard: Mutex<()>,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: RocksStoreConfig) -> Result<Self, RocksStoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let descriptors = vec![ColumnFamilyDescriptor::new(
            CF_RECORDS,
            Self::cf_options(&config),
        )];
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            descriptors,
        )?;

        log::info!("Opened record store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            write_guard: Mutex::new(()),
        })
    }

    fn cf_options(config: &RocksStoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 frames.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Load a record by kind and id.
    pub fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Record>, RocksStoreError> {
        let cf = self.cf()?;
        match self.db.get_cf(&cf, Self::key(kind, id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All records of one kind, in id order.
    pub fn list(&self, kind: EntityKind) -> Result<Vec<Record>, RocksStoreError> {
        let cf = self.cf()?;
        let prefix = Self::key(kind, "");
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut records = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            records.push(decode(&value)?);
        }
        Ok(records)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), RocksStoreError> {
        let cf = self.cf()?;
        self.db.flush_cf(&cf)?;
        Ok(())
    }

    fn insert_locked(&self, kind: EntityKind, record: &Record) -> Result<(), RocksStoreError> {
        let key = Self::key(kind, &record.id);
        let cf = self.cf()?;
        if self.db.get_cf(&cf, &key)?.is_some() {
            return Err(RocksStoreError::Duplicate {
                model: kind,
                id: record.id.clone(),
            });
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, &key, encode(record)?);
        self.write(batch)
    }

    fn update_locked(
        &self,
        kind: EntityKind,
        request: &UpdateRequest,
    ) -> Result<Option<Record>, RocksStoreError> {
        let Some(mut record) = self.get(kind, &request.filter.base.id)? else {
            return Ok(None);
        };
        if !request.filter.matches(&record) {
            return Ok(None);
        }
        record.apply_changes(&request.changes);
        record.version = request.next_version;

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf()?, Self::key(kind, &record.id), encode(&record)?);
        self.write(batch)?;
        Ok(Some(record))
    }

    fn delete_locked(
        &self,
        kind: EntityKind,
        filter: &VersionedFilter,
    ) -> Result<Option<Record>, RocksStoreError> {
        let Some(record) = self.get(kind, &filter.base.id)? else {
            return Ok(None);
        };
        if !filter.matches(&record) {
            return Ok(None);
        }
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf()?, Self::key(kind, &record.id));
        self.write(batch)?;
        Ok(Some(record))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), RocksStoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, RocksStoreError> {
        self.db
            .cf_handle(CF_RECORDS)
            .ok_or_else(|| RocksStoreError::Database(format!("Column family '{CF_RECORDS}' not found")))
    }

    /// `<model>/<id>`
    fn key(kind: EntityKind, id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(kind.as_str().len() + 1 + id.len());
        key.extend_from_slice(kind.as_str().as_bytes());
        key.push(b'/');
        key.extend_from_slice(id.as_bytes());
        key
    }
}

fn encode(record: &Record) -> Result<Vec<u8>, RocksStoreError> {
    let json = serde_json::to_vec(record).map_err(|e| RocksStoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode(bytes: &[u8]) -> Result<Record, RocksStoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| RocksStoreError::Compression(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| RocksStoreError::Deserialization(e.to_string()))
}

#[async_trait]
impl MutationStore for RocksStore {
    type Error = RocksStoreError;

    async fn insert(&self, kind: EntityKind, record: Record) -> Result<Record, RocksStoreError> {
        let _guard = self.write_guard.lock().await;
        self.insert_locked(kind, &record)?;
        Ok(record)
    }

    async fn update_where(
        &self,
        kind: EntityKind,
        request: UpdateRequest,
    ) -> Result<Option<Record>, RocksStoreError> {
        let _guard = self.write_guard.lock().await;
        self.update_locked(kind, &request)
    }

    async fn delete_where(
        &self,
        kind: EntityKind,
        filter: VersionedFilter,
    ) -> Result<Option<Record>, RocksStoreError> {
        let _guard = self.write_guard.lock().await;
        self.delete_locked(kind, &filter)
    }
}
