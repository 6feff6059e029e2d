// Database - RocksDB-backed Storage
use super::kv::{Storage, StorageError, WriteOp};
use rocksdb::{Options, DB};
use std::path::Path;
use std::sync::Arc;

/// Wrapper around RocksDB
pub struct Database {
    db: Arc<DB>,
}

impl Database {
    /// Opens or creates a database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // Bound file accumulation to avoid "Too many open files"
        opts.set_keep_log_file_num(5);
        opts.set_max_manifest_file_size(64 * 1024 * 1024);
        opts.set_max_background_jobs(2);
        opts.set_recycle_log_file_num(2);

        let db = DB::open(&opts, path).map_err(|e| DatabaseError::OpenFailed(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Reads a value
    pub fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.db
            .get(key)
            .map_err(|e| DatabaseError::ReadFailed(e.to_string()))
    }

    /// Writes a value
    pub fn put_raw(&self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        self.db
            .put(key, value)
            .map_err(|e| DatabaseError::WriteFailed(e.to_string()))
    }

    /// Deletes a key
    pub fn delete_raw(&self, key: &[u8]) -> Result<(), DatabaseError> {
        self.db
            .delete(key)
            .map_err(|e| DatabaseError::WriteFailed(e.to_string()))
    }

    /// Atomic batch write
    pub fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), DatabaseError> {
        let mut batch = rocksdb::WriteBatch::default();

        for op in ops {
            match op {
                WriteOp::Put { key, value } => batch.put(&key, &value),
                WriteOp::Delete { key } => batch.delete(&key),
            }
        }

        self.db
            .write(batch)
            .map_err(|e| DatabaseError::WriteFailed(e.to_string()))
    }
}

impl Storage for Database {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StorageError> {
        self.get_raw(key)?.ok_or(StorageError::NotFound)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        Ok(self.put_raw(key, value)?)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        Ok(self.delete_raw(key)?)
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        Ok(self.batch_write(ops)?)
    }
}

/// Database errors
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to open database: {0}")]
    OpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),
}

impl From<DatabaseError> for StorageError {
    fn from(e: DatabaseError) -> Self {
        StorageError::Backend(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_database_storage_ops() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path()).unwrap();

        db.put(b"key1", b"value1").unwrap();
        assert_eq!(db.get(b"key1").unwrap(), b"value1".to_vec());
        assert!(db.exists(b"key1").unwrap());
        assert_eq!(db.get(b"key2"), Err(StorageError::NotFound));

        db.delete(b"key1").unwrap();
        assert!(!db.exists(b"key1").unwrap());
    }

    #[test]
    fn test_database_batch() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path()).unwrap();

        let ops = vec![
            WriteOp::Put {
                key: b"key1".to_vec(),
                value: b"value1".to_vec(),
            },
            WriteOp::Put {
                key: b"key2".to_vec(),
                value: b"value2".to_vec(),
            },
        ];

        Storage::write_batch(&db, ops).unwrap();

        assert!(db.exists(b"key1").unwrap());
        assert!(db.exists(b"key2").unwrap());
    }

    #[test]
    fn test_database_reopen_keeps_data() {
        let temp_dir = TempDir::new().unwrap();
        {
            let db = Database::open(temp_dir.path()).unwrap();
            db.put(b"persisted", b"yes").unwrap();
        }
        let db = Database::open(temp_dir.path()).unwrap();
        assert_eq!(db.get(b"persisted").unwrap(), b"yes".to_vec());
    }
}
