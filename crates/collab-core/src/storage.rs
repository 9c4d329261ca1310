//! Persistence backend — load and store a document's full state
//! as an opaque update blob, keyed by document name.

use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

/// Durable storage for document state. Implementations need not understand
/// CRDT semantics: a stored blob is whatever [`crate::crdt::Replica::encode_state_as_update`]
/// produced, replayed verbatim through [`crate::crdt::Replica::apply`] on load.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn store(&self, name: &str, update: &[u8]) -> Result<(), StoreError>;
}

/// One file per document, named after it, rooted under a base directory.
/// The simplest backend that satisfies the trait; suitable for local/dev use
/// and as the default when no database is configured.
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.ybin"))
    }
}

#[async_trait]
impl Storage for FilesystemStorage {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::StoreFailed(e.to_string())),
        }
    }

    async fn store(&self, name: &str, update: &[u8]) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::StoreFailed(e.to_string()))?;
        let path = self.path_for(name);
        let tmp = path.with_extension("ybin.tmp");
        tokio::fs::write(&tmp, update)
            .await
            .map_err(|e| StoreError::StoreFailed(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::StoreFailed(e.to_string()))
    }
}

/// SQLite-backed storage: one row per document in a single database file,
/// behind the `sqlite` feature.
#[cfg(feature = "sqlite")]
pub struct SqliteStorage {
    conn: std::sync::Mutex<rusqlite::Connection>,
}

#[cfg(feature = "sqlite")]
impl SqliteStorage {
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let conn =
            rusqlite::Connection::open(path).map_err(|e| StoreError::StoreFailed(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                name TEXT PRIMARY KEY,
                data BLOB NOT NULL
            )",
        )
        .map_err(|e| StoreError::StoreFailed(e.to_string()))?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }
}

#[cfg(feature = "sqlite")]
#[async_trait]
impl Storage for SqliteStorage {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT data FROM documents WHERE name = ?1",
            [name],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StoreError::StoreFailed(other.to_string())),
        })
    }

    async fn store(&self, name: &str, update: &[u8]) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO documents (name, data) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET data = excluded.data",
            rusqlite::params![name, update],
        )
        .map_err(|e| StoreError::StoreFailed(e.to_string()))?;
        Ok(())
    }
}

/// Keyed cache of lazily-opened SQLite databases, one per logical namespace
/// (e.g. a multi-tenant deployment keyed by tenant id), using a
/// check-then-insert locking pattern: a cache miss takes the write lock only
/// long enough to insert the freshly opened connection.
#[cfg(feature = "sqlite")]
pub struct SqliteStorageCache {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, std::sync::Arc<SqliteStorage>>>,
}

#[cfg(feature = "sqlite")]
impl SqliteStorageCache {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, namespace: &str) -> Result<std::sync::Arc<SqliteStorage>, StoreError> {
        if let Some(storage) = self.cache.read().unwrap().get(namespace) {
            return Ok(storage.clone());
        }
        let path = self.base_dir.join(format!("{namespace}.db"));
        let storage = std::sync::Arc::new(SqliteStorage::open(&path)?);
        self.cache
            .write()
            .unwrap()
            .insert(namespace.to_string(), storage.clone());
        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn filesystem_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path());

        assert_eq!(storage.load("room-1").await.unwrap(), None);

        storage.store("room-1", b"hello").await.unwrap();
        assert_eq!(storage.load("room-1").await.unwrap(), Some(b"hello".to_vec()));

        storage.store("room-1", b"world").await.unwrap();
        assert_eq!(storage.load("room-1").await.unwrap(), Some(b"world".to_vec()));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn sqlite_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(&dir.path().join("docs.db")).unwrap();

        assert_eq!(storage.load("room-1").await.unwrap(), None);
        storage.store("room-1", b"hello").await.unwrap();
        assert_eq!(storage.load("room-1").await.unwrap(), Some(b"hello".to_vec()));
        storage.store("room-1", b"world").await.unwrap();
        assert_eq!(storage.load("room-1").await.unwrap(), Some(b"world".to_vec()));
    }
}
