use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::warn;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_PREFIX_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }

        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.chars().any(|c| c.is_control()) {
            return Err(KvError::InvalidKey {
                key: key.escape_default().to_string(),
                reason: "key contains invalid control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Cache,
    UserData,
    Settings,
    Custom(String),
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Cache => "cache",
            KeyNamespace::UserData => "userdata",
            KeyNamespace::Settings => "settings",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, KvError> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LENGTH {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: format!("custom namespace must be 1..={MAX_PREFIX_LENGTH} bytes"),
            });
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "custom namespace contains invalid characters".to_string(),
            });
        }
        Ok(KeyNamespace::Custom(prefix))
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Storage { retryable: true, .. })
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    ConnectionFailed,
    Corrupted,
    DiskFull,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorCode::ConnectionFailed | StorageErrorCode::Busy | StorageErrorCode::Locked
        )
    }
}

/// Persistent string store supplied by the host platform.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &KvKey, value: String) -> Result<(), KvError>;
    async fn delete(&self, key: &KvKey) -> Result<bool, KvError>;
}

fn check_value_size(value: &str) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// Reads a JSON value, treating missing or corrupt content as the default.
///
/// Corruption is logged, never propagated. Backend failures still are.
pub async fn load_json_or_default<T, S>(store: &S, key: &KvKey) -> Result<T, KvError>
where
    T: DeserializeOwned + Default,
    S: KeyValueStore + ?Sized,
{
    let Some(raw) = store.get(key).await? else {
        return Ok(T::default());
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!(key = %key.raw(), error = %e, "corrupt stored value, resetting to default");
            Ok(T::default())
        }
    }
}

pub async fn store_json<T, S>(store: &S, key: &KvKey, value: &T) -> Result<(), KvError>
where
    T: Serialize + ?Sized,
    S: KeyValueStore + ?Sized,
{
    let data = serde_json::to_string(value).map_err(|e| KvError::Serialization {
        message: e.to_string(),
        key: Some(key.raw()),
    })?;
    store.set(key, data).await
}

#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, KvError> {
        self.entries
            .lock()
            .map_err(|_| KvError::storage(StorageErrorCode::Locked, "in-memory store poisoned"))
    }

    /// Writes a raw value without any checks. Useful for seeding corrupt data.
    pub fn insert_raw(&self, key: &KvKey, value: impl Into<String>) -> Result<(), KvError> {
        self.lock()?.insert(key.raw(), value.into());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<String>, KvError> {
        Ok(self.lock()?.get(&key.raw()).cloned())
    }

    async fn set(&self, key: &KvKey, value: String) -> Result<(), KvError> {
        check_value_size(&value)?;
        self.lock()?.insert(key.raw(), value);
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        Ok(self.lock()?.remove(&key.raw()).is_some())
    }
}

/// SQLite-backed store for device builds.
#[cfg(not(target_arch = "wasm32"))]
pub struct SqliteKvStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

#[cfg(not(target_arch = "wasm32"))]
impl SqliteKvStore {
    pub fn open(path: &std::path::Path) -> Result<Self, KvError> {
        let conn = rusqlite::Connection::open(path).map_err(sqlite_error)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, KvError> {
        let conn = rusqlite::Connection::open_in_memory().map_err(sqlite_error)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self, KvError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(sqlite_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, op: F) -> Result<T, KvError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| KvError::storage(StorageErrorCode::Locked, "connection poisoned"))?;
            op(&guard).map_err(sqlite_error)
        })
        .await
        .map_err(|e| KvError::storage(StorageErrorCode::Unknown, e.to_string()))?
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn sqlite_error(e: rusqlite::Error) -> KvError {
    let code = match &e {
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            rusqlite::ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
            rusqlite::ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
            rusqlite::ErrorCode::DiskFull => StorageErrorCode::DiskFull,
            rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                StorageErrorCode::Corrupted
            }
            rusqlite::ErrorCode::CannotOpen => StorageErrorCode::ConnectionFailed,
            _ => StorageErrorCode::IoError,
        },
        _ => StorageErrorCode::Unknown,
    };
    KvError::storage(code, e.to_string())
}

#[cfg(not(target_arch = "wasm32"))]
#[async_trait::async_trait]
impl KeyValueStore for SqliteKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<String>, KvError> {
        use rusqlite::OptionalExtension;

        let raw = key.raw();
        self.run(move |conn| {
            conn.query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                rusqlite::params![raw],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .await
    }

    async fn set(&self, key: &KvKey, value: String) -> Result<(), KvError> {
        check_value_size(&value)?;
        let raw = key.raw();
        let now = i64::try_from(crate::model::UnixTimeMs::now().0).unwrap_or(i64::MAX);
        self.run(move |conn| {
            conn.execute(
                r#"
                INSERT INTO kv_entries (key, value, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                "#,
                rusqlite::params![raw, value, now],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        let raw = key.raw();
        self.run(move |conn| {
            conn.execute("DELETE FROM kv_entries WHERE key = ?1", rusqlite::params![raw])
                .map(|n| n > 0)
        })
        .await
    }
}
