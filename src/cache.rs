//! Persistent response cache.
//!
//! Completion responses are memoised by request fingerprint in a SQLite
//! database at `{root}/{seed}/cache.db`, so results survive across runs and
//! different seeds are cached in different places. Unrecoverable remote
//! failures are recorded as a poisoned sentinel under the same key space.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::endpoint::ResponseRecord;
use crate::error::Result;

/// Default cache root directory.
pub const DEFAULT_CACHE_ROOT: &str = ".cache";

/// Default cache seed.
pub const DEFAULT_SEED: u64 = 41;

/// A cached call outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheValue {
    /// A successful response.
    Response(ResponseRecord),
    /// The call failed definitively; do not retry while tuning.
    Poisoned,
}

/// Fingerprint-addressed store of completion responses.
///
/// The handle owns the underlying connection; dropping it releases the
/// database on every exit path.
pub struct CallCache {
    db: Connection,
    dir: PathBuf,
}

impl CallCache {
    /// Open or create the cache for `(root, seed)`.
    pub fn open(root: impl AsRef<Path>, seed: u64) -> Result<Self> {
        let dir = root.as_ref().join(seed.to_string());
        fs::create_dir_all(&dir)?;
        let db = Connection::open(dir.join("cache.db"))?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS responses (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self { db, dir })
    }

    /// Look up a cached outcome by fingerprint.
    pub fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        let row = self
            .db
            .query_row("SELECT value FROM responses WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            });
        match row {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store an outcome under a fingerprint, replacing any previous entry.
    pub fn set(&mut self, key: &str, value: &CacheValue) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.db.execute(
            "INSERT OR REPLACE INTO responses (key, value, created_at) VALUES (?1, ?2, ?3)",
            params![key, json, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Directory holding this cache.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl std::fmt::Debug for CallCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCache").field("dir", &self.dir).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Choice, Usage};
    use tempfile::TempDir;

    fn sample_response() -> ResponseRecord {
        ResponseRecord::new(
            vec![Choice::text("foo")],
            Usage { prompt_tokens: 4, completion_tokens: 1 },
        )
    }

    #[test]
    fn test_open_creates_seed_directory() {
        let temp = TempDir::new().unwrap();
        let cache = CallCache::open(temp.path(), 41).unwrap();
        assert_eq!(cache.dir(), temp.path().join("41"));
        assert!(temp.path().join("41/cache.db").exists());
    }

    #[test]
    fn test_get_absent() {
        let temp = TempDir::new().unwrap();
        let cache = CallCache::open(temp.path(), 41).unwrap();
        assert!(cache.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_set_and_get_response() {
        let temp = TempDir::new().unwrap();
        let mut cache = CallCache::open(temp.path(), 41).unwrap();
        let value = CacheValue::Response(sample_response());
        cache.set("abc", &value).unwrap();
        assert_eq!(cache.get("abc").unwrap(), Some(value));
    }

    #[test]
    fn test_set_and_get_poisoned() {
        let temp = TempDir::new().unwrap();
        let mut cache = CallCache::open(temp.path(), 41).unwrap();
        cache.set("bad", &CacheValue::Poisoned).unwrap();
        assert_eq!(cache.get("bad").unwrap(), Some(CacheValue::Poisoned));
    }

    #[test]
    fn test_persists_across_handles() {
        let temp = TempDir::new().unwrap();
        {
            let mut cache = CallCache::open(temp.path(), 41).unwrap();
            cache.set("abc", &CacheValue::Response(sample_response())).unwrap();
        }
        let cache = CallCache::open(temp.path(), 41).unwrap();
        assert!(matches!(
            cache.get("abc").unwrap(),
            Some(CacheValue::Response(_))
        ));
    }

    #[test]
    fn test_seeds_are_isolated() {
        let temp = TempDir::new().unwrap();
        let mut a = CallCache::open(temp.path(), 41).unwrap();
        a.set("abc", &CacheValue::Poisoned).unwrap();

        let b = CallCache::open(temp.path(), 42).unwrap();
        assert!(b.get("abc").unwrap().is_none());
    }

    #[test]
    fn test_replace_overwrites() {
        let temp = TempDir::new().unwrap();
        let mut cache = CallCache::open(temp.path(), 41).unwrap();
        cache.set("abc", &CacheValue::Poisoned).unwrap();
        let value = CacheValue::Response(sample_response());
        cache.set("abc", &value).unwrap();
        assert_eq!(cache.get("abc").unwrap(), Some(value));
    }
}
