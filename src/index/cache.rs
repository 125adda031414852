//! SQLite cache of raw image embeddings.
//!
//! A cached row is reused only while the file's size and modification time
//! are unchanged and it was produced by the same encoder.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::time::UNIX_EPOCH;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS embeddings (
    path TEXT NOT NULL,
    model_name TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    modified_ms INTEGER NOT NULL,
    embedding BLOB NOT NULL,  -- float32 array stored as bytes
    embedding_dim INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (path, model_name)
);

CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_name);
"#;

/// Identity of a file's contents as far as the cache is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFingerprint {
    pub size_bytes: i64,
    pub modified_ms: i64,
}

impl FileFingerprint {
    pub fn of(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        Ok(Self {
            size_bytes: metadata.len() as i64,
            modified_ms,
        })
    }
}

pub struct EmbeddingCache {
    conn: Connection,
}

impl EmbeddingCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let cache = Self { conn };
        cache.initialize()?;
        Ok(cache)
    }

    pub fn open_in_memory() -> Result<Self> {
        let cache = Self {
            conn: Connection::open_in_memory()?,
        };
        cache.initialize()?;
        Ok(cache)
    }

    fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Cached embedding for `path`, if it is still fresh.
    pub fn get(&self, path: &Path, model_name: &str, fingerprint: FileFingerprint) -> Result<Option<Vec<f32>>> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                r#"
                SELECT embedding FROM embeddings
                WHERE path = ? AND model_name = ? AND size_bytes = ? AND modified_ms = ?
                "#,
                params![
                    path.to_string_lossy(),
                    model_name,
                    fingerprint.size_bytes,
                    fingerprint.modified_ms
                ],
                |row| row.get(0),
            )
            .optional()?;

        Ok(bytes.map(|b| bytes_to_embedding(&b)))
    }

    pub fn store(
        &self,
        path: &Path,
        model_name: &str,
        fingerprint: FileFingerprint,
        embedding: &[f32],
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO embeddings
                (path, model_name, size_bytes, modified_ms, embedding, embedding_dim, created_at)
            VALUES (?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            "#,
            params![
                path.to_string_lossy(),
                model_name,
                fingerprint.size_bytes,
                fingerprint.modified_ms,
                embedding_to_bytes(embedding),
                embedding.len() as i64
            ],
        )?;

        Ok(())
    }

    /// Drop rows for `model_name` under `dir` whose path is not in `keep`.
    /// Rows outside `dir` are left alone. Returns the number removed.
    pub fn prune(&self, model_name: &str, dir: &Path, keep: &HashSet<String>) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM embeddings WHERE model_name = ?")?;
        let stale: Vec<String> = stmt
            .query_map([model_name], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .filter(|path: &String| Path::new(path).starts_with(dir) && !keep.contains(path))
            .collect();

        for path in &stale {
            self.conn.execute(
                "DELETE FROM embeddings WHERE path = ? AND model_name = ?",
                params![path, model_name],
            )?;
        }

        Ok(stale.len())
    }

    /// Number of cached embeddings for `model_name`.
    pub fn count(&self, model_name: &str) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM embeddings WHERE model_name = ?",
            [model_name],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

/// Convert f32 slice to bytes for storage
fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector
fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(size: i64) -> FileFingerprint {
        FileFingerprint {
            size_bytes: size,
            modified_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_store_and_get() {
        let cache = EmbeddingCache::open_in_memory().unwrap();
        let path = Path::new("/photos/suv/1.jpg");
        cache.store(path, "m", fingerprint(10), &[1.5, -2.25, 0.0]).unwrap();

        let hit = cache.get(path, "m", fingerprint(10)).unwrap();
        assert_eq!(hit, Some(vec![1.5, -2.25, 0.0]));
    }

    #[test]
    fn test_changed_file_or_model_misses() {
        let cache = EmbeddingCache::open_in_memory().unwrap();
        let path = Path::new("/photos/suv/1.jpg");
        cache.store(path, "m", fingerprint(10), &[1.0]).unwrap();

        assert!(cache.get(path, "m", fingerprint(11)).unwrap().is_none());
        assert!(cache.get(path, "other", fingerprint(10)).unwrap().is_none());
    }

    #[test]
    fn test_prune_removes_vanished_paths() {
        let cache = EmbeddingCache::open_in_memory().unwrap();
        cache.store(Path::new("/photos/a.jpg"), "m", fingerprint(1), &[1.0]).unwrap();
        cache.store(Path::new("/photos/b.jpg"), "m", fingerprint(1), &[1.0]).unwrap();
        cache.store(Path::new("/photos/b.jpg"), "other", fingerprint(1), &[1.0]).unwrap();

        let keep: HashSet<String> = ["/photos/a.jpg".to_string()].into_iter().collect();
        assert_eq!(cache.prune("m", Path::new("/photos"), &keep).unwrap(), 1);
        assert_eq!(cache.count("m").unwrap(), 1);
        assert_eq!(cache.count("other").unwrap(), 1);
    }

    #[test]
    fn test_prune_leaves_other_directories() {
        let cache = EmbeddingCache::open_in_memory().unwrap();
        cache.store(Path::new("/cars/a.jpg"), "m", fingerprint(1), &[1.0]).unwrap();
        cache.store(Path::new("/cats/b.jpg"), "m", fingerprint(1), &[1.0]).unwrap();
        // Sibling whose name shares a prefix with the indexed directory
        cache.store(Path::new("/cars2/c.jpg"), "m", fingerprint(1), &[1.0]).unwrap();

        let keep: HashSet<String> = HashSet::new();
        assert_eq!(cache.prune("m", Path::new("/cars"), &keep).unwrap(), 1);
        assert_eq!(cache.count("m").unwrap(), 2);
        assert!(cache.get(Path::new("/cats/b.jpg"), "m", fingerprint(1)).unwrap().is_some());
    }

    #[test]
    fn test_embedding_conversion() {
        let original = vec![1.5, -2.3, 0.0, 100.0];
        let bytes = embedding_to_bytes(&original);
        assert_eq!(bytes_to_embedding(&bytes), original);
    }
}
