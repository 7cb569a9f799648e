use async_trait::async_trait;
use credit_ledger::Result;
use parking_lot::Mutex as SyncMutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

/// Catalogue entry shown to the recommendation prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDetails {
    pub url: String,
    pub description: String,
}

/// Nearest-neighbour lookup over video description embeddings.
#[async_trait]
pub trait VideoIndex: Send + Sync {
    /// Ids of the `k` closest videos, ordered by ascending L2 distance.
    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>>;

    async fn details(&self, id: i64) -> Result<Option<VideoDetails>>;

    async fn insert(&self, url: &str, description: &str, embedding: &[f32]) -> Result<i64>;

    async fn count(&self) -> Result<usize>;
}

/// Video catalogue stored next to the ledger tables.
#[derive(Clone)]
pub struct SqliteVideoIndex {
    conn: Arc<SyncMutex<Connection>>,
}

impl SqliteVideoIndex {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    credit_ledger::Error::StoreUnavailable(format!(
                        "failed to create database dir {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS videos (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                url         TEXT NOT NULL,
                description TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS video_embeddings (
                id        INTEGER PRIMARY KEY REFERENCES videos(id),
                embedding BLOB NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Arc::new(SyncMutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let value = tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await??;
        Ok(value)
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Euclidean distance; vectors of different length never match.
fn l2_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let sum: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    Some(sum.sqrt())
}

#[async_trait]
impl VideoIndex for SqliteVideoIndex {
    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>> {
        let query = query.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT id, embedding FROM video_embeddings")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;

            let mut scored = Vec::new();
            for row in rows {
                let (id, blob) = row?;
                if let Some(distance) = l2_distance(&query, &decode_embedding(&blob)) {
                    scored.push((id, distance));
                }
            }
            scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            scored.truncate(k);
            Ok(scored)
        })
        .await
    }

    async fn details(&self, id: i64) -> Result<Option<VideoDetails>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT url, description FROM videos WHERE id = ?1",
                params![id],
                |row| {
                    Ok(VideoDetails {
                        url: row.get(0)?,
                        description: row.get(1)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn insert(&self, url: &str, description: &str, embedding: &[f32]) -> Result<i64> {
        let url = url.to_string();
        let description = description.to_string();
        let blob = encode_embedding(embedding);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO videos (url, description) VALUES (?1, ?2)",
                params![url, description],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO video_embeddings (id, embedding) VALUES (?1, ?2)",
                params![id, blob],
            )?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM videos", [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_blob_is_little_endian_f32() {
        let blob = encode_embedding(&[1.0, -2.5]);
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob[..4], &1.0f32.to_le_bytes());
        assert_eq!(decode_embedding(&blob), vec![1.0, -2.5]);
    }

    #[tokio::test]
    async fn nearest_orders_by_distance() {
        let index = SqliteVideoIndex::open_in_memory().unwrap();
        let far = index.insert("https://y/far", "Integrales", &[10.0, 0.0]).await.unwrap();
        let near = index.insert("https://y/near", "Logaritmos", &[1.0, 0.0]).await.unwrap();
        let mid = index.insert("https://y/mid", "Derivadas", &[3.0, 0.0]).await.unwrap();

        let hits = index.nearest(&[0.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![near, mid]);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);

        let all = index.nearest(&[0.0, 0.0], 10).await.unwrap();
        assert_eq!(all.last().unwrap().0, far);
    }

    #[tokio::test]
    async fn mismatched_dimensions_are_skipped() {
        let index = SqliteVideoIndex::open_in_memory().unwrap();
        index.insert("https://y/a", "a", &[1.0, 2.0, 3.0]).await.unwrap();
        assert!(index.nearest(&[1.0, 2.0], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn details_round_trip_and_missing_id() {
        let index = SqliteVideoIndex::open_in_memory().unwrap();
        let id = index
            .insert("https://youtu.be/x", "ECUACIÓN LOGARITMICA", &[0.0])
            .await
            .unwrap();

        let details = index.details(id).await.unwrap().unwrap();
        assert_eq!(details.url, "https://youtu.be/x");
        assert_eq!(details.description, "ECUACIÓN LOGARITMICA");
        assert!(index.details(id + 100).await.unwrap().is_none());
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn open_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh").join("mathtop.db");

        let index = SqliteVideoIndex::open(&path).unwrap();
        index.insert("https://y/a", "a", &[1.0]).await.unwrap();
        assert!(path.exists());
        assert_eq!(index.count().await.unwrap(), 1);
    }
}
