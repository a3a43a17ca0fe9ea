//! SQLite knowledge store: labelled text chunks for retrieval.

use crate::Result;
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One indexed piece of a source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Where the text came from (usually a file path).
    pub source: String,
    pub text: String,
}

/// Chunks grouped under knowledge labels.
///
/// The connection sits behind a mutex so a store can be shared by reference
/// from async code.
pub struct KnowledgeStore {
    conn: Mutex<Connection>,
}

impl KnowledgeStore {
    /// Open or create a knowledge store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Create an in-memory knowledge store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                label TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                source TEXT NOT NULL,
                text TEXT NOT NULL,
                PRIMARY KEY (label, ordinal)
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace every chunk stored under `label` with `chunks`.
    pub fn replace(&self, label: &str, chunks: &[Chunk]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chunks WHERE label = ?1", [label])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO chunks (label, ordinal, source, text) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (ordinal, chunk) in chunks.iter().enumerate() {
                insert.execute(params![label, ordinal as i64, chunk.source, chunk.text])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All chunks under `label`, in insertion order.
    pub fn chunks(&self, label: &str) -> Result<Vec<Chunk>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT source, text FROM chunks WHERE label = ?1 ORDER BY ordinal")?;
        let chunks = stmt
            .query_map([label], |row| {
                Ok(Chunk {
                    source: row.get(0)?,
                    text: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }

    /// Remove a label. Returns the number of chunks deleted.
    pub fn delete(&self, label: &str) -> Result<usize> {
        Ok(self
            .conn()
            .execute("DELETE FROM chunks WHERE label = ?1", [label])?)
    }

    /// Every label that has at least one chunk.
    pub fn labels(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT label FROM chunks ORDER BY label")?;
        let labels = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(source: &str, text: &str) -> Chunk {
        Chunk {
            source: source.into(),
            text: text.into(),
        }
    }

    #[test]
    fn replace_overwrites_previous_chunks() {
        let store = KnowledgeStore::in_memory().unwrap();
        store
            .replace("docs", &[chunk("a.md", "one"), chunk("a.md", "two")])
            .unwrap();
        store.replace("docs", &[chunk("b.md", "three")]).unwrap();

        assert_eq!(store.chunks("docs").unwrap(), vec![chunk("b.md", "three")]);
    }

    #[test]
    fn labels_are_independent() {
        let store = KnowledgeStore::in_memory().unwrap();
        store.replace("public", &[chunk("p", "shared")]).unwrap();
        store.replace("private", &[chunk("q", "secret")]).unwrap();

        assert_eq!(store.labels().unwrap(), vec!["private", "public"]);
        assert_eq!(store.delete("private").unwrap(), 1);
        assert_eq!(store.labels().unwrap(), vec!["public"]);
        assert_eq!(store.delete("private").unwrap(), 0);
        assert!(store.chunks("private").unwrap().is_empty());
    }
}
