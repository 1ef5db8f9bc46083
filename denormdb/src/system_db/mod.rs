use crate::document::{Document, Fields, Patch, Selector};
use crate::error::{DenormError, Result};
use crate::hooks::DirectStore;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::cell::Cell;
use std::path::Path;

/// The system database holding documents and schema history.
pub struct SystemDb {
    conn: Connection,
    savepoint_depth: Cell<usize>,
}

impl SystemDb {
    /// Open or create the system database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory system database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = SystemDb {
            conn,
            savepoint_depth: Cell::new(0),
        };
        db.initialize_tables()?;
        Ok(db)
    }

    fn initialize_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT NOT NULL,
                schema_yaml TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );

            CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);
            ",
        )?;
        Ok(())
    }

    // ── Schema State ─────────────────────────────────────────────────

    /// Get the most recent schema hash.
    pub fn get_last_schema_hash(&self) -> Result<Option<String>> {
        let result = self
            .conn
            .query_row(
                "SELECT hash FROM schema_history ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    /// Record a new schema version.
    pub fn record_schema(&self, hash: &str, yaml: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO schema_history (hash, schema_yaml) VALUES (?1, ?2)",
            params![hash, yaml],
        )?;
        Ok(())
    }

    // ── Documents ────────────────────────────────────────────────────

    /// Insert a new document. Fails if the id is already taken.
    pub fn insert_document(&self, collection: &str, doc: &Document) -> Result<()> {
        if self.get_document(collection, &doc.id)?.is_some() {
            return Err(DenormError::Validation(format!(
                "Document '{}' already exists in collection '{collection}'",
                doc.id
            )));
        }
        self.upsert_document(collection, doc)
    }

    /// Insert or replace a document, timestamps included.
    pub fn upsert_document(&self, collection: &str, doc: &Document) -> Result<()> {
        let data_json = serde_json::to_string(&doc.data)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO documents (collection, id, data_json, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                collection,
                doc.id,
                data_json,
                doc.created_at.to_rfc3339(),
                doc.modified_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Get a document by collection and id.
    pub fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, data_json, created_at, modified_at FROM documents
                 WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                DocumentRecord::from_row,
            )
            .optional()?;
        record.map(DocumentRecord::into_document).transpose()
    }

    /// List all documents in a collection, ordered by id.
    pub fn list_documents(&self, collection: &str) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, data_json, created_at, modified_at FROM documents
             WHERE collection = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![collection], DocumentRecord::from_row)?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row?.into_document()?);
        }
        Ok(docs)
    }

    /// Delete a document. Returns the number of removed rows.
    pub fn delete_document(&self, collection: &str, id: &str) -> Result<usize> {
        let affected = self.conn.execute(
            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        Ok(affected)
    }

    fn write_data(&self, collection: &str, id: &str, data: &Fields) -> Result<usize> {
        let data_json = serde_json::to_string(data)?;
        let affected = self.conn.execute(
            "UPDATE documents SET data_json = ?3 WHERE collection = ?1 AND id = ?2",
            params![collection, id, data_json],
        )?;
        Ok(affected)
    }

    // ── Savepoints ───────────────────────────────────────────────────

    /// Run `f` inside a savepoint: released on success, rolled back on error.
    /// Savepoints nest.
    pub fn with_savepoint<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let name = self.begin_savepoint()?;
        match f() {
            Ok(value) => {
                self.release_savepoint(&name)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback_savepoint(&name) {
                    log::warn!("failed to roll back savepoint {name}: {rollback_err}");
                }
                Err(e)
            }
        }
    }

    fn begin_savepoint(&self) -> Result<String> {
        let depth = self.savepoint_depth.get() + 1;
        let name = format!("denormdb_sp{depth}");
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        self.savepoint_depth.set(depth);
        Ok(name)
    }

    fn release_savepoint(&self, name: &str) -> Result<()> {
        self.savepoint_depth.set(self.savepoint_depth.get().saturating_sub(1));
        self.conn.execute_batch(&format!("RELEASE SAVEPOINT {name}"))?;
        Ok(())
    }

    fn rollback_savepoint(&self, name: &str) -> Result<()> {
        self.savepoint_depth.set(self.savepoint_depth.get().saturating_sub(1));
        self.conn
            .execute_batch(&format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}"))?;
        Ok(())
    }
}

/// Direct writes: no validation, no hooks, and timestamps stay as they are.
impl DirectStore for SystemDb {
    fn find_one(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.get_document(collection, id)
    }

    fn update_direct(&self, collection: &str, id: &str, patch: &Patch) -> Result<usize> {
        let Some(mut doc) = self.get_document(collection, id)? else {
            return Ok(0);
        };
        patch.apply(&mut doc.data);
        self.write_data(collection, id, &doc.data)
    }

    fn count(&self, collection: &str, selector: &Selector) -> Result<usize> {
        Ok(self
            .list_documents(collection)?
            .iter()
            .filter(|doc| selector.matches(doc))
            .count())
    }

    fn find_ids(&self, collection: &str, selector: &Selector) -> Result<Vec<String>> {
        Ok(self
            .list_documents(collection)?
            .into_iter()
            .filter(|doc| selector.matches(doc))
            .map(|doc| doc.id)
            .collect())
    }

    fn remove_direct(&self, collection: &str, id: &str) -> Result<usize> {
        self.delete_document(collection, id)
    }
}

/// A raw row from the documents table
struct DocumentRecord {
    id: String,
    data_json: String,
    created_at: String,
    modified_at: String,
}

impl DocumentRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(DocumentRecord {
            id: row.get(0)?,
            data_json: row.get(1)?,
            created_at: row.get(2)?,
            modified_at: row.get(3)?,
        })
    }

    fn into_document(self) -> Result<Document> {
        let data: Fields = serde_json::from_str(&self.data_json)?;
        Ok(Document {
            created_at: parse_timestamp(&self.created_at)?,
            modified_at: parse_timestamp(&self.modified_at)?,
            id: self.id,
            data,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DenormError::Other(format!("invalid stored timestamp '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc(id: &str, value: serde_json::Value) -> Document {
        let now = Utc::now();
        Document {
            id: id.into(),
            created_at: now,
            modified_at: now,
            data: value.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn test_insert_and_get_document() {
        let db = SystemDb::open_in_memory().unwrap();
        let alice = doc("alice", json!({ "name": "Alice" }));
        db.insert_document("authors", &alice).unwrap();

        let loaded = db.get_document("authors", "alice").unwrap().unwrap();
        assert_eq!(loaded.id, "alice");
        assert_eq!(loaded.data["name"], json!("Alice"));
        assert_eq!(loaded.created_at.timestamp(), alice.created_at.timestamp());
    }

    #[test]
    fn test_insert_duplicate_id_fails() {
        let db = SystemDb::open_in_memory().unwrap();
        db.insert_document("authors", &doc("alice", json!({}))).unwrap();
        assert!(db.insert_document("authors", &doc("alice", json!({}))).is_err());
    }

    #[test]
    fn test_list_and_delete_documents() {
        let db = SystemDb::open_in_memory().unwrap();
        db.insert_document("authors", &doc("bob", json!({}))).unwrap();
        db.insert_document("authors", &doc("alice", json!({}))).unwrap();
        db.insert_document("posts", &doc("p1", json!({}))).unwrap();

        let ids: Vec<String> = db
            .list_documents("authors")
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["alice", "bob"]);

        assert_eq!(db.delete_document("authors", "alice").unwrap(), 1);
        assert_eq!(db.delete_document("authors", "alice").unwrap(), 0);
        assert!(db.get_document("authors", "alice").unwrap().is_none());
    }

    #[test]
    fn test_update_direct_keeps_timestamps() {
        let db = SystemDb::open_in_memory().unwrap();
        let original = doc("p1", json!({ "post": "old", "authorId": "a1" }));
        db.insert_document("posts", &original).unwrap();

        let patch = Patch::new().set("post", json!("new")).unset("authorId");
        assert_eq!(db.update_direct("posts", "p1", &patch).unwrap(), 1);

        let loaded = db.get_document("posts", "p1").unwrap().unwrap();
        assert_eq!(serde_json::Value::Object(loaded.data), json!({ "post": "new" }));
        assert_eq!(loaded.modified_at.timestamp(), original.modified_at.timestamp());
    }

    #[test]
    fn test_update_direct_missing_document_affects_nothing() {
        let db = SystemDb::open_in_memory().unwrap();
        let patch = Patch::new().set("post", json!("x"));
        assert_eq!(db.update_direct("posts", "nope", &patch).unwrap(), 0);
    }

    #[test]
    fn test_count_and_find_ids() {
        let db = SystemDb::open_in_memory().unwrap();
        db.insert_document("comments", &doc("c1", json!({ "postId": "p1" }))).unwrap();
        db.insert_document("comments", &doc("c2", json!({ "postId": "p2" }))).unwrap();
        db.insert_document("comments", &doc("c3", json!({ "postId": "p1" }))).unwrap();

        let selector = Selector::all().eq("postId", json!("p1"));
        assert_eq!(db.count("comments", &selector).unwrap(), 2);
        assert_eq!(db.find_ids("comments", &selector).unwrap(), vec!["c1", "c3"]);
        assert_eq!(db.count("comments", &Selector::all()).unwrap(), 3);
    }

    #[test]
    fn test_schema_history() {
        let db = SystemDb::open_in_memory().unwrap();
        assert!(db.get_last_schema_hash().unwrap().is_none());

        db.record_schema("abc123", "collections: {}").unwrap();
        db.record_schema("def456", "collections: { users: {} }").unwrap();
        assert_eq!(db.get_last_schema_hash().unwrap(), Some("def456".to_string()));
    }

    #[test]
    fn test_savepoint_rollback() {
        let db = SystemDb::open_in_memory().unwrap();
        let result: Result<()> = db.with_savepoint(|| {
            db.insert_document("authors", &doc("alice", json!({})))?;
            Err(DenormError::Other("boom".into()))
        });
        assert!(result.is_err());
        assert!(db.get_document("authors", "alice").unwrap().is_none());
    }

    #[test]
    fn test_nested_savepoints() {
        let db = SystemDb::open_in_memory().unwrap();
        db.with_savepoint(|| {
            db.insert_document("authors", &doc("alice", json!({})))?;
            let inner: Result<()> = db.with_savepoint(|| {
                db.insert_document("authors", &doc("bob", json!({})))?;
                Err(DenormError::Other("inner".into()))
            });
            assert!(inner.is_err());
            Ok(())
        })
        .unwrap();

        assert!(db.get_document("authors", "alice").unwrap().is_some());
        assert!(db.get_document("authors", "bob").unwrap().is_none());
    }
}
