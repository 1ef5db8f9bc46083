use crate::document::{changed_fields, Document, Patch, Selector, ID_FIELD};
use crate::error::{DenormError, Result};
use crate::hooks::{DirectStore, HookRegistry};
use crate::schema::{
    hash_schema, parse_schema_str, AutoIdStrategy, CollectionDefinition, SchemaDefinition,
    SchemaTransformer,
};
use crate::sync::{LogTracer, RelationDescriptor, SyncEngine, Tracer};
use crate::system_db::SystemDb;
use crate::validation;
use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The main entry point.
/// Parses and expands the schema, owns the system database, and wires the
/// synchronization engine into the hooks fired by [`Collection`] writes.
pub struct Store {
    root: Option<PathBuf>,
    schema: SchemaDefinition,
    db: SystemDb,
    hooks: HookRegistry,
    engine: Arc<SyncEngine>,
}

impl Store {
    /// Open a store in a data directory holding `schema.yaml`.
    /// Documents are persisted to `_system.db` in the same directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, Arc::new(LogTracer))
    }

    /// Like [`Store::open`], with a custom cascade tracer.
    pub fn open_with(path: impl AsRef<Path>, tracer: Arc<dyn Tracer>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        if !root.exists() {
            return Err(DenormError::Other(format!(
                "Data directory does not exist: {}",
                root.display()
            )));
        }

        let schema_path = root.join("schema.yaml");
        if !schema_path.exists() {
            return Err(DenormError::Schema(format!(
                "schema.yaml not found in {}",
                root.display()
            )));
        }

        let schema_yaml = std::fs::read_to_string(&schema_path)?;
        let schema = parse_schema_str(&schema_yaml)?;
        let db = SystemDb::open(&root.join("_system.db"))?;

        let current_hash = hash_schema(&schema_yaml);
        if db.get_last_schema_hash()?.as_deref() != Some(current_hash.as_str()) {
            log::info!("schema changed, recording version {current_hash}");
            db.record_schema(&current_hash, &schema_yaml)?;
        }

        Self::build(Some(root), schema, db, tracer)
    }

    /// Open a store backed by an in-memory database.
    pub fn open_in_memory(schema: SchemaDefinition) -> Result<Self> {
        Self::open_in_memory_with(schema, Arc::new(LogTracer))
    }

    pub fn open_in_memory_with(schema: SchemaDefinition, tracer: Arc<dyn Tracer>) -> Result<Self> {
        Self::build(None, schema, SystemDb::open_in_memory()?, tracer)
    }

    /// Parse a schema from YAML and open it in memory.
    pub fn from_schema_str(yaml: &str) -> Result<Self> {
        Self::open_in_memory(parse_schema_str(yaml)?)
    }

    fn build(
        root: Option<PathBuf>,
        mut schema: SchemaDefinition,
        db: SystemDb,
        tracer: Arc<dyn Tracer>,
    ) -> Result<Self> {
        let relations = SchemaTransformer::from_settings(&schema.settings).expand(&mut schema)?;

        let engine = Arc::new(SyncEngine::new(&relations, tracer));
        let mut hooks = HookRegistry::new();
        engine.register(&mut hooks);

        Ok(Store {
            root,
            schema,
            db,
            hooks,
            engine,
        })
    }

    /// Get a handle to a collection
    pub fn collection(&self, name: &str) -> Result<Collection<'_>> {
        if !self.schema.collections.contains_key(name) {
            return Err(DenormError::Other(format!(
                "Collection '{name}' not found in schema"
            )));
        }
        Ok(Collection {
            store: self,
            name: name.to_string(),
        })
    }

    /// The expanded schema, generated cache fields included.
    pub fn schema(&self) -> &SchemaDefinition {
        &self.schema
    }

    /// The data directory, `None` for in-memory stores.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn relationships(&self) -> &[RelationDescriptor] {
        self.engine.descriptors()
    }

    /// Register additional hooks next to the engine's own reactions.
    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    /// Direct, hook-free access to the stored documents.
    pub fn direct(&self) -> &dyn DirectStore {
        &self.db
    }

    /// Create a batch for all-or-nothing execution of multiple write operations.
    pub fn batch(&self) -> Batch<'_> {
        Batch {
            store: self,
            ops: Vec::new(),
        }
    }

    /// Rebuild every cache declared on `collection` from the current
    /// reference values. Returns the number of documents refreshed.
    pub fn resync(&self, collection: &str) -> Result<usize> {
        self.collection(collection)?;
        let ids: Vec<String> = self
            .db
            .list_documents(collection)?
            .into_iter()
            .map(|doc| doc.id)
            .collect();
        let refreshed = self.write(|| self.engine.resync(&self.db, collection, &ids))?;
        log::info!("resynced {refreshed} document(s) in '{collection}'");
        Ok(refreshed)
    }

    /// Run a write and its cascade, inside a savepoint when cascades are transactional.
    fn write<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.schema.settings.transactional_cascades {
            self.db.with_savepoint(f)
        } else {
            f()
        }
    }
}

// ── Batch Operations ───────────────────────────────────────────

/// A deferred write operation for batch execution.
enum BatchOp {
    Insert {
        collection: String,
        data: Value,
    },
    Update {
        collection: String,
        id: String,
        patch: Patch,
    },
    Delete {
        collection: String,
        id: String,
    },
}

/// A batch of write operations that execute all-or-nothing.
pub struct Batch<'a> {
    store: &'a Store,
    ops: Vec<BatchOp>,
}

/// A scoped handle for queuing batch writes to a specific collection.
pub struct BatchCollection<'a, 'b> {
    batch: &'b mut Batch<'a>,
    collection: String,
}

impl<'a> Batch<'a> {
    /// Get a handle for queuing operations on a collection.
    pub fn collection(&mut self, name: &str) -> BatchCollection<'a, '_> {
        BatchCollection {
            batch: self,
            collection: name.to_string(),
        }
    }

    /// Execute all queued operations, cascades included, in one savepoint.
    /// Returns the id of every written document in order.
    pub fn execute(self) -> Result<Vec<String>> {
        let store = self.store;
        store.db.with_savepoint(|| {
            let mut results = Vec::with_capacity(self.ops.len());
            for op in &self.ops {
                match op {
                    BatchOp::Insert { collection, data } => {
                        results.push(store.collection(collection)?.insert(data.clone())?);
                    }
                    BatchOp::Update { collection, id, patch } => {
                        store.collection(collection)?.update(id, patch)?;
                        results.push(id.clone());
                    }
                    BatchOp::Delete { collection, id } => {
                        store.collection(collection)?.delete(id)?;
                        results.push(id.clone());
                    }
                }
            }
            Ok(results)
        })
    }
}

impl<'a, 'b> BatchCollection<'a, 'b> {
    /// Queue an insert operation.
    pub fn insert(&mut self, data: Value) -> &mut Self {
        self.batch.ops.push(BatchOp::Insert {
            collection: self.collection.clone(),
            data,
        });
        self
    }

    /// Queue an update operation.
    pub fn update(&mut self, id: &str, patch: Patch) -> &mut Self {
        self.batch.ops.push(BatchOp::Update {
            collection: self.collection.clone(),
            id: id.to_string(),
            patch,
        });
        self
    }

    /// Queue a delete operation.
    pub fn delete(&mut self, id: &str) -> &mut Self {
        self.batch.ops.push(BatchOp::Delete {
            collection: self.collection.clone(),
            id: id.to_string(),
        });
        self
    }
}

/// A handle to a collection within a store.
/// Writes through this handle are validated, timestamped and fire hooks.
pub struct Collection<'a> {
    store: &'a Store,
    name: String,
}

impl<'a> Collection<'a> {
    fn definition(&self) -> &CollectionDefinition {
        &self.store.schema.collections[&self.name]
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.definition().readonly {
            return Err(DenormError::Other(format!(
                "Collection '{}' is readonly",
                self.name
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn find_one(&self, id: &str) -> Result<Option<Document>> {
        self.store.db.get_document(&self.name, id)
    }

    /// Get a document by ID
    pub fn get(&self, id: &str) -> Result<Document> {
        self.find_one(id)?.ok_or_else(|| DenormError::NotFound {
            collection: self.name.clone(),
            id: id.to_string(),
        })
    }

    /// List all documents in this collection, ordered by id.
    pub fn list(&self) -> Result<Vec<Document>> {
        self.store.db.list_documents(&self.name)
    }

    pub fn count(&self, selector: &Selector) -> Result<usize> {
        self.store.db.count(&self.name, selector)
    }

    /// Insert a new document from a JSON object. Returns the document ID.
    ///
    /// An `_id` member is used as the id; otherwise one is generated with
    /// the collection's id strategy.
    pub fn insert(&self, data: Value) -> Result<String> {
        self.ensure_writable()?;

        let Value::Object(mut fields) = data else {
            return Err(DenormError::Validation(
                "Document data must be a JSON object".into(),
            ));
        };

        let explicit_id = match fields.remove(ID_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) if !id.is_empty() => Some(id),
            Some(other) => {
                return Err(DenormError::Validation(format!(
                    "'{ID_FIELD}' must be a non-empty string, got {other}"
                )))
            }
        };

        let warnings = validation::validate_and_prepare(self.definition(), &mut fields)?;
        for warning in warnings {
            log::warn!("{}: {warning}", self.name);
        }

        let id = explicit_id.unwrap_or_else(|| self.generate_id());
        let now = Utc::now();
        let doc = Document {
            id: id.clone(),
            created_at: now,
            modified_at: now,
            data: fields,
        };

        let db = &self.store.db;
        self.store.write(|| {
            db.insert_document(&self.name, &doc)?;
            self.store.hooks.run_after_insert(db, &self.name, &doc)
        })?;
        Ok(id)
    }

    /// Apply a patch. Hooks only fire when a field actually changed.
    pub fn update(&self, id: &str, patch: &Patch) -> Result<()> {
        self.ensure_writable()?;
        let previous = self.get(id)?;
        if patch.is_empty() {
            return Ok(());
        }

        let mut data = previous.data.clone();
        patch.apply(&mut data);
        let warnings = validation::validate_and_prepare(self.definition(), &mut data)?;
        for warning in warnings {
            log::warn!("{}/{id}: {warning}", self.name);
        }

        let changed = changed_fields(&previous.data, &data);
        if changed.is_empty() {
            return Ok(());
        }

        let doc = Document {
            id: id.to_string(),
            created_at: previous.created_at,
            modified_at: Utc::now(),
            data,
        };

        let db = &self.store.db;
        self.store.write(|| {
            db.upsert_document(&self.name, &doc)?;
            self.store
                .hooks
                .run_after_update(db, &self.name, &doc, &changed, &previous)
        })
    }

    /// Update from a JSON object; `null` members unset their field.
    pub fn update_fields(&self, id: &str, fields: Value) -> Result<()> {
        self.update(id, &Patch::from_object(fields)?)
    }

    /// Delete a document by ID, applying the delete policies of every
    /// relationship pointing at it.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.ensure_writable()?;
        let doc = self.get(id)?;

        let db = &self.store.db;
        self.store.write(|| {
            self.store.hooks.run_before_remove(db, &self.name, &doc)?;
            db.delete_document(&self.name, id)?;
            Ok(())
        })
    }

    fn generate_id(&self) -> String {
        match self.definition().auto_id() {
            AutoIdStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
            AutoIdStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
            AutoIdStrategy::Nanoid => nanoid::nanoid!(),
        }
    }
}
