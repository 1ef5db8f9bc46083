//! The synchronization engine: keeps reference fields, caches and
//! back-references consistent as documents are inserted, updated and removed.
//!
//! Every reaction works through the [`DirectStore`] handed to the hooks, so
//! the writes it makes never trigger further reactions.

mod cascade;
mod delete;
pub mod descriptor;
mod reactions;
pub mod tracer;

pub use descriptor::{FieldPair, RelationDescriptor};
pub use tracer::{CascadeEvent, LogTracer, RecordingTracer, Tracer, Trigger};

use crate::document::Document;
use crate::error::Result;
use crate::hooks::{DirectStore, HookRegistry};
use crate::schema::DeclaredRelation;
use cascade::Cascade;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct SyncEngine {
    descriptors: Vec<RelationDescriptor>,
    tracer: Arc<dyn Tracer>,
}

impl SyncEngine {
    pub fn new(relations: &[DeclaredRelation], tracer: Arc<dyn Tracer>) -> Self {
        SyncEngine {
            descriptors: RelationDescriptor::build_all(relations),
            tracer,
        }
    }

    pub fn descriptors(&self) -> &[RelationDescriptor] {
        &self.descriptors
    }

    fn cascade<'a>(&'a self, store: &'a dyn DirectStore) -> Cascade<'a> {
        Cascade::new(store, self.tracer.as_ref())
    }

    /// Subscribe the reactions for every relationship to the hook registry.
    pub fn register(self: &Arc<Self>, hooks: &mut HookRegistry) {
        for (index, d) in self.descriptors.iter().enumerate() {
            let engine = Arc::clone(self);
            hooks.on_after_insert(&d.collection, move |store, doc| {
                engine.after_insert(store, index, doc)
            });

            let engine = Arc::clone(self);
            hooks.on_after_update(&d.collection, move |store, doc, changed, previous| {
                engine.after_update(store, index, doc, changed, previous)
            });

            if !d.reciprocal {
                let engine = Arc::clone(self);
                hooks.on_after_update(&d.related_collection, move |store, doc, changed, _| {
                    engine.refresh_one_way(store, index, doc, changed)
                });
            }
        }

        let collections: BTreeSet<&str> = self
            .descriptors
            .iter()
            .flat_map(|d| [d.collection.as_str(), d.related_collection.as_str()])
            .collect();
        for collection in collections {
            let engine = Arc::clone(self);
            let name = collection.to_string();
            hooks.on_before_remove(collection, move |store, doc| {
                engine.before_remove(store, &name, doc)
            });
        }

        log::debug!(
            "registered reactions for {} relationship(s)",
            self.descriptors.len()
        );
    }

    fn after_insert(&self, store: &dyn DirectStore, index: usize, doc: &Document) -> Result<()> {
        reactions::after_insert(&self.cascade(store), &self.descriptors[index], doc)
    }

    fn after_update(
        &self,
        store: &dyn DirectStore,
        index: usize,
        doc: &Document,
        changed: &[String],
        previous: &Document,
    ) -> Result<()> {
        reactions::after_update(&self.cascade(store), &self.descriptors[index], doc, changed, previous)
    }

    fn refresh_one_way(
        &self,
        store: &dyn DirectStore,
        index: usize,
        related: &Document,
        changed: &[String],
    ) -> Result<()> {
        reactions::refresh_one_way(&self.cascade(store), &self.descriptors[index], related, changed)
    }

    fn before_remove(&self, store: &dyn DirectStore, collection: &str, doc: &Document) -> Result<()> {
        let mut visited = delete::Visited::new();
        delete::handle_remove(&self.cascade(store), &self.descriptors, collection, doc, &mut visited)
    }

    /// Rebuild every cache declared on `collection` for the given documents.
    pub fn resync(&self, store: &dyn DirectStore, collection: &str, ids: &[String]) -> Result<usize> {
        let cascade = self.cascade(store);
        let mut refreshed = 0;
        for id in ids {
            for d in self.descriptors.iter().filter(|d| d.collection == collection) {
                reactions::resync(&cascade, d, id)?;
            }
            refreshed += 1;
        }
        Ok(refreshed)
    }
}
