//! Lifecycle hooks and the direct store handed to them.
//!
//! Hooks only ever see a [`DirectStore`], whose writes never fire hooks, so
//! a reaction can not retrigger itself.

use crate::document::{Document, Patch, Selector};
use crate::error::Result;
use std::collections::HashMap;

/// Hook-free access to the stored documents.
pub trait DirectStore {
    fn find_one(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Apply `$set` / `$unset` without validation, hooks or timestamp changes.
    /// Returns the number of affected documents.
    fn update_direct(&self, collection: &str, id: &str, patch: &Patch) -> Result<usize>;

    fn count(&self, collection: &str, selector: &Selector) -> Result<usize>;

    fn find_ids(&self, collection: &str, selector: &Selector) -> Result<Vec<String>>;

    fn remove_direct(&self, collection: &str, id: &str) -> Result<usize>;
}

pub type AfterInsertHook = Box<dyn Fn(&dyn DirectStore, &Document) -> Result<()>>;

/// Called with the stored document, the names of the changed fields, and the
/// document as it was before the update.
pub type AfterUpdateHook = Box<dyn Fn(&dyn DirectStore, &Document, &[String], &Document) -> Result<()>>;

pub type BeforeRemoveHook = Box<dyn Fn(&dyn DirectStore, &Document) -> Result<()>>;

/// Per-collection hook subscriptions, run in registration order.
#[derive(Default)]
pub struct HookRegistry {
    after_insert: HashMap<String, Vec<AfterInsertHook>>,
    after_update: HashMap<String, Vec<AfterUpdateHook>>,
    before_remove: HashMap<String, Vec<BeforeRemoveHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_after_insert<F>(&mut self, collection: &str, hook: F)
    where
        F: Fn(&dyn DirectStore, &Document) -> Result<()> + 'static,
    {
        self.after_insert
            .entry(collection.to_string())
            .or_default()
            .push(Box::new(hook));
    }

    pub fn on_after_update<F>(&mut self, collection: &str, hook: F)
    where
        F: Fn(&dyn DirectStore, &Document, &[String], &Document) -> Result<()> + 'static,
    {
        self.after_update
            .entry(collection.to_string())
            .or_default()
            .push(Box::new(hook));
    }

    /// Runs before the document's row is removed; an error aborts the delete.
    pub fn on_before_remove<F>(&mut self, collection: &str, hook: F)
    where
        F: Fn(&dyn DirectStore, &Document) -> Result<()> + 'static,
    {
        self.before_remove
            .entry(collection.to_string())
            .or_default()
            .push(Box::new(hook));
    }

    pub(crate) fn run_after_insert(
        &self,
        store: &dyn DirectStore,
        collection: &str,
        doc: &Document,
    ) -> Result<()> {
        for hook in self.after_insert.get(collection).into_iter().flatten() {
            hook(store, doc)?;
        }
        Ok(())
    }

    pub(crate) fn run_after_update(
        &self,
        store: &dyn DirectStore,
        collection: &str,
        doc: &Document,
        changed: &[String],
        previous: &Document,
    ) -> Result<()> {
        for hook in self.after_update.get(collection).into_iter().flatten() {
            hook(store, doc, changed, previous)?;
        }
        Ok(())
    }

    pub(crate) fn run_before_remove(
        &self,
        store: &dyn DirectStore,
        collection: &str,
        doc: &Document,
    ) -> Result<()> {
        for hook in self.before_remove.get(collection).into_iter().flatten() {
            hook(store, doc)?;
        }
        Ok(())
    }

    /// Total number of registered hooks for a collection.
    pub fn hook_count(&self, collection: &str) -> usize {
        self.after_insert.get(collection).map_or(0, Vec::len)
            + self.after_update.get(collection).map_or(0, Vec::len)
            + self.before_remove.get(collection).map_or(0, Vec::len)
    }
}
