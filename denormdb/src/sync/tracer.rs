use std::sync::Mutex;

/// What started a reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Insert,
    Update,
    Remove,
    Refresh,
}

/// One observable step of a cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeEvent {
    /// A reaction for `collection.field` started on document `id`.
    Reaction {
        collection: String,
        id: String,
        field: String,
        trigger: Trigger,
    },
    /// A direct (hook-free) write touched these fields.
    DirectWrite {
        collection: String,
        id: String,
        fields: Vec<String>,
    },
    /// Document `id` moved from owner `from` to owner `to`.
    OwnershipTransferred {
        collection: String,
        id: String,
        from: String,
        to: String,
    },
    /// Document removed as part of a delete cascade.
    Removed { collection: String, id: String },
}

/// Receives cascade events. Injected into the sync engine.
pub trait Tracer: Send + Sync {
    fn event(&self, event: &CascadeEvent);
}

/// Forwards events to the `log` facade at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn event(&self, event: &CascadeEvent) {
        match event {
            CascadeEvent::Reaction {
                collection,
                id,
                field,
                trigger,
            } => log::debug!("{trigger:?} reaction for {collection}.{field} on '{id}'"),
            CascadeEvent::DirectWrite {
                collection,
                id,
                fields,
            } => log::debug!("direct write {collection}/{id}: {}", fields.join(", ")),
            CascadeEvent::OwnershipTransferred {
                collection,
                id,
                from,
                to,
            } => log::debug!("{collection}/{id} moved from '{from}' to '{to}'"),
            CascadeEvent::Removed { collection, id } => {
                log::debug!("cascade removed {collection}/{id}")
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Mutex<Vec<CascadeEvent>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CascadeEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// `(collection, id)` of every direct write, in order.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                CascadeEvent::DirectWrite { collection, id, .. } => Some((collection, id)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl Tracer for RecordingTracer {
    fn event(&self, event: &CascadeEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
