pub mod schema;
pub mod document;
pub mod hooks;
pub mod system_db;
pub mod store;
pub mod sync;
pub mod validation;
pub mod error;

pub use document::{Document, Patch, Selector};
pub use error::{DenormError, Result};
pub use hooks::{DirectStore, HookRegistry};
pub use schema::{SchemaDefinition, SchemaTransformer};
pub use store::{Batch, Collection, Store};
pub use sync::{CascadeEvent, LogTracer, RecordingTracer, SyncEngine, Tracer};
