pub mod parser;
pub mod relation;
pub mod transform;
pub mod types;

pub use parser::{hash_schema, parse_schema, parse_schema_str};
pub use relation::{DeclaredRelation, Projection, RelationKind, Relationship};
pub use transform::{cache_field_name, SchemaTransformer};
pub use types::*;
