//! Write-side services: body deserialization and relation mutation.

mod deserialize;
pub mod relations;

pub use deserialize::{DefaultDeserializer, Deserializer};
pub use relations::{apply_relations, get_or_create};
