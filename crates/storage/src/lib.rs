pub mod backend;
pub mod error;
mod key;
mod location;
mod models;

pub use crate::backend::ObjectStore;
pub use crate::key::{DEFAULT_EXTENSION, KEY_ROOT, StorageKey, derive_key, digest};
pub use crate::location::PublicLocation;
pub use crate::models::{DEFAULT_CONTENT_TYPE, IMMUTABLE_CACHE_CONTROL, ObjectVersion, StoredObject, WriteCondition};
use std::sync::Arc;

pub type StoreHandle = Arc<dyn ObjectStore + Send + Sync>;
