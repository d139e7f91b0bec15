//! Persistence for import batches and tracks.

mod models;
mod schema;
mod store;

pub use models::{
    derive_batch_state, transition_permitted, Batch, BatchState, BatchStatusCounts, ImportResult,
    Track, TrackStatus,
};
pub use schema::IMPORT_VERSIONED_SCHEMAS;
pub use store::{ImportStore, SqliteImportStore};
