//! Pure, deterministic logic: data model, parsing, backoff and naming.

pub mod log_entry;
pub mod path;
pub mod retry;
pub mod structured;
pub mod summary;
pub mod types;
