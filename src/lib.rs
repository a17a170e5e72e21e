//! Bulk grade ingestion: CSV exports in, canonical grade records out, stored
//! under a capacity-limited store that degrades instead of losing data.

pub mod backup;
pub mod batch;
pub mod config;
pub mod csv;
pub mod dates;
pub mod db;
pub mod decode;
pub mod directory;
pub mod error;
pub mod ipc;
pub mod normalize;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod resolve;
pub mod storage;

pub use error::{BackendError, IngestError, StoreError};
pub use pipeline::Pipeline;
