pub mod backup;
pub mod core;
pub mod directory;
pub mod ingest;
pub mod setup;
pub mod storage;
