//! Glucose ingestion: sources, drain-once buffering, and the periodic
//! merge/dedup/store pipeline.

pub mod pipeline;
pub mod sources;

pub use pipeline::GlucoseIngestionPipeline;
pub use sources::{
    GlucoseSlot, NullRemoteService, RemoteGlucoseService, SharedStorageReader,
};
