//! Job and run data model

pub mod job;
pub mod run;

pub use job::{
    ColumnMapping, DestinationConfig, DestinationKind, JobDefinition, LoadStrategy, SheetRange,
    SheetSource, SourceConfig, DEFAULT_BATCH_SIZE,
};
pub use run::{RunRecord, RunStage, RunStatus};
