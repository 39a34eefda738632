use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod common;
pub mod config;
pub mod embedding;
pub mod error;
pub mod ops;
pub mod source;
pub mod stats;
pub mod store;
pub mod workflow;
pub mod writer;

pub use common::{ColumnRole, MemoryBudget, Partition, Schema};
pub use config::WorkflowConfig;
pub use embedding::{EmbeddingSize, EmbeddingSizeEstimator};
pub use error::{ConfigError, Error, Result, StateError};
pub use ops::{Op, OpRole, Transform};
pub use source::PartitionSource;
pub use stats::{CategoryTable, ContinuousStats, FrozenStats};
pub use workflow::{RunOptions, Workflow, WorkflowState};
pub use writer::{OutputManifest, WriterConfig};
