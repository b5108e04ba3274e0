pub mod checkpoint;
pub mod config;
pub mod executor;
pub mod harvest;
pub mod model;
pub mod resilience;
pub mod telemetry;
pub mod traits;

// Re-export common types for convenience
pub use checkpoint::{CheckpointError, CheckpointState, CheckpointStore};
pub use config::{ConfigError, HarvestConfig};
pub use executor::*;
pub use harvest::{HarvestPipeline, HarvestReport, PipelineError, RunPhase, SourceReport};
pub use model::*;
pub use traits::*;
