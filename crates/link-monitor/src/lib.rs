pub mod anomaly;
pub mod classifier;
mod error;
pub mod extractor;
pub mod labeling;
pub mod live;
pub mod orchestrator;
pub mod probe;
pub mod record;
pub mod report;
pub mod runner;
pub mod settings;
pub mod store;

pub use error::{Error, Result, StoreError};
pub use orchestrator::{CycleReport, Orchestrator, OrchestratorConfig, OrchestratorState, RunSummary};
pub use record::{FeatureVector, Metric, MetricRecord};
