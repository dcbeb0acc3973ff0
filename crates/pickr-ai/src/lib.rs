//! Model-backed classification layer: backend dispatch, fair batch scheduling,
//! tolerant response parsing, and the pipelines built on them.

pub mod backend;
pub mod classify;
pub mod cluster;
pub mod dispatcher;
pub mod merge;
pub mod normalize;
pub mod progress;
pub mod response;
pub mod scheduler;

pub use backend::{
    BackendError, BatchObserver, BatchResult, ChatBackend, CloudBackend, LocalBackend,
};
pub use classify::{ClassificationPipeline, ClassifyOptions, ClassifyOutcome};
pub use cluster::{
    ClusterOptions, ClusterOutcome, ClusterStrategy, HierarchicalClusterer, Termination,
    TipAssignment,
};
pub use dispatcher::{DispatchError, DispatcherState, UnifiedDispatcher};
pub use merge::{MergeEngine, MergeOptions, MergeOutcome};
pub use normalize::{NormalizationPipeline, NormalizeReport};
pub use progress::{Progress, ProgressReporter, ProgressStream};
pub use response::parse_json_object;
pub use scheduler::{BatchPermit, FairBatchScheduler};
