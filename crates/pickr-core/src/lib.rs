pub mod category;
pub mod chat;
pub mod config;
pub mod store;

pub use category::{
    CategoryError, CategoryPath, MergeTask, PATH_DELIMITER, TipGroup, normalize_path, split_path,
};
pub use chat::{BatchRequest, ChatMessage, ChatOptions, Role};
pub use config::{BackendConfig, BackendKind, CloudConfig, LocalConfig};
pub use store::{DuplicateGroup, LabelStore, NormalizedRow, UniqueLabel};
