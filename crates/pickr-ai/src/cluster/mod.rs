//! Hierarchical clustering of short free-text tips into representative groups.
//!
//! Two strategies are available:
//!
//! - [`ClusterStrategy::ExtractDedupeMap`] (default): label every tip,
//!   deduplicate the labels into a closed category set, then map every tip
//!   onto that set. Output cardinality is bounded by the category set.
//! - [`ClusterStrategy::Recursive`]: group chunks of tips, then repeatedly
//!   regroup the representatives until the model reports convergence, the
//!   groups fit in one chunk, a pass makes no progress, or `max_depth` is hit.
//!
//! Both put every input tip in exactly one [`TipGroup`], keeping duplicates.

mod extract;
mod recursive;

use std::fmt;
use std::str::FromStr;

use pickr_core::{ChatOptions, TipGroup};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dispatcher::{DispatchError, UnifiedDispatcher};
use crate::response::parse_json_object;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStrategy {
    Recursive,
    #[default]
    ExtractDedupeMap,
}

impl ClusterStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recursive => "recursive",
            Self::ExtractDedupeMap => "extract",
        }
    }
}

impl fmt::Display for ClusterStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "recursive" => Ok(Self::Recursive),
            "extract" | "extract_dedupe_map" => Ok(Self::ExtractDedupeMap),
            other => Err(format!(
                "unknown cluster strategy {other:?} (expected \"recursive\" or \"extract\")"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub strategy: ClusterStrategy,
    /// Tips (or labels) per request.
    pub chunk_size: usize,
    /// Merge passes allowed after the initial chunking (recursive strategy).
    pub max_depth: usize,
    /// Deduplication rounds allowed (extract strategy).
    pub max_dedupe_rounds: usize,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            strategy: ClusterStrategy::default(),
            chunk_size: 50,
            max_depth: 5,
            max_dedupe_rounds: 2,
        }
    }
}

/// Why the iterative part of a clustering run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The model reported nothing left to merge.
    ModelConverged,
    /// The group count fell to or below the chunk size.
    FitsInChunk,
    /// A pass left the group count unchanged.
    NoProgress,
    /// The depth or round limit was reached.
    DepthExceeded,
}

/// The category one tip was mapped to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TipAssignment {
    pub tip: String,
    pub category: String,
    /// Model-reported confidence in `[0, 1]`; 0 when the category was
    /// chosen by fallback.
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterOutcome {
    pub success: bool,
    /// Sorted by descending `count`.
    pub groups: Vec<TipGroup>,
    pub errors: Vec<String>,
    /// Merge passes (recursive) or dedupe rounds (extract) performed.
    pub depth: usize,
    pub termination: Option<Termination>,
    /// Per-tip mapping, in input order. Empty for the recursive strategy.
    pub assignments: Vec<TipAssignment>,
}

pub struct HierarchicalClusterer<'a> {
    dispatcher: &'a UnifiedDispatcher,
    options: ClusterOptions,
}

impl<'a> HierarchicalClusterer<'a> {
    pub fn new(dispatcher: &'a UnifiedDispatcher) -> Self {
        Self {
            dispatcher,
            options: ClusterOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ClusterOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn cluster(&self, tips: &[String]) -> Result<ClusterOutcome, DispatchError> {
        if let Some(pos) = tips.iter().position(|t| t.trim().is_empty()) {
            return Err(DispatchError::InvalidInput(format!("tip {pos} is empty")));
        }
        if tips.is_empty() {
            return Ok(ClusterOutcome {
                success: true,
                groups: Vec::new(),
                errors: Vec::new(),
                depth: 0,
                termination: None,
                assignments: Vec::new(),
            });
        }

        let mut options = self.options.clone();
        options.chunk_size = options.chunk_size.max(1);
        match options.strategy {
            ClusterStrategy::Recursive => recursive::run(self.dispatcher, &options, tips).await,
            ClusterStrategy::ExtractDedupeMap => {
                extract::run(self.dispatcher, &options, tips).await
            }
        }
    }
}

/// One JSON-mode request per prompt; each reply parsed or described as an error.
async fn ask_json(
    dispatcher: &UnifiedDispatcher,
    system: &str,
    prompts: &[String],
) -> Result<Vec<Result<Map<String, Value>, String>>, DispatchError> {
    let options = ChatOptions::json().with_temperature(0.1);
    let results = dispatcher.ask_batch(Some(system), prompts, &options).await?;
    Ok(results
        .into_iter()
        .map(|r| match r.response {
            Ok(text) => parse_json_object(&text).ok_or_else(|| "unparseable response".to_string()),
            Err(e) => Err(e.to_string()),
        })
        .collect())
}

/// A non-negative index given as a JSON number or numeric string.
fn index_value(v: &Value) -> Option<usize> {
    match v {
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Largest groups first; ties keep their existing order.
fn sort_groups(groups: &mut [TipGroup]) {
    groups.sort_by(|a, b| b.count.cmp(&a.count));
}
