//! Canonical classification and clustering value types.
//!
//! A category path is a `" > "`-delimited string such as `음식 > 구이`.
//! The first level is the root label; the remaining levels narrow it down.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between levels of a category path.
pub const PATH_DELIMITER: &str = " > ";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CategoryError {
    #[error("category item is empty")]
    EmptyItem,
    #[error("category path for {0:?} is empty")]
    EmptyPath(String),
}

/// The canonical classification of one item.
///
/// `levels` is always the split of `path` on [`PATH_DELIMITER`], with
/// whitespace trimmed and empty segments dropped. `path` is re-joined from
/// `levels`, so `"음식>구이"` and `"음식 > 구이 "` normalise to the same value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPath {
    pub item: String,
    pub path: String,
    pub levels: Vec<String>,
}

impl CategoryPath {
    pub fn new(item: impl Into<String>, path: &str) -> Result<Self, CategoryError> {
        let item = item.into();
        if item.trim().is_empty() {
            return Err(CategoryError::EmptyItem);
        }
        let levels = split_path(path);
        if levels.is_empty() {
            return Err(CategoryError::EmptyPath(item));
        }
        Ok(Self {
            item,
            path: levels.join(PATH_DELIMITER),
            levels,
        })
    }

    /// Build a path guaranteed to start with `root`.
    ///
    /// If the first level is not `root`, the root is prepended.
    pub fn rooted(item: impl Into<String>, path: &str, root: &str) -> Result<Self, CategoryError> {
        let item = item.into();
        let mut levels = split_path(path);
        if levels.is_empty() {
            return Err(CategoryError::EmptyPath(item));
        }
        if levels[0] != root.trim() {
            levels.insert(0, root.trim().to_string());
        }
        Self::new(item, &levels.join(PATH_DELIMITER))
    }

    /// The root label (`levels[0]`).
    pub fn root(&self) -> &str {
        &self.levels[0]
    }

    /// The most specific level.
    pub fn leaf(&self) -> &str {
        &self.levels[self.levels.len() - 1]
    }
}

/// Split a path on `>` and trim each level.
pub fn split_path(path: &str) -> Vec<String> {
    path.split('>')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Canonical spelling of a path: levels trimmed and re-joined.
///
/// Empty when the path has no non-blank level.
pub fn normalize_path(path: &str) -> String {
    split_path(path).join(PATH_DELIMITER)
}

/// A cluster of free-text tips sharing one representative label.
///
/// `original_tips` keeps input multiplicity: two identical input tips are
/// two entries, so `count == original_tips.len()` and every input tip lands
/// in exactly one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipGroup {
    pub representative: String,
    pub original_tips: Vec<String>,
    pub count: usize,
}

impl TipGroup {
    pub fn new(representative: impl Into<String>, original_tips: Vec<String>) -> Self {
        let count = original_tips.len();
        Self {
            representative: representative.into(),
            original_tips,
            count,
        }
    }

    /// A group containing only `tip`, represented by itself.
    pub fn singleton(tip: &str) -> Self {
        Self::new(tip, vec![tip.to_string()])
    }

    /// Fold `other`'s members into this group.
    pub fn absorb(&mut self, other: TipGroup) {
        self.original_tips.extend(other.original_tips);
        self.count = self.original_tips.len();
    }
}

/// An item whose merge passes disagree.
///
/// Only built for items with two or more distinct candidates; candidates are
/// kept in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeTask {
    pub item: String,
    pub candidate_paths: Vec<String>,
}

impl MergeTask {
    /// Returns `None` when fewer than two distinct candidates are given.
    pub fn new(item: impl Into<String>, candidates: Vec<String>) -> Option<Self> {
        let mut candidate_paths: Vec<String> = Vec::with_capacity(candidates.len());
        for c in candidates {
            if !candidate_paths.contains(&c) {
                candidate_paths.push(c);
            }
        }
        (candidate_paths.len() >= 2).then(|| Self {
            item: item.into(),
            candidate_paths,
        })
    }

    /// The first-seen candidate, used when the model gives no answer.
    pub fn first_candidate(&self) -> &str {
        &self.candidate_paths[0]
    }
}
