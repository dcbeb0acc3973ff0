//! Contract for the persisted label tables consumed by normalisation.
//!
//! The source table holds `(name, label)` rows, possibly many per name. The
//! destination table holds one normalised row per name with a `source_count`
//! of how many source rows it stands for.

use serde::{Deserialize, Serialize};

/// A name whose source rows all carry the same label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueLabel {
    pub name: String,
    pub label: String,
}

/// A name whose source rows disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub name: String,
    /// Distinct labels, in first-seen order.
    pub labels: Vec<String>,
    /// Number of source rows carrying this name.
    pub row_count: usize,
}

/// One row of the destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub name: String,
    pub label: String,
    pub source_count: usize,
}

/// Read/write access to the source and destination label tables.
pub trait LabelStore {
    /// Empty the destination table.
    fn clear_normalized(&self) -> anyhow::Result<()>;

    /// Names with exactly one distinct label.
    fn unique_labels(&self) -> anyhow::Result<Vec<UniqueLabel>>;

    /// Names with two or more distinct labels.
    fn duplicate_groups(&self) -> anyhow::Result<Vec<DuplicateGroup>>;

    /// Bulk-insert destination rows, returning the number written.
    fn insert_normalized(&self, rows: &[NormalizedRow]) -> anyhow::Result<usize>;

    /// Set the label of every source row with the given name.
    ///
    /// Returns the number of source rows changed.
    fn update_source_labels(&self, updates: &[(String, String)]) -> anyhow::Result<usize>;
}
