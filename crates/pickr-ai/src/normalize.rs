//! Collapse duplicate name → label rows into one canonical label per name.

use std::collections::BTreeMap;

use anyhow::Context;
use pickr_core::{LabelStore, NormalizedRow};
use serde::Serialize;
use tracing::info;

use crate::dispatcher::UnifiedDispatcher;
use crate::merge::{MergeEngine, MergeOptions};
use crate::progress::ProgressReporter;

#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizeReport {
    pub unique_copied: usize,
    pub merged: usize,
    pub original_updated: usize,
    pub total: usize,
    pub errors: Vec<String>,
}

pub struct NormalizationPipeline<'a, S: LabelStore + ?Sized> {
    store: &'a S,
    merger: MergeEngine<'a>,
}

impl<'a, S: LabelStore + ?Sized> NormalizationPipeline<'a, S> {
    pub fn new(store: &'a S, dispatcher: &'a UnifiedDispatcher) -> Self {
        Self {
            store,
            merger: MergeEngine::new(dispatcher),
        }
    }

    pub fn with_merge_options(mut self, options: MergeOptions) -> Self {
        self.merger = self.merger.with_options(options);
        self
    }

    /// Rebuild the destination table from the source table.
    ///
    /// Names with a single label are copied with `source_count = 1`. Names
    /// with conflicting labels are merged, counted by the rows they replace,
    /// and the merged label is written back to their source rows.
    pub async fn normalize(
        &self,
        progress: Option<&ProgressReporter>,
    ) -> anyhow::Result<NormalizeReport> {
        self.store
            .clear_normalized()
            .context("failed to clear normalized labels")?;

        let unique = self
            .store
            .unique_labels()
            .context("failed to read unique labels")?;
        let duplicates = self
            .store
            .duplicate_groups()
            .context("failed to read duplicate label groups")?;
        info!(unique = unique.len(), duplicates = duplicates.len(), "normalizing labels");

        let mut rows: Vec<NormalizedRow> = unique
            .into_iter()
            .map(|u| NormalizedRow {
                name: u.name,
                label: u.label,
                source_count: 1,
            })
            .collect();
        let unique_copied = rows.len();

        // Pass k holds each group's k-th distinct label.
        let depth = duplicates.iter().map(|g| g.labels.len()).max().unwrap_or(0);
        let passes: Vec<BTreeMap<String, String>> = (0..depth)
            .map(|k| {
                duplicates
                    .iter()
                    .filter_map(|g| Some((g.name.clone(), g.labels.get(k)?.clone())))
                    .collect()
            })
            .collect();

        let outcome = if passes.is_empty() {
            None
        } else {
            Some(self.merger.merge_results(&passes, progress).await?)
        };
        let (merged_paths, errors) = match outcome {
            Some(o) => (o.merged, o.errors),
            None => {
                if let Some(p) = progress {
                    p.finish(0);
                }
                (Vec::new(), Vec::new())
            }
        };

        let row_counts: BTreeMap<&str, usize> = duplicates
            .iter()
            .map(|g| (g.name.as_str(), g.row_count))
            .collect();
        let mut updates = Vec::with_capacity(merged_paths.len());
        for c in &merged_paths {
            rows.push(NormalizedRow {
                name: c.item.clone(),
                label: c.path.clone(),
                source_count: row_counts.get(c.item.as_str()).copied().unwrap_or(1),
            });
            updates.push((c.item.clone(), c.path.clone()));
        }
        let merged = merged_paths.len();

        let total = self
            .store
            .insert_normalized(&rows)
            .context("failed to insert normalized labels")?;
        let original_updated = self
            .store
            .update_source_labels(&updates)
            .context("failed to write merged labels back to source")?;

        info!(
            unique_copied,
            merged,
            original_updated,
            total,
            errors = errors.len(),
            "normalization finished"
        );
        Ok(NormalizeReport {
            unique_copied,
            merged,
            original_updated,
            total,
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pickr_core::BackendKind;
    use pickr_store::MemoryLabelStore;

    use super::*;
    use crate::backend::{ChatBackend, FailingBackend, ScriptedBackend};

    async fn ready(backend: Arc<dyn ChatBackend>) -> UnifiedDispatcher {
        let d = UnifiedDispatcher::new(None, Some(backend)).with_preference(BackendKind::Local);
        d.ensure_ready().await.unwrap();
        d
    }

    fn store() -> MemoryLabelStore {
        MemoryLabelStore::from_rows([
            ("삼겹살", "음식 > 구이"),
            ("삼겹살", "음식 > 구이"),
            ("소주", "음식 > 주류"),
            ("소주", "음식 > 주류 > 소주"),
            ("소주", "음식 > 주류"),
            ("김치", "음식 > 반찬"),
        ])
    }

    #[tokio::test]
    async fn copies_unique_and_merges_duplicates() {
        let backend = Arc::new(
            ScriptedBackend::new(BackendKind::Local).with_reply(r#"{"소주": "음식 > 주류"}"#),
        );
        let d = ready(backend.clone()).await;
        let store = store();

        let report = NormalizationPipeline::new(&store, &d)
            .normalize(None)
            .await
            .unwrap();

        assert_eq!(report.unique_copied, 2);
        assert_eq!(report.merged, 1);
        assert_eq!(report.total, 3);
        assert_eq!(report.original_updated, 1);
        assert!(report.errors.is_empty());
        assert_eq!(backend.call_count(), 1);

        let soju = store
            .normalized_rows()
            .into_iter()
            .find(|r| r.name == "소주")
            .unwrap();
        assert_eq!(soju.label, "음식 > 주류");
        assert_eq!(soju.source_count, 3);
        assert!(
            store
                .source_rows()
                .iter()
                .filter(|(name, _)| name == "소주")
                .all(|(_, label)| label == "음식 > 주류")
        );
    }

    #[tokio::test]
    async fn rerun_replaces_destination() {
        let d = ready(Arc::new(FailingBackend {
            kind: BackendKind::Local,
        }))
        .await;
        let store = store();

        let first = NormalizationPipeline::new(&store, &d)
            .normalize(None)
            .await
            .unwrap();
        assert_eq!(first.errors.len(), 1);
        assert_eq!(first.total, 3);

        // The write-back left one label per name, so nothing conflicts now.
        let second = NormalizationPipeline::new(&store, &d)
            .normalize(None)
            .await
            .unwrap();
        assert_eq!(second.unique_copied, 3);
        assert_eq!(second.merged, 0);
        assert!(second.errors.is_empty());
        assert_eq!(store.normalized_rows().len(), 3);
    }

    #[tokio::test]
    async fn empty_store_is_a_no_op() {
        let backend = Arc::new(ScriptedBackend::new(BackendKind::Local));
        let d = ready(backend.clone()).await;
        let store = MemoryLabelStore::default();

        let report = NormalizationPipeline::new(&store, &d)
            .normalize(None)
            .await
            .unwrap();
        assert_eq!(report.total, 0);
        assert_eq!(backend.call_count(), 0);
    }
}
