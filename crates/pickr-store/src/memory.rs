use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use pickr_core::{DuplicateGroup, LabelStore, NormalizedRow, UniqueLabel};

/// Label tables held in memory, for tests and small one-off runs.
#[derive(Default)]
pub struct MemoryLabelStore {
    source: Mutex<Vec<(String, String)>>,
    normalized: Mutex<Vec<NormalizedRow>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A name with its distinct labels (first-seen order) and row count.
struct NameGroup {
    name: String,
    labels: Vec<String>,
    rows: usize,
}

impl MemoryLabelStore {
    pub fn from_rows<I, N, L>(rows: I) -> Self
    where
        I: IntoIterator<Item = (N, L)>,
        N: Into<String>,
        L: Into<String>,
    {
        let store = Self::default();
        lock(&store.source).extend(rows.into_iter().map(|(n, l)| (n.into(), l.into())));
        store
    }

    pub fn source_rows(&self) -> Vec<(String, String)> {
        lock(&self.source).clone()
    }

    pub fn normalized_rows(&self) -> Vec<NormalizedRow> {
        lock(&self.normalized).clone()
    }

    fn name_groups(&self) -> Vec<NameGroup> {
        let source = lock(&self.source);
        let mut groups: Vec<NameGroup> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (name, label) in source.iter() {
            let i = *index.entry(name.as_str()).or_insert_with(|| {
                groups.push(NameGroup {
                    name: name.clone(),
                    labels: Vec::new(),
                    rows: 0,
                });
                groups.len() - 1
            });
            let group = &mut groups[i];
            group.rows += 1;
            if !group.labels.contains(label) {
                group.labels.push(label.clone());
            }
        }
        groups
    }
}

impl LabelStore for MemoryLabelStore {
    fn clear_normalized(&self) -> anyhow::Result<()> {
        lock(&self.normalized).clear();
        Ok(())
    }

    fn unique_labels(&self) -> anyhow::Result<Vec<UniqueLabel>> {
        Ok(self
            .name_groups()
            .into_iter()
            .filter(|g| g.labels.len() == 1)
            .filter_map(|g| {
                let label = g.labels.into_iter().next()?;
                Some(UniqueLabel {
                    name: g.name,
                    label,
                })
            })
            .collect())
    }

    fn duplicate_groups(&self) -> anyhow::Result<Vec<DuplicateGroup>> {
        Ok(self
            .name_groups()
            .into_iter()
            .filter(|g| g.labels.len() > 1)
            .map(|g| DuplicateGroup {
                name: g.name,
                labels: g.labels,
                row_count: g.rows,
            })
            .collect())
    }

    fn insert_normalized(&self, rows: &[NormalizedRow]) -> anyhow::Result<usize> {
        lock(&self.normalized).extend_from_slice(rows);
        Ok(rows.len())
    }

    fn update_source_labels(&self, updates: &[(String, String)]) -> anyhow::Result<usize> {
        let mut source = lock(&self.source);
        let mut changed = 0;
        for (name, label) in updates {
            for row in source.iter_mut().filter(|(n, l)| n == name && l != label) {
                row.1 = label.clone();
                changed += 1;
            }
        }
        Ok(changed)
    }
}
