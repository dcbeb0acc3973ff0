//! Reconcile several classification passes into one path per item.
//!
//! Items whose passes agree are copied straight through. Only items with
//! two or more distinct candidate paths become [`MergeTask`]s and reach the
//! model.

use std::collections::{BTreeMap, HashMap};

use pickr_core::{BatchRequest, CategoryPath, ChatOptions, MergeTask, normalize_path};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchError, UnifiedDispatcher};
use crate::progress::{ChunkProgress, ProgressReporter};
use crate::response::{parse_json_object, string_field};

const MERGE_SYSTEM_PROMPT: &str = "You reconcile conflicting category paths.\n\
Each input item comes with the candidate paths different classifiers gave it.\n\
Choose one candidate, or write a better one, as the single canonical path for each item.\n\
Prefer shorter, standard, noun-style categories over ad hoc refinements.\n\
Keep the \" > \" separator and the first level of the candidates.\n\
Return ONLY a JSON object mapping every item, spelled exactly as given, to its chosen path.";

#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Conflicting items per request.
    pub batch_size: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self { batch_size: 20 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub success: bool,
    pub merged: Vec<CategoryPath>,
    pub errors: Vec<String>,
}

pub struct MergeEngine<'a> {
    dispatcher: &'a UnifiedDispatcher,
    options: MergeOptions,
}

/// Candidate paths per item, both in first-seen order.
///
/// Blank paths are not candidates, but their item is still registered so
/// it surfaces in the outcome.
#[derive(Default)]
struct Candidates {
    order: Vec<String>,
    paths: HashMap<String, Vec<String>>,
}

impl Candidates {
    fn add(&mut self, item: &str, path: &str) {
        let path = normalize_path(path);
        if !self.paths.contains_key(item) {
            self.order.push(item.to_string());
        }
        let seen = self.paths.entry(item.to_string()).or_default();
        if !path.is_empty() && !seen.contains(&path) {
            seen.push(path);
        }
    }
}

fn merge_prompt(tasks: &[MergeTask]) -> String {
    let body: Map<String, Value> = tasks
        .iter()
        .map(|t| (t.item.clone(), Value::from(t.candidate_paths.clone())))
        .collect();
    format!("Candidates per item:\n{}", Value::Object(body))
}

impl<'a> MergeEngine<'a> {
    pub fn new(dispatcher: &'a UnifiedDispatcher) -> Self {
        Self {
            dispatcher,
            options: MergeOptions::default(),
        }
    }

    pub fn with_options(mut self, options: MergeOptions) -> Self {
        self.options = options;
        self
    }

    /// Merge passes given as `item → path` maps.
    pub async fn merge_results(
        &self,
        passes: &[BTreeMap<String, String>],
        progress: Option<&ProgressReporter>,
    ) -> Result<MergeOutcome, DispatchError> {
        let mut candidates = Candidates::default();
        for pass in passes {
            for (item, path) in pass {
                candidates.add(item, path);
            }
        }
        self.merge(candidates, progress).await
    }

    /// Merge passes of [`CategoryPath`]s, e.g. several classification runs.
    pub async fn merge_categories(
        &self,
        passes: &[Vec<CategoryPath>],
        progress: Option<&ProgressReporter>,
    ) -> Result<MergeOutcome, DispatchError> {
        let mut candidates = Candidates::default();
        for pass in passes {
            for c in pass {
                candidates.add(&c.item, &c.path);
            }
        }
        self.merge(candidates, progress).await
    }

    async fn merge(
        &self,
        candidates: Candidates,
        progress: Option<&ProgressReporter>,
    ) -> Result<MergeOutcome, DispatchError> {
        let Candidates { order, mut paths } = candidates;
        let total = order.len();

        let tasks: Vec<MergeTask> = order
            .iter()
            .filter_map(|item| MergeTask::new(item.as_str(), paths.get(item).cloned()?))
            .collect();
        let unanimous = total - tasks.len();
        debug!(count = total, unanimous, conflicts = tasks.len(), "merge candidates collected");

        let mut chosen: HashMap<String, String> = HashMap::with_capacity(tasks.len());
        let mut errors = Vec::new();

        if !tasks.is_empty() {
            let chunks: Vec<&[MergeTask]> = tasks.chunks(self.options.batch_size.max(1)).collect();
            let options = ChatOptions::json().with_temperature(0.1);
            let requests = chunks
                .iter()
                .enumerate()
                .map(|(i, chunk)| {
                    BatchRequest::prompt(
                        i.to_string(),
                        MERGE_SYSTEM_PROMPT,
                        merge_prompt(chunk),
                        options.clone(),
                    )
                })
                .collect();
            let observer = ChunkProgress::new(chunks.iter().map(|c| c.len()).collect(), progress)
                .with_base(unanimous);
            if let Some(p) = progress {
                p.report(unanimous, total);
            }

            info!(conflicts = tasks.len(), chunks = chunks.len(), "merging conflicting paths");
            let results = self.dispatcher.chat_batch_observed(requests, &observer).await?;

            for (index, (chunk, result)) in chunks.iter().zip(results).enumerate() {
                let answer = match result.response {
                    Ok(text) => parse_json_object(&text).ok_or_else(|| {
                        warn!(chunk = index, "unparseable merge response");
                        "unparseable response".to_string()
                    }),
                    Err(e) => {
                        warn!(chunk = index, error = %e, "merge chunk failed");
                        Err(e.to_string())
                    }
                };

                for task in chunk.iter() {
                    let picked = match &answer {
                        Ok(obj) => string_field(obj, &task.item)
                            .map(normalize_path)
                            .filter(|p| !p.is_empty())
                            .ok_or_else(|| "missing from response".to_string()),
                        Err(reason) => Err(format!("chunk {index} failed: {reason}")),
                    };
                    let path = match picked {
                        Ok(path) => path,
                        Err(reason) => {
                            errors.push(format!(
                                "{}: {reason}, kept {:?}",
                                task.item,
                                task.first_candidate()
                            ));
                            task.first_candidate().to_string()
                        }
                    };
                    chosen.insert(task.item.clone(), path);
                }
            }
        }

        let mut merged = Vec::with_capacity(total);
        for item in order {
            let path = match chosen.remove(&item) {
                Some(path) => path,
                None => match paths.remove(&item).and_then(|p| p.into_iter().next()) {
                    Some(path) => path,
                    None => {
                        warn!(item = %item, "no usable candidate path");
                        errors.push(format!("{item}: no non-empty candidate path"));
                        continue;
                    }
                },
            };
            match CategoryPath::new(item.as_str(), &path) {
                Ok(c) => merged.push(c),
                Err(e) => errors.push(format!("{item}: {e}")),
            }
        }

        if let Some(p) = progress {
            p.finish(total);
        }
        info!(count = merged.len(), errors = errors.len(), "merge finished");

        Ok(MergeOutcome {
            success: errors.is_empty(),
            merged,
            errors,
        })
    }
}
