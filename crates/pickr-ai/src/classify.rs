//! Chunked item → category-path classification.
//!
//! Items are split into chunks; each chunk is one request asking the model
//! for an `{item: path}` object. Whatever the model drops, garbles, or fails
//! to answer gets the fallback label and an `errors` entry. The output
//! always has one [`CategoryPath`] per input item, in input order.

use pickr_core::{BatchRequest, CategoryPath, ChatOptions};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::dispatcher::{DispatchError, UnifiedDispatcher};
use crate::progress::{ChunkProgress, ProgressReporter};
use crate::response::{parse_json_object, string_field};

pub const DEFAULT_ROOT_LABEL: &str = "음식";
pub const DEFAULT_FALLBACK_LABEL: &str = "음식 > 기타";

#[derive(Debug, Clone)]
pub struct ClassifyOptions {
    /// Items per request. `None` uses the active backend's default.
    pub batch_size: Option<usize>,
    pub root_label: String,
    pub fallback_label: String,
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        Self {
            batch_size: None,
            root_label: DEFAULT_ROOT_LABEL.to_string(),
            fallback_label: DEFAULT_FALLBACK_LABEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifyOutcome {
    pub success: bool,
    pub categories: Vec<CategoryPath>,
    pub errors: Vec<String>,
}

pub struct ClassificationPipeline<'a> {
    dispatcher: &'a UnifiedDispatcher,
    options: ClassifyOptions,
}

fn system_prompt(root: &str) -> String {
    format!(
        "You classify restaurant menu items into a category hierarchy.\n\
         Return ONLY a JSON object that maps every input item, spelled exactly as given, \
         to its category path.\n\
         A path joins levels with \" > \" and starts with \"{root}\", \
         e.g. \"{root} > 구이\" or \"{root} > 주류 > 소주\".\n\
         Use short, common noun categories and at most three levels. Do not skip any item."
    )
}

fn user_prompt(chunk: &[String]) -> String {
    format!("Classify these items:\n{}", json!(chunk))
}

impl<'a> ClassificationPipeline<'a> {
    pub fn new(dispatcher: &'a UnifiedDispatcher) -> Self {
        Self {
            dispatcher,
            options: ClassifyOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ClassifyOptions) -> Self {
        self.options = options;
        self
    }

    /// Classify `items`, reporting item-level progress after each chunk.
    ///
    /// Only precondition violations are `Err`: no active backend, an empty
    /// item, or an empty root or fallback label.
    pub async fn classify(
        &self,
        items: &[String],
        progress: Option<&ProgressReporter>,
    ) -> Result<ClassifyOutcome, DispatchError> {
        if let Some(pos) = items.iter().position(|i| i.trim().is_empty()) {
            return Err(DispatchError::InvalidInput(format!("item {pos} is empty")));
        }
        let root = self.options.root_label.trim();
        if root.is_empty() {
            return Err(DispatchError::InvalidInput("root label is empty".to_string()));
        }
        let fallback = CategoryPath::rooted("fallback", &self.options.fallback_label, root)
            .map_err(|_| DispatchError::InvalidInput("fallback label is empty".to_string()))?;

        let total = items.len();
        if total == 0 {
            if let Some(p) = progress {
                p.finish(0);
            }
            return Ok(ClassifyOutcome {
                success: true,
                categories: Vec::new(),
                errors: Vec::new(),
            });
        }

        let batch_size = self
            .options
            .batch_size
            .unwrap_or_else(|| self.dispatcher.default_batch_size())
            .max(1);
        let chunks: Vec<&[String]> = items.chunks(batch_size).collect();
        let system = system_prompt(root);
        let options = ChatOptions::json().with_temperature(0.1);

        let requests = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                BatchRequest::prompt(i.to_string(), &system, user_prompt(chunk), options.clone())
            })
            .collect();
        let observer = ChunkProgress::new(chunks.iter().map(|c| c.len()).collect(), progress);

        info!(count = total, chunks = chunks.len(), batch_size, "classifying items");
        let results = self.dispatcher.chat_batch_observed(requests, &observer).await?;

        let mut categories = Vec::with_capacity(total);
        let mut errors = Vec::new();
        for (index, (chunk, result)) in chunks.iter().zip(results).enumerate() {
            let mapping = match result.response {
                Ok(text) => match parse_json_object(&text) {
                    Some(obj) => Ok(obj),
                    None => {
                        warn!(chunk = index, "unparseable classification response");
                        Err("unparseable response".to_string())
                    }
                },
                Err(e) => {
                    warn!(chunk = index, error = %e, "classification chunk failed");
                    Err(e.to_string())
                }
            };

            for item in chunk.iter() {
                let reason = match &mapping {
                    Ok(obj) => match string_field(obj, item) {
                        Some(path) => match CategoryPath::rooted(item.as_str(), path, root) {
                            Ok(category) => {
                                categories.push(category);
                                continue;
                            }
                            Err(e) => e.to_string(),
                        },
                        None => "missing from response".to_string(),
                    },
                    Err(reason) => format!("chunk {index} failed: {reason}"),
                };
                errors.push(format!("{item}: {reason}"));
                categories.push(CategoryPath {
                    item: item.clone(),
                    ..fallback.clone()
                });
            }
        }

        if let Some(p) = progress {
            p.finish(total);
        }
        if !errors.is_empty() {
            warn!(errors = errors.len(), count = total, "classification used fallback labels");
        }
        info!(count = categories.len(), "classification finished");

        Ok(ClassifyOutcome {
            success: errors.is_empty(),
            categories,
            errors,
        })
    }
}
