//! Extract → dedupe → map.
//!
//! 1. Every tip gets one raw label.
//! 2. Raw labels are folded into canonical categories, each remembering the
//!    raw labels it absorbed. Rounds repeat while the set is larger than one
//!    chunk, up to `max_dedupe_rounds`.
//! 3. Every tip is mapped onto the now-closed category set. Invalid or
//!    missing answers fall back to the category that absorbed the tip's raw
//!    label; there is no catch-all bucket.

use std::collections::{HashMap, HashSet};

use pickr_core::TipGroup;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{
    ClusterOptions, ClusterOutcome, Termination, TipAssignment, ask_json, index_value, sort_groups,
};
use crate::dispatcher::{DispatchError, UnifiedDispatcher};
use crate::response::string_field;

const EXTRACT_SYSTEM_PROMPT: &str = "You label short customer remarks.\n\
The input is a JSON array; refer to remarks by their 0-based index.\n\
Give each remark one short category label, a noun phrase in the remarks' language.\n\
Return ONLY a JSON object mapping each index, as a string, to its label, e.g. {\"0\": \"친절\", \"1\": \"맛\"}.";

const DEDUPE_SYSTEM_PROMPT: &str = "You merge category labels that mean the same thing.\n\
The input is a JSON array of labels.\n\
Return ONLY a JSON object {\"categories\": [{\"name\": \"canonical label\", \"absorbed\": [\"label\"]}]}.\n\
Every input label appears in exactly one absorbed list, spelled exactly as given. Keep names short.";

const MAP_SYSTEM_PROMPT: &str = "You assign customer remarks to a fixed list of categories.\n\
Give every remark exactly one category from the list: the closest fit, even if imperfect.\n\
Never invent a category and never use a catch-all such as \"기타\" or \"other\" unless it is in the list.\n\
Return ONLY a JSON object {\"assignments\": [{\"index\": 0, \"category\": \"name\", \"confidence\": 0.9}]} \
with one entry per remark index.";

/// A canonical category and the raw labels folded into it.
#[derive(Debug, Clone, PartialEq)]
struct Category {
    name: String,
    absorbed: Vec<String>,
}

/// Categories keyed by name; pushing an existing name merges into it.
#[derive(Default)]
struct CategorySet {
    categories: Vec<Category>,
    by_name: HashMap<String, usize>,
}

impl CategorySet {
    fn push(&mut self, category: Category) {
        match self.by_name.get(&category.name) {
            Some(&i) => self.categories[i].absorbed.extend(category.absorbed),
            None => {
                self.by_name.insert(category.name.clone(), self.categories.len());
                self.categories.push(category);
            }
        }
    }
}

/// Phase 1: one raw label per tip. A tip the model skipped is its own label.
async fn extract_labels(
    dispatcher: &UnifiedDispatcher,
    tips: &[String],
    chunk_size: usize,
    errors: &mut Vec<String>,
) -> Result<Vec<String>, DispatchError> {
    let chunks: Vec<&[String]> = tips.chunks(chunk_size).collect();
    let prompts: Vec<String> = chunks
        .iter()
        .map(|chunk| format!("Remarks:\n{}", json!(chunk)))
        .collect();
    let replies = ask_json(dispatcher, EXTRACT_SYSTEM_PROMPT, &prompts).await?;

    let mut labels = Vec::with_capacity(tips.len());
    for (index, (chunk, reply)) in chunks.iter().zip(replies).enumerate() {
        let obj = match reply {
            Ok(obj) => Some(obj),
            Err(reason) => {
                warn!(chunk = index, error = %reason, "label extraction chunk failed");
                errors.push(format!("extract chunk {index}: {reason}"));
                None
            }
        };
        for (i, tip) in chunk.iter().enumerate() {
            let label = obj.as_ref().and_then(|o| string_field(o, &i.to_string()));
            match label {
                Some(label) => labels.push(label.to_string()),
                None => {
                    if obj.is_some() {
                        errors.push(format!("{tip}: no label extracted"));
                    }
                    labels.push(tip.trim().to_string());
                }
            }
        }
    }
    Ok(labels)
}

/// One dedupe round over the current category names.
///
/// Names the model leaves out (or a failed chunk) carry over unchanged.
async fn dedupe_round(
    dispatcher: &UnifiedDispatcher,
    categories: Vec<Category>,
    chunk_size: usize,
    round: usize,
    errors: &mut Vec<String>,
) -> Result<Vec<Category>, DispatchError> {
    let names: Vec<String> = categories.iter().map(|c| c.name.clone()).collect();
    let chunks: Vec<&[String]> = names.chunks(chunk_size).collect();
    let prompts: Vec<String> = chunks
        .iter()
        .map(|chunk| format!("Labels:\n{}", json!(chunk)))
        .collect();
    let replies = ask_json(dispatcher, DEDUPE_SYSTEM_PROMPT, &prompts).await?;

    let mut slots: Vec<Option<Category>> = categories.into_iter().map(Some).collect();
    let mut out = CategorySet::default();
    for (index, (chunk, reply)) in chunks.iter().zip(replies).enumerate() {
        let offset = index * chunk_size;
        let position: HashMap<&str, usize> = chunk
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), offset + i))
            .collect();

        match reply {
            Ok(obj) => {
                let entries = obj.get("categories").and_then(Value::as_array).into_iter().flatten();
                for entry in entries.filter_map(Value::as_object) {
                    let Some(name) = string_field(entry, "name") else {
                        continue;
                    };
                    let absorbed = entry
                        .get("absorbed")
                        .and_then(Value::as_array)
                        .into_iter()
                        .flatten();
                    let mut merged = Category {
                        name: name.to_string(),
                        absorbed: Vec::new(),
                    };
                    for label in absorbed.filter_map(Value::as_str) {
                        if let Some(old) =
                            position.get(label.trim()).and_then(|&i| slots[i].take())
                        {
                            merged.absorbed.extend(old.absorbed);
                        }
                    }
                    if !merged.absorbed.is_empty() {
                        out.push(merged);
                    }
                }
            }
            Err(reason) => {
                warn!(round, chunk = index, error = %reason, "dedupe chunk failed");
                errors.push(format!("dedupe round {round} chunk {index}: {reason}"));
            }
        }

        for slot in &mut slots[offset..offset + chunk.len()] {
            if let Some(left) = slot.take() {
                out.push(left);
            }
        }
    }
    Ok(out.categories)
}

/// Phase 2: fold raw labels into a closed category set.
async fn dedupe(
    dispatcher: &UnifiedDispatcher,
    raw_labels: &[String],
    options: &ClusterOptions,
    errors: &mut Vec<String>,
) -> Result<(Vec<Category>, usize, Termination), DispatchError> {
    let mut seen = HashSet::new();
    let mut categories: Vec<Category> = raw_labels
        .iter()
        .filter(|l| seen.insert(l.as_str()))
        .map(|l| Category {
            name: l.clone(),
            absorbed: vec![l.clone()],
        })
        .collect();

    let mut rounds = 0;
    let termination = loop {
        if rounds >= options.max_dedupe_rounds {
            break Termination::DepthExceeded;
        }
        rounds += 1;
        let before = categories.len();
        categories =
            dedupe_round(dispatcher, categories, options.chunk_size, rounds, errors).await?;
        debug!(round = rounds, before, after = categories.len(), "dedupe round done");

        if categories.len() <= options.chunk_size {
            break Termination::FitsInChunk;
        }
        if categories.len() >= before {
            break Termination::NoProgress;
        }
    };
    Ok((categories, rounds, termination))
}

/// Phase 3: force every tip onto one of `categories`.
async fn map_tips(
    dispatcher: &UnifiedDispatcher,
    tips: &[String],
    raw_labels: &[String],
    categories: &[Category],
    chunk_size: usize,
    errors: &mut Vec<String>,
) -> Result<Vec<TipAssignment>, DispatchError> {
    let names: HashSet<&str> = categories.iter().map(|c| c.name.as_str()).collect();
    let owner: HashMap<&str, &str> = categories
        .iter()
        .flat_map(|c| c.absorbed.iter().map(move |raw| (raw.as_str(), c.name.as_str())))
        .collect();
    // First of the largest categories.
    let largest = categories
        .iter()
        .rev()
        .max_by_key(|c| c.absorbed.len())
        .map(|c| c.name.as_str());

    let catalogue = json!(categories.iter().map(|c| &c.name).collect::<Vec<_>>());
    let chunks: Vec<&[String]> = tips.chunks(chunk_size).collect();
    let prompts: Vec<String> = chunks
        .iter()
        .map(|chunk| format!("Categories:\n{catalogue}\nRemarks:\n{}", json!(chunk)))
        .collect();
    let replies = ask_json(dispatcher, MAP_SYSTEM_PROMPT, &prompts).await?;

    let mut assignments = Vec::with_capacity(tips.len());
    for (index, (chunk, reply)) in chunks.iter().zip(replies).enumerate() {
        let offset = index * chunk_size;
        let mut answered: Vec<Option<(String, f32)>> = vec![None; chunk.len()];
        let failure = match reply {
            Ok(obj) => {
                let entries = obj
                    .get("assignments")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten();
                for entry in entries.filter_map(Value::as_object) {
                    let Some(i) = entry.get("index").and_then(index_value) else {
                        continue;
                    };
                    let Some(category) = string_field(entry, "category") else {
                        continue;
                    };
                    if i >= chunk.len() || answered[i].is_some() || !names.contains(category) {
                        continue;
                    }
                    let confidence = entry
                        .get("confidence")
                        .and_then(Value::as_f64)
                        .map_or(0.0, |c| c.clamp(0.0, 1.0) as f32);
                    answered[i] = Some((category.to_string(), confidence));
                }
                None
            }
            Err(reason) => {
                warn!(chunk = index, error = %reason, "mapping chunk failed");
                Some(reason)
            }
        };

        for (i, tip) in chunk.iter().enumerate() {
            let (category, confidence) = match answered[i].take() {
                Some(answer) => answer,
                None => {
                    let raw = raw_labels[offset + i].as_str();
                    let fallback = owner.get(raw).copied().or(largest).unwrap_or(raw);
                    let reason = match &failure {
                        Some(reason) => format!("map chunk {index} failed: {reason}"),
                        None => "no valid category in response".to_string(),
                    };
                    errors.push(format!("{tip}: {reason}, assigned {fallback:?}"));
                    (fallback.to_string(), 0.0)
                }
            };
            assignments.push(TipAssignment {
                tip: tip.clone(),
                category,
                confidence,
            });
        }
    }
    Ok(assignments)
}

pub(super) async fn run(
    dispatcher: &UnifiedDispatcher,
    options: &ClusterOptions,
    tips: &[String],
) -> Result<ClusterOutcome, DispatchError> {
    let mut errors = Vec::new();

    let raw_labels = extract_labels(dispatcher, tips, options.chunk_size, &mut errors).await?;
    info!(tips = tips.len(), "raw labels extracted");

    let (categories, rounds, termination) =
        dedupe(dispatcher, &raw_labels, options, &mut errors).await?;
    info!(categories = categories.len(), rounds, termination = ?termination, "category set fixed");

    let assignments = map_tips(
        dispatcher,
        tips,
        &raw_labels,
        &categories,
        options.chunk_size,
        &mut errors,
    )
    .await?;

    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<TipGroup> = Vec::new();
    for a in &assignments {
        let slot = *index.entry(a.category.as_str()).or_insert_with(|| {
            groups.push(TipGroup::new(a.category.as_str(), Vec::new()));
            groups.len() - 1
        });
        groups[slot].absorb(TipGroup::singleton(&a.tip));
    }
    sort_groups(&mut groups);
    info!(groups = groups.len(), errors = errors.len(), "extract clustering finished");

    Ok(ClusterOutcome {
        success: errors.is_empty(),
        groups,
        errors,
        depth: rounds,
        termination: Some(termination),
        assignments,
    })
}
