//! Recursive convergence: group chunks of tips, then keep regrouping the
//! group representatives.

use pickr_core::TipGroup;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::{ClusterOptions, ClusterOutcome, Termination, ask_json, index_value, sort_groups};
use crate::dispatcher::{DispatchError, UnifiedDispatcher};
use crate::response::string_field;

const GROUP_SYSTEM_PROMPT: &str = "You group short customer remarks that mean the same thing.\n\
The input is a JSON array; refer to remarks by their 0-based index.\n\
Return ONLY a JSON object of the form \
{\"groups\": [{\"representative\": \"short label\", \"members\": [0, 3]}], \"canMergeMore\": false}.\n\
Every index belongs to exactly one group. A representative is a short noun phrase in the remarks' language.\n\
Set canMergeMore to true only if some of your groups could still be merged with groups from other batches.";

enum State {
    Chunking,
    Merging { depth: usize },
    Converged { depth: usize, reason: Termination },
    DepthExceeded { depth: usize },
}

/// Groups over one list of labels. Member indices point into that list.
struct Grouping {
    groups: Vec<(String, Vec<usize>)>,
    can_merge_more: bool,
}

impl Grouping {
    fn singletons(labels: &[String]) -> Self {
        Self {
            groups: labels
                .iter()
                .enumerate()
                .map(|(i, label)| (label.clone(), vec![i]))
                .collect(),
            can_merge_more: false,
        }
    }
}

/// Read one chunk reply.
///
/// Out-of-range and already-claimed indices are skipped, so each label lands
/// in at most one group; labels no group claimed become singletons.
fn parse_grouping(reply: &Map<String, Value>, labels: &[String]) -> Grouping {
    let mut claimed = vec![false; labels.len()];
    let mut groups = Vec::new();

    let entries = reply.get("groups").and_then(Value::as_array).into_iter().flatten();
    for obj in entries.filter_map(Value::as_object) {
        let mut members = Vec::new();
        let indices = obj.get("members").and_then(Value::as_array).into_iter().flatten();
        for i in indices.filter_map(index_value) {
            if i < labels.len() && !claimed[i] {
                claimed[i] = true;
                members.push(i);
            }
        }
        let Some(&first) = members.first() else {
            continue;
        };
        let representative = string_field(obj, "representative").unwrap_or(labels[first].as_str());
        groups.push((representative.to_string(), members));
    }

    for (i, taken) in claimed.iter().enumerate() {
        if !taken {
            groups.push((labels[i].clone(), vec![i]));
        }
    }

    Grouping {
        groups,
        can_merge_more: reply
            .get("canMergeMore")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

/// Group `labels` chunk by chunk. Returned member indices are into `labels`.
///
/// `can_merge_more` is true if any chunk reported it.
async fn group_pass(
    dispatcher: &UnifiedDispatcher,
    labels: &[String],
    chunk_size: usize,
    depth: usize,
    errors: &mut Vec<String>,
) -> Result<Grouping, DispatchError> {
    let chunks: Vec<&[String]> = labels.chunks(chunk_size).collect();
    let prompts: Vec<String> = chunks
        .iter()
        .map(|chunk| format!("Remarks:\n{}", json!(chunk)))
        .collect();
    let replies = ask_json(dispatcher, GROUP_SYSTEM_PROMPT, &prompts).await?;

    let mut out = Grouping {
        groups: Vec::new(),
        can_merge_more: false,
    };
    for (index, (chunk, reply)) in chunks.iter().zip(replies).enumerate() {
        let local = match reply {
            Ok(obj) => parse_grouping(&obj, chunk),
            Err(reason) => {
                warn!(
                    depth,
                    chunk = index,
                    error = %reason,
                    "grouping chunk failed, keeping singletons"
                );
                errors.push(format!("depth {depth} chunk {index}: {reason}"));
                Grouping::singletons(chunk)
            }
        };
        let offset = index * chunk_size;
        out.can_merge_more |= local.can_merge_more;
        out.groups.extend(
            local
                .groups
                .into_iter()
                .map(|(rep, members)| (rep, members.into_iter().map(|i| i + offset).collect())),
        );
    }
    Ok(out)
}

pub(super) async fn run(
    dispatcher: &UnifiedDispatcher,
    options: &ClusterOptions,
    tips: &[String],
) -> Result<ClusterOutcome, DispatchError> {
    let chunk_size = options.chunk_size;
    let mut errors = Vec::new();
    let mut groups: Vec<TipGroup> = Vec::new();
    let mut state = State::Chunking;

    let (depth, termination) = loop {
        state = match state {
            State::Chunking => {
                let grouping = group_pass(dispatcher, tips, chunk_size, 0, &mut errors).await?;
                groups = grouping
                    .groups
                    .into_iter()
                    .map(|(rep, members)| {
                        TipGroup::new(rep, members.into_iter().map(|i| tips[i].clone()).collect())
                    })
                    .collect();
                info!(tips = tips.len(), groups = groups.len(), "initial grouping done");

                if tips.len() <= chunk_size {
                    State::Converged {
                        depth: 0,
                        reason: Termination::FitsInChunk,
                    }
                } else if options.max_depth == 0 {
                    State::DepthExceeded { depth: 0 }
                } else {
                    State::Merging { depth: 1 }
                }
            }
            State::Merging { depth } => {
                let labels: Vec<String> = groups.iter().map(|g| g.representative.clone()).collect();
                let grouping =
                    group_pass(dispatcher, &labels, chunk_size, depth, &mut errors).await?;

                // Each previous group is consumed by exactly one new group.
                let before = groups.len();
                let mut previous: Vec<Option<TipGroup>> =
                    std::mem::take(&mut groups).into_iter().map(Some).collect();
                for (rep, members) in grouping.groups {
                    let mut merged = TipGroup::new(rep, Vec::new());
                    for i in members {
                        if let Some(old) = previous[i].take() {
                            merged.absorb(old);
                        }
                    }
                    groups.push(merged);
                }
                let after = groups.len();
                debug!(
                    depth,
                    before,
                    after,
                    can_merge_more = grouping.can_merge_more,
                    "merge pass done"
                );

                if !grouping.can_merge_more {
                    State::Converged {
                        depth,
                        reason: Termination::ModelConverged,
                    }
                } else if after >= before {
                    State::Converged {
                        depth,
                        reason: Termination::NoProgress,
                    }
                } else if after <= chunk_size {
                    State::Converged {
                        depth,
                        reason: Termination::FitsInChunk,
                    }
                } else if depth >= options.max_depth {
                    State::DepthExceeded { depth }
                } else {
                    State::Merging { depth: depth + 1 }
                }
            }
            State::Converged { depth, reason } => break (depth, reason),
            State::DepthExceeded { depth } => {
                warn!(depth, groups = groups.len(), "merge depth limit reached");
                break (depth, Termination::DepthExceeded);
            }
        };
    };

    sort_groups(&mut groups);
    info!(
        groups = groups.len(),
        depth,
        termination = ?termination,
        "recursive clustering finished"
    );

    Ok(ClusterOutcome {
        success: errors.is_empty(),
        groups,
        errors,
        depth,
        termination: Some(termination),
        assignments: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pickr_core::{BackendKind, ChatMessage};

    use super::*;
    use crate::backend::{ChatBackend, ScriptedBackend};
    use crate::cluster::{ClusterStrategy, HierarchicalClusterer};

    async fn ready(backend: Arc<dyn ChatBackend>) -> UnifiedDispatcher {
        let d = UnifiedDispatcher::new(None, Some(backend)).with_preference(BackendKind::Local);
        d.ensure_ready().await.unwrap();
        d
    }

    fn options(chunk_size: usize, max_depth: usize) -> ClusterOptions {
        ClusterOptions {
            strategy: ClusterStrategy::Recursive,
            chunk_size,
            max_depth,
            ..ClusterOptions::default()
        }
    }

    fn labels_in(messages: &[ChatMessage]) -> Vec<String> {
        let user = &messages[messages.len() - 1].content;
        serde_json::from_str(&user[user.find('[').unwrap()..]).unwrap()
    }

    /// Groups a whole chunk under its first label.
    fn merge_all(can_merge_more: bool) -> impl Fn(&[ChatMessage]) -> Option<String> {
        move |messages| {
            let labels = labels_in(messages);
            let members: Vec<usize> = (0..labels.len()).collect();
            Some(
                json!({
                    "groups": [{"representative": labels[0], "members": members}],
                    "canMergeMore": can_merge_more,
                })
                .to_string(),
            )
        }
    }

    fn tips(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("tip {i}")).collect()
    }

    fn total(outcome: &ClusterOutcome) -> usize {
        outcome.groups.iter().map(|g| g.count).sum()
    }

    #[test]
    fn parse_grouping_claims_each_index_once() {
        let labels: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let reply = json!({
            "groups": [
                {"representative": "ab", "members": [0, 1, 1, 9]},
                {"representative": "dup", "members": [1]},
                {"members": ["2"]},
            ],
            "canMergeMore": true,
        });
        let grouping = parse_grouping(reply.as_object().unwrap(), &labels);

        assert!(grouping.can_merge_more);
        assert_eq!(
            grouping.groups,
            vec![
                ("ab".to_string(), vec![0, 1]),
                ("c".to_string(), vec![2]),
                ("d".to_string(), vec![3]),
            ]
        );
    }

    #[tokio::test]
    async fn model_convergence_stops_after_one_merge_pass() {
        // Chunking keeps six singletons; the first merge pass says it is done.
        let backend = ScriptedBackend::new(BackendKind::Local)
            .with_reply(r#"{"groups": [], "canMergeMore": true}"#)
            .with_reply(r#"{"groups": [], "canMergeMore": true}"#)
            .with_reply(r#"{"groups": [], "canMergeMore": true}"#)
            .with_responder(merge_all(false));
        let backend = Arc::new(backend);
        let d = ready(backend.clone()).await;

        let outcome = HierarchicalClusterer::new(&d)
            .with_options(options(2, 5))
            .cluster(&tips(6))
            .await
            .unwrap();

        assert_eq!(outcome.depth, 1);
        assert_eq!(outcome.termination, Some(Termination::ModelConverged));
        assert_eq!(outcome.groups.len(), 3);
        assert_eq!(total(&outcome), 6);
        assert_eq!(backend.call_count(), 6);
    }

    #[tokio::test]
    async fn stops_once_groups_fit_in_one_chunk() {
        let backend =
            Arc::new(ScriptedBackend::new(BackendKind::Local).with_responder(merge_all(true)));
        let d = ready(backend.clone()).await;

        let outcome = HierarchicalClusterer::new(&d)
            .with_options(options(2, 5))
            .cluster(&tips(8))
            .await
            .unwrap();

        // 8 tips -> 4 groups -> 2 groups; no further pass once 2 <= chunk_size.
        assert_eq!(outcome.depth, 1);
        assert_eq!(outcome.termination, Some(Termination::FitsInChunk));
        assert_eq!(outcome.groups.len(), 2);
        assert!(outcome.groups.iter().all(|g| g.count == 4));
        assert_eq!(total(&outcome), 8);
        assert_eq!(backend.call_count(), 6);
    }

    #[tokio::test]
    async fn depth_limit_bounds_the_loop() {
        let d = ready(Arc::new(
            ScriptedBackend::new(BackendKind::Local).with_responder(merge_all(true)),
        ))
        .await;

        // 16 tips -> 8 groups -> 4 groups, still above chunk_size at the limit.
        let outcome = HierarchicalClusterer::new(&d)
            .with_options(options(2, 1))
            .cluster(&tips(16))
            .await
            .unwrap();

        assert_eq!(outcome.depth, 1);
        assert_eq!(outcome.termination, Some(Termination::DepthExceeded));
        assert_eq!(outcome.groups.len(), 4);
        assert_eq!(total(&outcome), 16);
    }

    #[tokio::test]
    async fn unchanged_group_count_is_no_progress() {
        let d = ready(Arc::new(
            ScriptedBackend::new(BackendKind::Local)
                .with_responder(|_| Some(r#"{"groups": [], "canMergeMore": true}"#.to_string())),
        ))
        .await;

        let outcome = HierarchicalClusterer::new(&d)
            .with_options(options(2, 5))
            .cluster(&tips(4))
            .await
            .unwrap();

        assert_eq!(outcome.depth, 1);
        assert_eq!(outcome.termination, Some(Termination::NoProgress));
        assert_eq!(outcome.groups.len(), 4);
    }

    #[tokio::test]
    async fn failed_chunks_keep_every_tip() {
        let backend = ScriptedBackend::new(BackendKind::Local)
            .with_failure("timeout")
            .with_responder(merge_all(false));
        let d = ready(Arc::new(backend)).await;
        let input = vec![
            "친절해요".to_string(),
            "친절해요".to_string(),
            "맛있어요".to_string(),
            "양이 많아요".to_string(),
        ];

        let outcome = HierarchicalClusterer::new(&d)
            .with_options(options(2, 5))
            .cluster(&input)
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(total(&outcome), 4);
        let mut all: Vec<String> = outcome
            .groups
            .iter()
            .flat_map(|g| g.original_tips.clone())
            .collect();
        all.sort();
        let mut expected = input.clone();
        expected.sort();
        assert_eq!(all, expected);
    }
}
