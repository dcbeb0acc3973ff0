//! Text summaries of pipeline results, printed with `--summary`.

use std::collections::BTreeMap;

use pickr_ai::{ClassifyOutcome, ClusterOutcome, DispatcherState, MergeOutcome, NormalizeReport};
use pickr_core::{BackendConfig, BackendKind, CategoryPath};

const MAX_LIST_ITEMS: usize = 10;

// ── Public API ──

pub fn print_status(config: &BackendConfig, state: DispatcherState, active: Option<BackendKind>) {
    println!("=== Backends ===");
    println!();
    println!("Cloud");
    match &config.cloud {
        Some(c) => {
            print_row("host", &c.host);
            print_row("model", &c.model);
            print_row("parallelism", c.parallelism);
        }
        None => print_row("configured", "no (set OLLAMA_API_KEY)"),
    }
    println!();
    println!("Local");
    match &config.local {
        Some(l) => {
            print_row("endpoint", &l.endpoint);
            print_row("model", &l.model);
        }
        None => print_row("configured", "no"),
    }
    println!();
    println!("Dispatcher");
    print_row("preferred", config.prefer);
    print_row("state", format!("{state:?}"));
    print_row("active", active.map_or("none", |k| k.as_str()));
    println!();
}

pub fn print_classify(outcome: &ClassifyOutcome) {
    println!("=== Classification ===");
    println!();
    print_row("items", outcome.categories.len());
    print_row("errors", outcome.errors.len());
    println!();
    print_path_counts(&outcome.categories);
    print_errors(&outcome.errors);
}

pub fn print_merge(outcome: &MergeOutcome) {
    println!("=== Merge ===");
    println!();
    print_row("items", outcome.merged.len());
    print_row("errors", outcome.errors.len());
    println!();
    print_path_counts(&outcome.merged);
    print_errors(&outcome.errors);
}

pub fn print_normalize(report: &NormalizeReport) {
    println!("=== Normalisation ===");
    println!();
    print_row("unique names copied", report.unique_copied);
    print_row("conflicting names merged", report.merged);
    print_row("source rows updated", report.original_updated);
    print_row("normalised rows", report.total);
    println!();
    print_errors(&report.errors);
}

pub fn print_cluster(outcome: &ClusterOutcome) {
    let tips: usize = outcome.groups.iter().map(|g| g.count).sum();
    println!("=== Clusters ===");
    println!();
    print_row("tips", tips);
    print_row("groups", outcome.groups.len());
    print_row("depth", outcome.depth);
    if let Some(t) = outcome.termination {
        print_row("stopped", format!("{t:?}"));
    }
    print_row("errors", outcome.errors.len());
    println!();

    for group in outcome.groups.iter().take(MAX_LIST_ITEMS) {
        println!("  {:>5}  {}", group.count, group.representative);
        let mut samples: Vec<&str> = Vec::new();
        for tip in &group.original_tips {
            if samples.len() == 3 {
                break;
            }
            if tip != &group.representative && !samples.contains(&tip.as_str()) {
                samples.push(tip);
            }
        }
        if !samples.is_empty() {
            println!("         e.g. {}", samples.join(" / "));
        }
    }
    if outcome.groups.len() > MAX_LIST_ITEMS {
        println!("  ... and {} more", outcome.groups.len() - MAX_LIST_ITEMS);
    }
    println!();
    print_errors(&outcome.errors);
}

// ── Helpers ──

fn print_row(name: &str, value: impl std::fmt::Display) {
    println!("  {:<26} {}", name, value);
}

/// Items per category path, most populated first.
fn print_path_counts(categories: &[CategoryPath]) {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for c in categories {
        *counts.entry(c.path.as_str()).or_default() += 1;
    }
    let mut counts: Vec<(&str, usize)> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1));

    println!("Paths ({}):", counts.len());
    for (path, n) in counts.iter().take(MAX_LIST_ITEMS) {
        println!("  {:<26} {}", path, n);
    }
    if counts.len() > MAX_LIST_ITEMS {
        println!("  ... and {} more", counts.len() - MAX_LIST_ITEMS);
    }
    println!();
}

fn print_errors(errors: &[String]) {
    if errors.is_empty() {
        return;
    }
    println!("Errors ({}):", errors.len());
    for e in errors.iter().take(MAX_LIST_ITEMS) {
        println!("  {e}");
    }
    if errors.len() > MAX_LIST_ITEMS {
        println!("  ... and {} more", errors.len() - MAX_LIST_ITEMS);
    }
    println!();
}
