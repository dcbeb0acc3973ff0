mod display;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use pickr_ai::progress::{self, ProgressReporter, ProgressStream};
use pickr_ai::{
    ClassificationPipeline, ClassifyOptions, ClusterOptions, ClusterStrategy, FairBatchScheduler,
    HierarchicalClusterer, MergeEngine, MergeOptions, UnifiedDispatcher,
};
use pickr_core::{BackendConfig, BackendKind, CategoryPath, CloudConfig, LocalConfig};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pickr", version, about = "Classify, merge, and cluster labels with LLM backends")]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    /// Print a text summary instead of JSON.
    #[arg(long, global = true)]
    summary: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct BackendArgs {
    /// Backend config JSON; overrides every other backend flag.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "PICKR_CLOUD_HOST")]
    cloud_host: Option<String>,

    /// Cloud API key. The cloud backend is only configured when this is set.
    #[arg(long, global = true, env = "OLLAMA_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, global = true, env = "PICKR_CLOUD_MODEL")]
    cloud_model: Option<String>,

    /// Cloud requests in flight within one batch.
    #[arg(long, global = true, env = "PICKR_PARALLELISM")]
    parallelism: Option<usize>,

    #[arg(long, global = true, env = "PICKR_LOCAL_ENDPOINT")]
    local_endpoint: Option<String>,

    #[arg(long, global = true, env = "PICKR_LOCAL_MODEL")]
    local_model: Option<String>,

    /// Backend to try first: cloud or local.
    #[arg(long, global = true, env = "PICKR_PREFER")]
    prefer: Option<BackendKind>,
}

#[derive(Subcommand)]
enum Command {
    /// Health-check the configured backends and show which one is active.
    Status,
    /// Classify items (one per line) into category paths.
    Classify {
        /// Item list; reads stdin when omitted.
        input: Option<PathBuf>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long, default_value = pickr_ai::classify::DEFAULT_ROOT_LABEL)]
        root: String,
        #[arg(long, default_value = pickr_ai::classify::DEFAULT_FALLBACK_LABEL)]
        fallback: String,
    },
    /// Reconcile two or more classification passes into one path per item.
    Merge {
        /// Pass files: `classify` output or a JSON object of item → path.
        #[arg(required = true, num_args = 2..)]
        passes: Vec<PathBuf>,
        #[arg(long, default_value_t = MergeOptions::default().batch_size)]
        batch_size: usize,
    },
    /// Normalise the labels table of a DuckDB database in place.
    #[cfg(feature = "duckdb")]
    Normalize {
        #[arg(long)]
        db: PathBuf,
        /// Replace the source table with this Parquet file first.
        #[arg(long)]
        parquet: Option<PathBuf>,
        #[arg(long, default_value_t = MergeOptions::default().batch_size)]
        batch_size: usize,
    },
    /// Group free-text tips (one per line) under representative labels.
    Cluster {
        /// Tip list; reads stdin when omitted.
        input: Option<PathBuf>,
        #[arg(long, default_value_t = ClusterStrategy::default())]
        strategy: ClusterStrategy,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        max_depth: Option<usize>,
        #[arg(long)]
        max_dedupe_rounds: Option<usize>,
    },
}

impl BackendArgs {
    fn to_config(&self) -> Result<BackendConfig> {
        if let Some(path) = &self.config {
            return BackendConfig::from_json_file(path);
        }

        let cloud = self.api_key.as_ref().filter(|k| !k.trim().is_empty()).map(|key| {
            let defaults = CloudConfig::default();
            CloudConfig {
                host: self.cloud_host.clone().unwrap_or(defaults.host),
                api_key: key.clone(),
                model: self.cloud_model.clone().unwrap_or(defaults.model),
                parallelism: self.parallelism.unwrap_or(defaults.parallelism),
                timeout_secs: defaults.timeout_secs,
            }
        });
        if let Some(c) = &cloud {
            anyhow::ensure!(c.parallelism > 0, "--parallelism must be at least 1");
        }

        let defaults = LocalConfig::default();
        let local = LocalConfig {
            endpoint: self.local_endpoint.clone().unwrap_or(defaults.endpoint),
            model: self.local_model.clone().unwrap_or(defaults.model),
            timeout_secs: defaults.timeout_secs,
        };

        Ok(BackendConfig {
            cloud,
            local: Some(local),
            prefer: self.prefer.unwrap_or(BackendKind::Cloud),
        })
    }
}

/// Prints progress events to stderr while a pipeline runs.
struct ProgressPrinter {
    reporter: ProgressReporter,
    task: JoinHandle<()>,
}

impl ProgressPrinter {
    fn start(label: &'static str) -> Self {
        let (reporter, stream) = progress::channel();
        let task = tokio::spawn(print_progress(label, stream));
        Self { reporter, task }
    }

    fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    async fn finish(self) -> Result<()> {
        drop(self.reporter);
        self.task.await.context("progress printer panicked")
    }
}

async fn print_progress(label: &str, mut stream: ProgressStream) {
    let mut printed = false;
    while let Some(p) = stream.next().await {
        eprint!("\r  {label}: {}/{}", p.completed, p.total);
        printed = true;
    }
    if printed {
        eprintln!();
    }
}

/// One line per item, trimmed; blank lines are skipped.
fn parse_items(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_items(path: Option<&Path>) -> Result<Vec<String>> {
    let text = match path {
        Some(p) => std::fs::read_to_string(p)
            .with_context(|| format!("reading {}", p.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading stdin")?;
            buf
        }
    };
    Ok(parse_items(&text))
}

/// A merge input: either saved `classify` output or a plain item → path map.
#[derive(Deserialize)]
#[serde(untagged)]
enum PassFile {
    Outcome { categories: Vec<CategoryPath> },
    Map(BTreeMap<String, String>),
}

impl PassFile {
    fn into_map(self) -> BTreeMap<String, String> {
        match self {
            Self::Outcome { categories } => {
                categories.into_iter().map(|c| (c.item, c.path)).collect()
            }
            Self::Map(map) => map,
        }
    }
}

fn read_pass(path: &Path) -> Result<BTreeMap<String, String>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let pass: PassFile = serde_json::from_str(&text)
        .with_context(|| format!("parsing classification pass {}", path.display()))?;
    Ok(pass.into_map())
}

fn emit<T: Serialize>(value: &T, summary: bool, print: fn(&T)) -> Result<()> {
    if summary {
        print(value);
    } else {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.backend.to_config()?;
    let scheduler = Arc::new(FairBatchScheduler::new());
    let dispatcher =
        UnifiedDispatcher::from_config(&config, scheduler).context("building model backends")?;

    if let Command::Status = cli.command {
        let ready = dispatcher.ensure_ready().await;
        display::print_status(&config, dispatcher.state(), ready.as_ref().ok().copied());
        ready.context("no model backend is available")?;
        return Ok(());
    }

    let active = dispatcher
        .ensure_ready()
        .await
        .context("no model backend is available")?;
    info!(backend = %active, "pickr v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Status => {}
        Command::Classify {
            input,
            batch_size,
            root,
            fallback,
        } => {
            let items = read_items(input.as_deref())?;
            info!(items = items.len(), "classifying");
            let pipeline = ClassificationPipeline::new(&dispatcher).with_options(ClassifyOptions {
                batch_size,
                root_label: root,
                fallback_label: fallback,
            });
            let printer = ProgressPrinter::start("classified");
            let outcome = pipeline.classify(&items, Some(printer.reporter())).await;
            printer.finish().await?;
            emit(&outcome?, cli.summary, display::print_classify)?;
        }
        Command::Merge { passes, batch_size } => {
            let passes = passes
                .iter()
                .map(|p| read_pass(p))
                .collect::<Result<Vec<_>>>()?;
            info!(passes = passes.len(), "merging");
            let engine =
                MergeEngine::new(&dispatcher).with_options(MergeOptions { batch_size });
            let printer = ProgressPrinter::start("merged");
            let outcome = engine.merge_results(&passes, Some(printer.reporter())).await;
            printer.finish().await?;
            emit(&outcome?, cli.summary, display::print_merge)?;
        }
        #[cfg(feature = "duckdb")]
        Command::Normalize {
            db,
            parquet,
            batch_size,
        } => {
            let store = pickr_store::DuckLabelStore::open_persistent(&db)
                .with_context(|| format!("opening {}", db.display()))?;
            if let Some(path) = parquet {
                let rows = store.load_source_parquet(&path)?;
                info!(rows, path = %path.display(), "loaded source labels");
            }
            let pipeline = pickr_ai::NormalizationPipeline::new(&store, &dispatcher)
                .with_merge_options(MergeOptions { batch_size });
            let printer = ProgressPrinter::start("normalised");
            let report = pipeline.normalize(Some(printer.reporter())).await;
            printer.finish().await?;
            emit(&report?, cli.summary, display::print_normalize)?;
        }
        Command::Cluster {
            input,
            strategy,
            chunk_size,
            max_depth,
            max_dedupe_rounds,
        } => {
            let tips = read_items(input.as_deref())?;
            let defaults = ClusterOptions::default();
            let options = ClusterOptions {
                strategy,
                chunk_size: chunk_size.unwrap_or(defaults.chunk_size),
                max_depth: max_depth.unwrap_or(defaults.max_depth),
                max_dedupe_rounds: max_dedupe_rounds.unwrap_or(defaults.max_dedupe_rounds),
            };
            info!(tips = tips.len(), strategy = %options.strategy, "clustering");
            let outcome = HierarchicalClusterer::new(&dispatcher)
                .with_options(options)
                .cluster(&tips)
                .await?;
            emit(&outcome, cli.summary, display::print_cluster)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn args() -> BackendArgs {
        BackendArgs {
            config: None,
            cloud_host: None,
            api_key: None,
            cloud_model: None,
            parallelism: None,
            local_endpoint: None,
            local_model: None,
            prefer: None,
        }
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn merge_needs_two_passes() {
        assert!(Cli::try_parse_from(["pickr", "merge", "a.json"]).is_err());
        assert!(Cli::try_parse_from(["pickr", "merge", "a.json", "b.json"]).is_ok());
    }

    #[test]
    fn cluster_strategy_flag_parses() {
        let cli = Cli::try_parse_from(["pickr", "cluster", "--strategy", "recursive", "tips.txt"])
            .unwrap();
        match cli.command {
            Command::Cluster { strategy, .. } => assert_eq!(strategy, ClusterStrategy::Recursive),
            _ => panic!("expected cluster"),
        }
    }

    #[test]
    fn config_without_key_is_local_only() {
        let config = args().to_config().unwrap();
        assert!(config.cloud.is_none());
        assert_eq!(config.local, Some(LocalConfig::default()));
        assert_eq!(config.prefer, BackendKind::Cloud);
    }

    #[test]
    fn config_with_key_overrides_cloud_defaults() {
        let mut a = args();
        a.api_key = Some("secret".into());
        a.cloud_model = Some("big".into());
        a.prefer = Some(BackendKind::Local);
        let config = a.to_config().unwrap();
        let cloud = config.cloud.unwrap();
        assert_eq!(cloud.api_key, "secret");
        assert_eq!(cloud.model, "big");
        assert_eq!(cloud.host, CloudConfig::default().host);
        assert_eq!(config.prefer, BackendKind::Local);
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let mut a = args();
        a.api_key = Some("secret".into());
        a.parallelism = Some(0);
        assert!(a.to_config().is_err());
    }

    #[test]
    fn items_are_trimmed_and_blank_lines_skipped() {
        assert_eq!(parse_items(" 김치 \n\n소주\n  \n"), vec!["김치", "소주"]);
    }

    #[test]
    fn pass_files_accept_outcomes_and_maps() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = dir.path().join("a.json");
        std::fs::write(
            &outcome,
            r#"{"success":true,"categories":[{"item":"김치","path":"음식 > 반찬","levels":["음식","반찬"]}],"errors":[]}"#,
        )
        .unwrap();
        let map = dir.path().join("b.json");
        std::fs::write(&map, r#"{"김치":"음식 > 김치"}"#).unwrap();

        assert_eq!(read_pass(&outcome).unwrap()["김치"], "음식 > 반찬");
        assert_eq!(read_pass(&map).unwrap()["김치"], "음식 > 김치");
        assert!(read_pass(&dir.path().join("missing.json")).is_err());
    }
}
