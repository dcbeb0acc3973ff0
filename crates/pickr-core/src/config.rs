//! Backend configuration, loaded once per service instance.

use std::fmt;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Which execution environment serves model calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cloud,
    Local,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::Local => "local",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::Cloud => Self::Local,
            Self::Local => Self::Cloud,
        }
    }

    /// Items per classification request, sized to backend throughput.
    pub fn default_batch_size(&self) -> usize {
        match self {
            Self::Cloud => 30,
            Self::Local => 10,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cloud" => Ok(Self::Cloud),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown backend {other:?} (expected cloud or local)")),
        }
    }
}

/// Remote, metered backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Maximum requests in flight within one batch.
    pub parallelism: usize,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            host: "https://ollama.com".to_string(),
            api_key: String::new(),
            model: "gpt-oss:120b".to_string(),
            timeout_secs: 120,
            parallelism: 8,
        }
    }
}

/// On-premises backend; requests run one at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "gemma3:4b".to_string(),
            timeout_secs: 300,
        }
    }
}

/// Both backends plus the preferred one. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub cloud: Option<CloudConfig>,
    #[serde(default)]
    pub local: Option<LocalConfig>,
    #[serde(default = "default_prefer")]
    pub prefer: BackendKind,
}

fn default_prefer() -> BackendKind {
    BackendKind::Cloud
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            cloud: None,
            local: Some(LocalConfig::default()),
            prefer: BackendKind::Cloud,
        }
    }
}

impl BackendConfig {
    /// Load from a JSON file shaped like the serialised struct.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading backend config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing backend config {}", path.display()))?;
        anyhow::ensure!(
            config.cloud.is_some() || config.local.is_some(),
            "backend config {} defines neither cloud nor local",
            path.display()
        );
        if let Some(cloud) = &config.cloud {
            anyhow::ensure!(cloud.parallelism > 0, "cloud parallelism must be at least 1");
        }
        tracing::debug!(
            cloud = config.cloud.is_some(),
            local = config.local.is_some(),
            prefer = %config.prefer,
            "loaded backend config"
        );
        Ok(config)
    }
}
