//! Service configuration.
//!
//! Everything is read once from the environment (after `.env` is loaded) into
//! plain structs that are cloned into the components that need them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "google/gemini-2.0-flash-001";

/// Most sample rows ever shown to the generative tier.
pub const MAX_SAMPLE_ROWS: usize = 10;

/// One matching strategy in the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Embedding,
    Generative,
    Fuzzy,
}

impl TierKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Generative => "generative",
            Self::Fuzzy => "fuzzy",
        }
    }
}

impl FromStr for TierKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "embedding" => Ok(Self::Embedding),
            "generative" | "llm" => Ok(Self::Generative),
            "fuzzy" => Ok(Self::Fuzzy),
            other => anyhow::bail!("Unknown tier: {}. Available: embedding, generative, fuzzy", other),
        }
    }
}

/// Parse a comma-separated tier order: 1 to 3 distinct tiers.
pub fn parse_tier_order(s: &str) -> Result<Vec<TierKind>> {
    let mut order = Vec::new();
    for part in s.split(',').filter(|p| !p.trim().is_empty()) {
        let kind: TierKind = part.parse()?;
        if order.contains(&kind) {
            anyhow::bail!("Tier listed twice in order: {}", kind.as_str());
        }
        order.push(kind);
    }
    if order.is_empty() {
        anyhow::bail!("Tier order is empty");
    }
    Ok(order)
}

/// Knobs of the reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    pub tier_order: Vec<TierKind>,
    /// Minimum cosine similarity for the embedding tier.
    pub embedding_threshold: f32,
    /// Minimum string similarity for the fuzzy tier.
    pub fuzzy_cutoff: f64,
    /// Distinct canonical fields a mapping must cover for the file to be accepted.
    pub min_matched_fields: usize,
    /// Rows rendered into the generative prompt.
    pub sample_rows: usize,
    #[serde(with = "duration_secs")]
    pub tier_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tier_order: vec![TierKind::Generative, TierKind::Fuzzy],
            embedding_threshold: 0.75,
            fuzzy_cutoff: 0.7,
            min_matched_fields: 6,
            sample_rows: MAX_SAMPLE_ROWS,
            tier_timeout: Duration::from_secs(30),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub upload_dir: PathBuf,
    pub schema_path: Option<PathBuf>,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub embedding_url: Option<String>,
    pub reconcile: ReconcileConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            upload_dir: PathBuf::from("uploaded_files"),
            schema_path: None,
            openrouter_api_key: None,
            openrouter_model: DEFAULT_MODEL.to_string(),
            embedding_url: None,
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl AppConfig {
    /// Build from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut reconcile = defaults.reconcile;
        if let Some(order) = get("TIER_ORDER") {
            reconcile.tier_order = parse_tier_order(&order).context("Invalid TIER_ORDER")?;
        }
        if let Some(v) = get("EMBEDDING_THRESHOLD") {
            reconcile.embedding_threshold = parse_var("EMBEDDING_THRESHOLD", &v)?;
        }
        if let Some(v) = get("FUZZY_CUTOFF") {
            reconcile.fuzzy_cutoff = parse_var("FUZZY_CUTOFF", &v)?;
        }
        if let Some(v) = get("MIN_MATCHED_FIELDS") {
            reconcile.min_matched_fields = parse_var("MIN_MATCHED_FIELDS", &v)?;
        }
        if let Some(v) = get("SAMPLE_ROWS") {
            reconcile.sample_rows = parse_var("SAMPLE_ROWS", &v)?;
        }
        if let Some(v) = get("TIER_TIMEOUT_SECS") {
            reconcile.tier_timeout = Duration::from_secs(parse_var("TIER_TIMEOUT_SECS", &v)?);
        }

        if !(0.0..=1.0).contains(&reconcile.embedding_threshold) {
            anyhow::bail!("EMBEDDING_THRESHOLD must be within 0..=1");
        }
        if !(0.0..=1.0).contains(&reconcile.fuzzy_cutoff) {
            anyhow::bail!("FUZZY_CUTOFF must be within 0..=1");
        }
        if reconcile.sample_rows > MAX_SAMPLE_ROWS {
            anyhow::bail!("SAMPLE_ROWS must be at most {}", MAX_SAMPLE_ROWS);
        }

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            upload_dir: get("UPLOAD_DIR").map(PathBuf::from).unwrap_or(defaults.upload_dir),
            schema_path: get("SCHEMA_PATH").map(PathBuf::from),
            openrouter_api_key: get("OPENROUTER_API_KEY"),
            openrouter_model: get("OPENROUTER_MODEL").unwrap_or(defaults.openrouter_model),
            embedding_url: get("EMBEDDING_URL"),
            reconcile,
        })
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {}={}: {}", key, value, e))
}
