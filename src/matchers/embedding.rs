//! Embedding tier: nearest alias by cosine similarity.
//!
//! Every alias in the schema is embedded once, lazily, on first use. Each
//! header is then embedded and assigned the owner of its most similar alias
//! when that similarity clears the configured threshold.

use super::{MappingTier, TierProposal};
use crate::loader::RawTable;
use crate::schema::{CanonicalSchema, Mapping};
use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Turns text into fixed-width vectors. Implementations must be
/// deterministic for a given model.
#[async_trait::async_trait]
pub trait EmbeddingEncoder: Send + Sync {
    fn name(&self) -> &str;
    async fn encode(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

// ============================================================================
// Sidecar encoder
// ============================================================================

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Sentence-embedding model served over HTTP (`POST {url}/embed`).
pub struct SidecarEncoder {
    url: String,
    client: reqwest::Client,
}

impl SidecarEncoder {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait::async_trait]
impl EmbeddingEncoder for SidecarEncoder {
    fn name(&self) -> &str {
        "sidecar"
    }

    async fn encode(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(format!("{}/embed", self.url))
            .json(&EmbedRequest { texts })
            .send()
            .await
            .context("Failed to reach embedding sidecar")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding sidecar error ({}): {}", status, error_text);
        }

        let body: EmbedResponse = response.json().await?;
        if body.embeddings.len() != texts.len() {
            anyhow::bail!(
                "Embedding sidecar returned {} vectors for {} texts",
                body.embeddings.len(),
                texts.len()
            );
        }
        Ok(body.embeddings)
    }
}

// ============================================================================
// Local hashed n-gram encoder
// ============================================================================

const TOKEN_PATTERN: &str = r"[a-z0-9]+";

/// Feature-hashing encoder over word tokens and character trigrams.
///
/// Needs no model download, so it is what runs when no sidecar is configured.
/// Vectors are L2-normalized.
pub struct HashedNgramEncoder {
    dims: usize,
    token_re: Regex,
}

impl HashedNgramEncoder {
    pub const DEFAULT_DIMS: usize = 512;

    pub fn new(dims: usize) -> anyhow::Result<Self> {
        if dims == 0 {
            anyhow::bail!("Embedding dimension must be positive");
        }
        Ok(Self {
            dims,
            token_re: Regex::new(TOKEN_PATTERN)?,
        })
    }

    fn bucket(&self, tag: u8, feature: &str) -> usize {
        // FNV-1a keeps buckets stable across builds and platforms.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in std::iter::once(tag).chain(feature.bytes()) {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        (hash % self.dims as u64) as usize
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let lowered = text.to_lowercase();
        let mut vector = vec![0f32; self.dims];

        for token in self.token_re.find_iter(&lowered) {
            let token = token.as_str();
            vector[self.bucket(b'w', token)] += 1.0;

            let padded: Vec<char> = format!("#{}#", token).chars().collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                vector[self.bucket(b'g', &gram)] += 1.0;
            }
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait::async_trait]
impl EmbeddingEncoder for HashedNgramEncoder {
    fn name(&self) -> &str {
        "hashed-ngram"
    }

    async fn encode(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }
}

/// Cosine similarity; zero when either vector is empty or the widths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

// ============================================================================
// Tier
// ============================================================================

struct AliasIndex {
    owners: Vec<String>,
    vectors: Vec<Vec<f32>>,
}

pub struct EmbeddingTier {
    schema: Arc<CanonicalSchema>,
    encoder: Arc<dyn EmbeddingEncoder>,
    threshold: f32,
    index: OnceCell<AliasIndex>,
}

impl EmbeddingTier {
    pub fn new(schema: Arc<CanonicalSchema>, encoder: Arc<dyn EmbeddingEncoder>, threshold: f32) -> Self {
        Self {
            schema,
            encoder,
            threshold,
            index: OnceCell::new(),
        }
    }

    async fn index(&self) -> anyhow::Result<&AliasIndex> {
        self.index
            .get_or_try_init(|| async {
                let (aliases, owners): (Vec<String>, Vec<String>) = self
                    .schema
                    .alias_table()
                    .map(|(alias, owner)| (alias.to_string(), owner.to_string()))
                    .unzip();
                let vectors = self.encoder.encode(&aliases).await?;
                if vectors.len() != aliases.len() {
                    anyhow::bail!("Encoder returned {} vectors for {} aliases", vectors.len(), aliases.len());
                }
                info!(
                    "Embedding tier: indexed {} aliases with {}",
                    aliases.len(),
                    self.encoder.name()
                );
                Ok(AliasIndex { owners, vectors })
            })
            .await
    }
}

#[async_trait::async_trait]
impl MappingTier for EmbeddingTier {
    fn name(&self) -> &str {
        "embedding"
    }

    async fn propose(&self, table: &RawTable) -> anyhow::Result<TierProposal> {
        let index = self.index().await?;
        let mut proposal = TierProposal::default();
        if table.headers.is_empty() {
            return Ok(proposal);
        }

        let lowered: Vec<String> = table.headers.iter().map(|h| h.to_lowercase()).collect();
        let header_vectors = self.encoder.encode(&lowered).await?;
        if header_vectors.len() != table.headers.len() {
            anyhow::bail!(
                "Encoder returned {} vectors for {} headers",
                header_vectors.len(),
                table.headers.len()
            );
        }

        let mut matched = Mapping::new();
        for (header, vector) in table.headers.iter().zip(&header_vectors) {
            let mut best: Option<(usize, f32)> = None;
            for (i, alias_vector) in index.vectors.iter().enumerate() {
                let score = cosine_similarity(vector, alias_vector);
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some((i, score));
                }
            }

            match best {
                Some((i, score)) if score >= self.threshold => {
                    debug!("Embedding: '{}' -> '{}' ({:.3})", header, index.owners[i], score);
                    matched.insert(header.clone(), index.owners[i].clone());
                }
                _ => proposal.unmatched.push(header.clone()),
            }
        }
        proposal.matched = matched;
        Ok(proposal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(headers: &[&str]) -> RawTable {
        RawTable {
            name: "t".to_string(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    fn tier(threshold: f32) -> EmbeddingTier {
        let encoder = HashedNgramEncoder::new(HashedNgramEncoder::DEFAULT_DIMS).unwrap();
        EmbeddingTier::new(Arc::new(CanonicalSchema::cricket()), Arc::new(encoder), threshold)
    }

    #[test]
    fn test_encoder_is_normalized_and_deterministic() {
        let encoder = HashedNgramEncoder::new(64).unwrap();
        let a = encoder.embed("Total Runs");
        let b = encoder.embed("total runs");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(encoder.embed("  --  ").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_cosine_similarity_edges() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_aliases_map_to_their_owner() {
        let proposal = tier(0.75)
            .propose(&table(&["player_name", "wickets_taken", "hs"]))
            .await
            .unwrap();
        assert_eq!(proposal.matched.get("player_name"), Some("Player Name"));
        assert_eq!(proposal.matched.get("wickets_taken"), Some("Wickets"));
        assert_eq!(proposal.matched.get("hs"), Some("Highest Score"));
    }

    #[tokio::test]
    async fn test_below_threshold_is_unmatched() {
        let proposal = tier(0.75)
            .propose(&table(&["stadium_capacity"]))
            .await
            .unwrap();
        assert!(proposal.matched.is_empty());
        assert_eq!(proposal.unmatched, vec!["stadium_capacity".to_string()]);
    }

    #[tokio::test]
    async fn test_canonical_names_match_themselves() {
        let schema = CanonicalSchema::cricket();
        let headers: Vec<&str> = schema.field_names().collect();
        let proposal = tier(0.99).propose(&table(&headers)).await.unwrap();
        for name in schema.field_names() {
            assert_eq!(proposal.matched.get(name), Some(name));
        }
        assert!(proposal.unmatched.is_empty());
    }

    /// Remembers every batch it was asked to encode.
    struct RecordingEncoder {
        inner: HashedNgramEncoder,
        seen: std::sync::Mutex<Vec<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl EmbeddingEncoder for RecordingEncoder {
        fn name(&self) -> &str {
            "recording"
        }

        async fn encode(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.seen.lock().unwrap().push(texts.to_vec());
            self.inner.encode(texts).await
        }
    }

    #[tokio::test]
    async fn test_headers_are_lowercased_before_encoding() {
        let encoder = Arc::new(RecordingEncoder {
            inner: HashedNgramEncoder::new(64).unwrap(),
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let tier = EmbeddingTier::new(Arc::new(CanonicalSchema::cricket()), encoder.clone(), 0.75);
        tier.propose(&table(&["Player_Name", "Total Runs"])).await.unwrap();

        let seen = encoder.seen.lock().unwrap();
        // alias index first, then the headers
        assert_eq!(seen.len(), 2);
        assert!(seen[0].iter().all(|alias| *alias == alias.to_lowercase()));
        assert_eq!(seen[1], vec!["player_name".to_string(), "total runs".to_string()]);
    }

    struct FailingEncoder;

    #[async_trait::async_trait]
    impl EmbeddingEncoder for FailingEncoder {
        fn name(&self) -> &str {
            "failing"
        }

        async fn encode(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            anyhow::bail!("model unavailable")
        }
    }

    #[tokio::test]
    async fn test_encoder_failure_fails_the_tier() {
        let tier = EmbeddingTier::new(
            Arc::new(CanonicalSchema::cricket()),
            Arc::new(FailingEncoder),
            0.75,
        );
        assert!(tier.propose(&table(&["runs"])).await.is_err());
    }
}
