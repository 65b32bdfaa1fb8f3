//! Reconciliation orchestrator.
//!
//! Runs the configured matching tiers in order until one answers, cleans the
//! winning proposal against the schema, and decides whether the file is
//! accepted. A tier that errors or times out is logged and skipped; running
//! out of tiers is not an error, it just leaves nothing matched.

use crate::config::{ReconcileConfig, TierKind};
use crate::loader::RawTable;
use crate::matchers::embedding::{EmbeddingEncoder, EmbeddingTier};
use crate::matchers::fuzzy::FuzzyTier;
use crate::matchers::generative::{CompletionService, GenerativeTier};
use crate::matchers::{MappingTier, TierProposal};
use crate::schema::{now_iso8601, CanonicalSchema, FileStatus, Mapping, ProcessingSummary};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Where a reconciliation pass currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconcileStage {
    Loaded,
    Tier1Attempted,
    Tier2Attempted,
    Tier3Attempted,
    Resolved,
}

impl ReconcileStage {
    fn after_attempt(self) -> Self {
        match self {
            Self::Loaded => Self::Tier1Attempted,
            Self::Tier1Attempted => Self::Tier2Attempted,
            Self::Tier2Attempted | Self::Tier3Attempted => Self::Tier3Attempted,
            Self::Resolved => Self::Resolved,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Answered,
    Failed { reason: String },
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierAttempt {
    pub tier: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// Result of one automatic pass.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub summary: ProcessingSummary,
    pub mapping: Mapping,
    pub stage: ReconcileStage,
    pub attempts: Vec<TierAttempt>,
}

pub struct Reconciler {
    schema: Arc<CanonicalSchema>,
    tiers: Vec<Arc<dyn MappingTier>>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(schema: Arc<CanonicalSchema>, tiers: Vec<Arc<dyn MappingTier>>, config: ReconcileConfig) -> Self {
        Self {
            schema,
            tiers,
            config,
        }
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    pub async fn reconcile(&self, source: &str, table: &RawTable) -> Reconciliation {
        let total = table.row_count();
        let mut stage = ReconcileStage::Loaded;
        let mut attempts = Vec::new();

        if table.headers.is_empty() {
            info!("{}: no headers, rejecting without matching", source);
            let mut summary = ProcessingSummary::rejected(source);
            summary.total_records = total;
            summary.rejected_records = total;
            return Reconciliation {
                summary,
                mapping: Mapping::new(),
                stage,
                attempts,
            };
        }

        let mut resolved: Option<(String, TierProposal)> = None;
        for tier in &self.tiers {
            stage = stage.after_attempt();
            let outcome = tokio::time::timeout(self.config.tier_timeout, tier.propose(table)).await;
            match outcome {
                Ok(Ok(proposal)) => {
                    info!(
                        "{}: tier {} answered ({} matched)",
                        source,
                        tier.name(),
                        proposal.matched.len()
                    );
                    attempts.push(TierAttempt {
                        tier: tier.name().to_string(),
                        outcome: AttemptOutcome::Answered,
                    });
                    resolved = Some((tier.name().to_string(), proposal));
                    break;
                }
                Ok(Err(e)) => {
                    warn!("{}: tier {} failed: {:#}", source, tier.name(), e);
                    attempts.push(TierAttempt {
                        tier: tier.name().to_string(),
                        outcome: AttemptOutcome::Failed {
                            reason: format!("{:#}", e),
                        },
                    });
                }
                Err(_) => {
                    warn!(
                        "{}: tier {} timed out after {:?}",
                        source,
                        tier.name(),
                        self.config.tier_timeout
                    );
                    attempts.push(TierAttempt {
                        tier: tier.name().to_string(),
                        outcome: AttemptOutcome::TimedOut,
                    });
                }
            }
        }
        stage = ReconcileStage::Resolved;

        let (resolved_by, proposal) = match resolved {
            Some((name, proposal)) => (Some(name), proposal),
            None => {
                warn!("{}: every tier failed, nothing matched", source);
                let proposal = TierProposal {
                    unmatched: table.headers.clone(),
                    ..TierProposal::default()
                };
                (None, proposal)
            }
        };

        let (mapping, unmatched) = normalize_mapping(&self.schema, &table.headers, &proposal);
        let distinct_fields = mapping.distinct_values().len();
        let accepted = if distinct_fields >= self.config.min_matched_fields {
            total
        } else {
            0
        };
        let status = if accepted > 0 {
            FileStatus::Accepted
        } else {
            FileStatus::Rejected
        };

        info!(
            "{}: {} distinct fields matched (need {}), status {:?}",
            source, distinct_fields, self.config.min_matched_fields, status
        );

        Reconciliation {
            summary: ProcessingSummary {
                source: source.to_string(),
                version: 1,
                total_records: total,
                accepted_records: accepted,
                rejected_records: total - accepted,
                matched_columns: mapping.clone(),
                unmatched_columns: unmatched,
                missing_columns: Vec::new(),
                status,
                resolved_by,
                rationale: proposal.summary,
                processed_at: now_iso8601(),
            },
            mapping,
            stage,
            attempts,
        }
    }
}

/// Clean a tier's proposal against the source headers and the schema.
///
/// Keeps only pairs whose header is a source header and whose target resolves
/// to a canonical field (aliases are resolved to their owner). When two
/// headers claim the same field the later one keeps it. The tier's unmatched
/// list is kept as given; source headers that lost their pair here are
/// appended to it.
pub fn normalize_mapping(
    schema: &CanonicalSchema,
    headers: &[String],
    proposal: &TierProposal,
) -> (Mapping, Vec<String>) {
    let mut mapping = Mapping::new();
    let mut dropped: Vec<String> = Vec::new();
    for (header, target) in proposal.matched.iter() {
        if !headers.iter().any(|h| h == header) {
            continue;
        }
        let Some(field) = schema.resolve_field(target) else {
            warn!("Dropping '{}' -> '{}': not a canonical field", header, target);
            dropped.push(header.to_string());
            continue;
        };
        if let Some(previous) = mapping.key_for(field).map(str::to_string) {
            mapping.remove(&previous);
            dropped.push(previous);
        }
        mapping.insert(header, field);
    }

    let mut unmatched = proposal.unmatched.clone();
    for header in dropped {
        if !mapping.contains_key(&header) && !unmatched.contains(&header) {
            unmatched.push(header);
        }
    }
    (mapping, unmatched)
}

/// Construct tiers in the configured order.
///
/// The generative tier needs a completion service; without one it is left out
/// of the chain. If that leaves no tier at all, fuzzy matching is used.
pub fn build_tiers(
    schema: &Arc<CanonicalSchema>,
    config: &ReconcileConfig,
    completion: Option<Arc<dyn CompletionService>>,
    encoder: Arc<dyn EmbeddingEncoder>,
) -> Vec<Arc<dyn MappingTier>> {
    let mut tiers: Vec<Arc<dyn MappingTier>> = Vec::new();
    for kind in &config.tier_order {
        match kind {
            TierKind::Embedding => tiers.push(Arc::new(EmbeddingTier::new(
                schema.clone(),
                encoder.clone(),
                config.embedding_threshold,
            ))),
            TierKind::Generative => match &completion {
                Some(service) => tiers.push(Arc::new(GenerativeTier::new(
                    schema.clone(),
                    service.clone(),
                    config.sample_rows,
                ))),
                None => warn!("Generative tier configured but OPENROUTER_API_KEY is not set; skipping it"),
            },
            TierKind::Fuzzy => tiers.push(Arc::new(FuzzyTier::new(schema.clone(), config.fuzzy_cutoff))),
        }
    }

    if tiers.is_empty() {
        warn!("No usable matching tier configured, falling back to fuzzy");
        tiers.push(Arc::new(FuzzyTier::new(schema.clone(), config.fuzzy_cutoff)));
    }
    tiers
}
