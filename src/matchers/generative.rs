//! Generative tier: asks a language model to map headers using a sample of
//! the data as context.
//!
//! The model's answer is only trusted after strict validation. Anything that
//! does not parse into the expected shape fails the tier.

use super::{render_sample, MappingTier, TierProposal};
use crate::loader::RawTable;
use crate::openrouter::{Message, OpenRouterClient};
use crate::schema::{CanonicalSchema, Mapping};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

const SYSTEM_PROMPT: &str = "You are an expert cricket data analyst. You map the column headers \
of uploaded statistics files onto a fixed schema. Respond with JSON only.";

/// Anything that can answer a structured prompt with raw text.
#[async_trait::async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

#[async_trait::async_trait]
impl CompletionService for OpenRouterClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        self.chat_structured(
            vec![Message::system(system), Message::user(prompt)],
            "column_mapping",
            response_schema(),
        )
        .await
    }
}

/// JSON schema the model is asked to follow.
fn response_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "matched_columns": {
                "type": "object",
                "additionalProperties": { "type": "string" }
            },
            "unmatched_columns": {
                "type": "array",
                "items": { "type": "string" }
            },
            "summary": { "type": "string" }
        },
        "required": ["matched_columns", "unmatched_columns", "summary"],
        "additionalProperties": false
    })
}

/// Shape the model must return. All three keys are required.
#[derive(Debug, Deserialize)]
struct MappingResponse {
    matched_columns: Mapping,
    unmatched_columns: Vec<String>,
    summary: String,
}

pub struct GenerativeTier {
    schema: Arc<CanonicalSchema>,
    service: Arc<dyn CompletionService>,
    sample_rows: usize,
}

impl GenerativeTier {
    pub fn new(schema: Arc<CanonicalSchema>, service: Arc<dyn CompletionService>, sample_rows: usize) -> Self {
        Self {
            schema,
            service,
            sample_rows,
        }
    }

    fn build_prompt(&self, table: &RawTable) -> String {
        let fields = self
            .schema
            .field_names()
            .map(|f| format!("- {}", f))
            .collect::<Vec<_>>()
            .join("\n");
        let headers = table
            .headers
            .iter()
            .map(|h| format!("\"{}\"", h.to_lowercase()))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            r#"Map each column header of the uploaded file to one of the schema fields below.

Use the sample rows to understand what each column holds, then compare header names and
values against the schema fields. Only map a column when you are confident.

## Sample data ({} rows total)
{}
## Schema fields
{}

## Column headers to map
[{}]

## Output (JSON only)
{{
  "matched_columns": {{ "<column header>": "<schema field>" }},
  "unmatched_columns": ["<column header>"],
  "summary": "<one or two sentences on how the mapping was chosen>"
}}"#,
            table.row_count(),
            render_sample(table, self.sample_rows),
            fields,
            headers
        )
    }

    /// Map model-supplied header keys back to the source spelling.
    fn to_proposal(&self, table: &RawTable, response: MappingResponse) -> TierProposal {
        let source_header = |key: &str| {
            let key = key.trim();
            table
                .headers
                .iter()
                .find(|h| h.as_str() == key)
                .or_else(|| table.headers.iter().find(|h| h.to_lowercase() == key.to_lowercase()))
                .cloned()
        };

        let mut matched = Mapping::new();
        for (key, field) in response.matched_columns.iter() {
            match source_header(key) {
                Some(header) => {
                    matched.insert(header, field);
                }
                None => debug!("Generative: dropping unknown header '{}'", key),
            }
        }

        let unmatched = response
            .unmatched_columns
            .iter()
            .map(|key| source_header(key).unwrap_or_else(|| key.clone()))
            .collect();

        TierProposal {
            matched,
            unmatched,
            summary: Some(response.summary),
        }
    }
}

#[async_trait::async_trait]
impl MappingTier for GenerativeTier {
    fn name(&self) -> &str {
        "generative"
    }

    async fn propose(&self, table: &RawTable) -> Result<TierProposal> {
        let prompt = self.build_prompt(table);
        let raw = self.service.complete(SYSTEM_PROMPT, &prompt).await?;
        if raw.trim().is_empty() {
            anyhow::bail!("Model returned an empty response");
        }

        let response: MappingResponse = parse_llm_json(&raw)?;
        info!(
            "Generative: {} matched, {} unmatched",
            response.matched_columns.len(),
            response.unmatched_columns.len()
        );
        Ok(self.to_proposal(table, response))
    }
}

/// Parse JSON from a model response, tolerating markdown code fences.
fn parse_llm_json<T: serde::de::DeserializeOwned>(response: &str) -> Result<T> {
    let json_str = if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
            .trim()
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response).trim()
    } else {
        response.trim()
    };

    let _: serde_json::Value = serde_json::from_str(json_str).context(format!(
        "Invalid JSON syntax: {}",
        &json_str.chars().take(200).collect::<String>()
    ))?;

    serde_json::from_str(json_str).context(format!(
        "JSON structure mismatch: {}",
        &json_str.chars().take(200).collect::<String>()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Returns a canned answer and records the prompt it was given.
    struct CannedService {
        answer: Result<String, String>,
        prompts: Mutex<Vec<String>>,
    }

    impl CannedService {
        fn ok(answer: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: Ok(answer.to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn err(message: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: Err(message.to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl CompletionService for CannedService {
        async fn complete(&self, _system: &str, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.answer.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn table() -> RawTable {
        RawTable {
            name: "stats.csv".to_string(),
            headers: vec!["Player".to_string(), "Mat".to_string(), "Team".to_string()],
            rows: vec![
                vec!["A. Batter".to_string(), "12".to_string(), "North".to_string()],
                vec!["B. Bowler".to_string(), "9".to_string(), "South".to_string()],
            ],
        }
    }

    fn tier(service: Arc<CannedService>) -> GenerativeTier {
        GenerativeTier::new(Arc::new(CanonicalSchema::cricket()), service, 10)
    }

    #[tokio::test]
    async fn test_valid_response_maps_back_to_source_spelling() {
        let service = CannedService::ok(
            r#"```json
{"matched_columns": {"player": "Player Name", "mat": "Matches"},
 "unmatched_columns": ["team"],
 "summary": "Names and match counts are obvious."}
```"#,
        );
        let proposal = tier(service.clone()).propose(&table()).await.unwrap();
        assert_eq!(proposal.matched.get("Player"), Some("Player Name"));
        assert_eq!(proposal.matched.get("Mat"), Some("Matches"));
        assert_eq!(proposal.unmatched, vec!["Team".to_string()]);
        assert!(proposal.summary.unwrap().contains("obvious"));

        let prompts = service.prompts.lock().unwrap();
        assert!(prompts[0].contains("\"player\", \"mat\", \"team\""));
        assert!(prompts[0].contains("| A. Batter | 12 | North |"));
        assert!(prompts[0].contains("- Best Bowling Figures"));
    }

    #[tokio::test]
    async fn test_invented_headers_are_dropped() {
        let service = CannedService::ok(
            r#"{"matched_columns": {"player": "Player Name", "wickets": "Wickets"},
                "unmatched_columns": [], "summary": ""}"#,
        );
        let proposal = tier(service).propose(&table()).await.unwrap();
        assert_eq!(proposal.matched.len(), 1);
        assert!(!proposal.matched.contains_key("wickets"));
    }

    #[tokio::test]
    async fn test_malformed_response_fails() {
        let proposal = tier(CannedService::ok("the columns are player and mat")).propose(&table()).await;
        assert!(proposal.is_err());
    }

    #[tokio::test]
    async fn test_missing_key_fails() {
        let service = CannedService::ok(r#"{"matched_columns": {"player": "Player Name"}, "summary": "x"}"#);
        assert!(tier(service).propose(&table()).await.is_err());
    }

    #[tokio::test]
    async fn test_non_string_values_fail() {
        let service = CannedService::ok(
            r#"{"matched_columns": {"player": 3}, "unmatched_columns": [], "summary": "x"}"#,
        );
        assert!(tier(service).propose(&table()).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_response_fails() {
        assert!(tier(CannedService::ok("   ")).propose(&table()).await.is_err());
    }

    #[tokio::test]
    async fn test_transport_error_fails() {
        assert!(tier(CannedService::err("connection refused")).propose(&table()).await.is_err());
    }

    #[test]
    fn test_response_schema_requires_all_keys() {
        let schema = response_schema();
        assert_eq!(schema["required"].as_array().unwrap().len(), 3);
    }
}
