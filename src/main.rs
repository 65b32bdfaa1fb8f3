//! Stats Ingest - reconciles uploaded sports statistics files onto a canonical schema.

mod analyzer;
mod config;
mod correction;
mod entities;
mod error;
mod kv_extractor;
mod loader;
mod matchers;
mod normalizer;
mod openrouter;
mod reconciler;
mod schema;
mod store;

use analyzer::Analyzer;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use config::{AppConfig, ReconcileConfig};
use entities::PlayerStats;
use error::ProcessingError;
use matchers::embedding::{EmbeddingEncoder, HashedNgramEncoder, SidecarEncoder};
use matchers::generative::CompletionService;
use openrouter::OpenRouterClient;
use reconciler::{build_tiers, Reconciler, TierAttempt};
use schema::{CanonicalField, CanonicalRecord, CanonicalSchema, Mapping, ProcessingSummary};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use store::{FileEntry, FileMetadata, FileStore};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<AppConfig>,
    analyzer: Arc<Analyzer>,
    store: FileStore,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "stats_ingest=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    let state = build_state(config)?;
    let bind_addr = state.config.bind_addr.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_state(config: AppConfig) -> anyhow::Result<AppState> {
    let schema = match &config.schema_path {
        Some(path) => CanonicalSchema::load(path)?,
        None => CanonicalSchema::cricket(),
    };
    info!(
        "Canonical schema: {} fields, {} aliases",
        schema.len(),
        schema.alias_count()
    );
    let schema = Arc::new(schema);

    let completion: Option<Arc<dyn CompletionService>> = match &config.openrouter_api_key {
        Some(key) => {
            let client = OpenRouterClient::new(key.clone(), config.openrouter_model.clone());
            info!("OpenRouter client initialized (model: {})", client.model());
            Some(Arc::new(client))
        }
        None => None,
    };

    let encoder: Arc<dyn EmbeddingEncoder> = match &config.embedding_url {
        Some(url) => Arc::new(SidecarEncoder::new(url.clone(), reqwest::Client::new())),
        None => Arc::new(HashedNgramEncoder::new(HashedNgramEncoder::DEFAULT_DIMS)?),
    };

    let tiers = build_tiers(&schema, &config.reconcile, completion, encoder);
    let reconciler = Reconciler::new(schema.clone(), tiers, config.reconcile.clone());
    let analyzer = Analyzer::new(schema, reconciler);
    info!("Matching tiers: {:?}", analyzer.tier_names());

    Ok(AppState {
        config: Arc::new(config),
        analyzer: Arc::new(analyzer),
        store: FileStore::new(),
    })
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/schema", get(get_schema))
        .route("/config", get(get_config))
        .route("/upload", post(upload_file))
        .route("/submit-columns", post(submit_columns))
        .route("/files", get(list_files))
        .route("/files/:id", get(get_file))
        .route("/files/:id/records", get(get_records))
        .route("/files/:id/players", get(get_players))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024)) // 100MB
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

async fn get_schema(State(state): State<AppState>) -> Json<Vec<CanonicalField>> {
    Json(state.analyzer.schema().fields().to_vec())
}

#[derive(Serialize)]
struct ConfigView {
    tiers: Vec<String>,
    reconcile: ReconcileConfig,
}

async fn get_config(State(state): State<AppState>) -> Json<ConfigView> {
    Json(ConfigView {
        tiers: state
            .analyzer
            .tier_names()
            .into_iter()
            .map(str::to_string)
            .collect(),
        reconcile: state.config.reconcile.clone(),
    })
}

#[derive(Serialize)]
struct UploadResponse {
    file_id: u64,
    file_name: String,
    file_type: String,
    unique_filename: String,
    content_hash: String,
    #[serde(flatten)]
    summary: ProcessingSummary,
    attempts: Vec<TierAttempt>,
}

/// Upload a statistics file and run the automatic pass on it.
async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ProcessingError> {
    let mut filename = String::new();
    let mut file_data = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ProcessingError::InvalidRequest(format!("Multipart error: {}", e)))?
    {
        if field.name() == Some("file") {
            filename = field.file_name().unwrap_or("upload").to_string();
            file_data = field
                .bytes()
                .await
                .map_err(|e| ProcessingError::InvalidRequest(format!("Failed to read file: {}", e)))?
                .to_vec();
            break;
        }
    }

    if file_data.is_empty() {
        return Err(ProcessingError::InvalidRequest("No file uploaded".to_string()));
    }

    let ext = loader::extension_of(std::path::Path::new(&filename));
    if loader::SourceKind::from_extension(&ext).is_none() {
        record_rejection(&state.store, &filename, &ext, None, None)?;
        return Err(ProcessingError::UnsupportedType(ext));
    }

    info!("Received file: {} ({} bytes)", filename, file_data.len());

    let upload_dir = &state.config.upload_dir;
    tokio::fs::create_dir_all(upload_dir)
        .await
        .map_err(|e| ProcessingError::Io {
            path: upload_dir.clone(),
            source: e,
        })?;
    let unique_filename = format!("{}.{}", uuid::Uuid::new_v4(), ext);
    let stored_path = upload_dir.join(&unique_filename);
    tokio::fs::write(&stored_path, &file_data)
        .await
        .map_err(|e| ProcessingError::Io {
            path: stored_path.clone(),
            source: e,
        })?;
    let content_hash = format!("{:x}", Sha256::digest(&file_data));

    let analysis = match state.analyzer.analyze(&stored_path, &filename).await {
        Ok(analysis) => analysis,
        Err(e) => {
            error!("Analysis of {} failed: {}", filename, e);
            record_rejection(&state.store, &filename, &ext, Some(stored_path), Some(content_hash))?;
            return Err(e);
        }
    };

    if analysis.mapping.is_empty() {
        warn!("{}: nothing matched, recording as rejected", filename);
        let id = state
            .store
            .register(&filename, &ext, Some(stored_path), Some(content_hash));
        state.store.append(id, analysis.summary, Vec::new(), Vec::new())?;
        return Err(ProcessingError::NothingMatched(filename));
    }

    let id = state
        .store
        .register(&filename, &ext, Some(stored_path), Some(content_hash.clone()));
    let mut summary = analysis.summary;
    summary.version = state.store.append(id, summary.clone(), analysis.records, Vec::new())?;

    info!("{}: stored as file {} ({:?})", filename, id, summary.status);
    Ok(Json(UploadResponse {
        file_id: id,
        file_name: filename,
        file_type: ext,
        unique_filename,
        content_hash,
        summary,
        attempts: analysis.attempts,
    }))
}

fn record_rejection(
    store: &FileStore,
    filename: &str,
    file_type: &str,
    stored_path: Option<PathBuf>,
    content_hash: Option<String>,
) -> Result<u64, ProcessingError> {
    let id = store.register(filename, file_type, stored_path, content_hash);
    store.append(id, ProcessingSummary::rejected(filename), Vec::new(), Vec::new())?;
    Ok(id)
}

#[derive(Debug, Deserialize)]
struct SubmitColumnsRequest {
    file_id: u64,
    user_mapping: Mapping,
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    file_type: Option<String>,
}

#[derive(Serialize)]
struct SubmitColumnsResponse {
    status: &'static str,
    message: String,
    file_id: u64,
    summary: ProcessingSummary,
    players: usize,
}

/// Apply a user's column mapping to a stored file.
async fn submit_columns(
    State(state): State<AppState>,
    Json(request): Json<SubmitColumnsRequest>,
) -> Result<Json<SubmitColumnsResponse>, ProcessingError> {
    let file_id = request.file_id;
    let _guard = state.store.lock(file_id).await;

    let entry = state.store.get(file_id);
    let path = match (&request.file_path, entry.as_ref().and_then(|e| e.stored_path.clone())) {
        (Some(p), _) => resolve_upload_path(&state.config.upload_dir, p, file_id)?,
        (None, Some(p)) => p,
        (None, None) if entry.is_some() => return Err(ProcessingError::SourceUnavailable(file_id)),
        (None, None) => return Err(ProcessingError::FileNotFound(file_id)),
    };

    let source = entry
        .as_ref()
        .map(|e| e.file_name.clone())
        .unwrap_or_else(|| path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default());
    let file_type = request
        .file_type
        .clone()
        .unwrap_or_else(|| loader::extension_of(&path));
    state
        .store
        .ensure(file_id, &source, &file_type, Some(path.clone()));

    let prior = state.store.latest(file_id);
    let outcome = state
        .analyzer
        .correct(&path, &source, &request.user_mapping, prior.as_ref())?;
    let players = entities::derive_players(&outcome.records);
    let player_count = players.len();

    let mut summary = outcome.summary;
    summary.version = state
        .store
        .append(file_id, summary.clone(), outcome.records, players)?;

    info!(
        "File {}: correction stored as version {} ({:?})",
        file_id, summary.version, summary.status
    );
    Ok(Json(SubmitColumnsResponse {
        status: "success",
        message: format!("Saved {} player records", player_count),
        file_id,
        summary,
        players: player_count,
    }))
}

/// A client-supplied path must name an existing file inside the upload directory.
fn resolve_upload_path(upload_dir: &std::path::Path, requested: &str, file_id: u64) -> Result<PathBuf, ProcessingError> {
    let requested = PathBuf::from(requested);
    let candidate = if requested.is_absolute() {
        requested
    } else if requested.starts_with(upload_dir) {
        requested
    } else {
        upload_dir.join(requested)
    };

    let root = upload_dir
        .canonicalize()
        .map_err(|_| ProcessingError::SourceUnavailable(file_id))?;
    let resolved = candidate
        .canonicalize()
        .map_err(|_| ProcessingError::SourceUnavailable(file_id))?;
    if !resolved.starts_with(&root) {
        return Err(ProcessingError::InvalidRequest(format!(
            "file_path must point inside {:?}",
            upload_dir
        )));
    }
    Ok(resolved)
}

async fn list_files(State(state): State<AppState>) -> Json<Vec<FileMetadata>> {
    Json(state.store.list())
}

async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<FileEntry>, ProcessingError> {
    state
        .store
        .get(id)
        .map(Json)
        .ok_or(ProcessingError::FileNotFound(id))
}

async fn get_records(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Vec<CanonicalRecord>>, ProcessingError> {
    state
        .store
        .get(id)
        .map(|e| Json(e.records))
        .ok_or(ProcessingError::FileNotFound(id))
}

async fn get_players(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Vec<PlayerStats>>, ProcessingError> {
    state
        .store
        .get(id)
        .map(|e| Json(e.players))
        .ok_or(ProcessingError::FileNotFound(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use config::TierKind;
    use tower::util::ServiceExt;

    const BOUNDARY: &str = "stats-ingest-boundary";

    fn test_state(upload_dir: &std::path::Path) -> AppState {
        let config = AppConfig {
            upload_dir: upload_dir.to_path_buf(),
            reconcile: ReconcileConfig {
                tier_order: vec![TierKind::Generative, TierKind::Fuzzy],
                ..ReconcileConfig::default()
            },
            ..AppConfig::default()
        };
        build_state(config).unwrap()
    }

    fn multipart_request(filename: &str, content: &str) -> Request<Body> {
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n{c}\r\n--{b}--\r\n",
            b = BOUNDARY,
            f = filename,
            c = content
        );
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header("content-type", format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));
        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_upload_then_correct() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let response = build_router(state.clone())
            .oneshot(multipart_request("stats.csv", "p_name,runs,mat\nA,120,10\nB,45,7\nC,0,1\n"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let upload = body_json(response).await;
        assert_eq!(upload["status"], "Rejected");
        assert_eq!(upload["total_records"], 3);
        assert_eq!(upload["accepted_records"], 0);
        assert_eq!(upload["rejected_records"], 3);
        assert_eq!(upload["matched_columns"]["p_name"], "Player Name");
        assert_eq!(upload["resolved_by"], "fuzzy");
        let file_id = upload["file_id"].as_u64().unwrap();

        let response = build_router(state.clone())
            .oneshot(json_request(
                "/submit-columns",
                serde_json::json!({
                    "file_id": file_id,
                    "user_mapping": {"p_name": "Player Name", "runs": "Total Runs", "mat": "Matches"}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let corrected = body_json(response).await;
        assert_eq!(corrected["summary"]["version"], 2);
        assert_eq!(corrected["summary"]["status"], "Accepted");
        assert_eq!(corrected["players"], 3);

        let response = build_router(state.clone())
            .oneshot(get_request(&format!("/files/{}/players", file_id)))
            .await
            .unwrap();
        let players = body_json(response).await;
        assert_eq!(players.as_array().unwrap().len(), 3);
        assert_eq!(players[0]["batting"]["total_runs"], 120);

        let response = build_router(state)
            .oneshot(get_request(&format!("/files/{}", file_id)))
            .await
            .unwrap();
        let entry = body_json(response).await;
        assert_eq!(entry["history"].as_array().unwrap().len(), 2);
        assert_eq!(entry["history"][0]["status"], "Rejected");
    }

    #[tokio::test]
    async fn test_unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let response = build_router(state.clone())
            .oneshot(multipart_request("virus.exe", "MZ"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let files = state.store.list();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].status, Some(schema::FileStatus::Rejected));
    }

    #[tokio::test]
    async fn test_nothing_matched_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let response = build_router(test_state(dir.path()))
            .oneshot(multipart_request("odd.csv", "colour,shape\nred,round\n"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_correction_for_unknown_file() {
        let dir = tempfile::tempdir().unwrap();
        let response = build_router(test_state(dir.path()))
            .oneshot(json_request(
                "/submit-columns",
                serde_json::json!({"file_id": 42, "user_mapping": {"a": "Matches"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_correction_path_must_stay_in_upload_dir() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::NamedTempFile::new().unwrap();
        let response = build_router(test_state(dir.path()))
            .oneshot(json_request(
                "/submit-columns",
                serde_json::json!({
                    "file_id": 1,
                    "user_mapping": {"a": "Matches"},
                    "file_path": outside.path().to_string_lossy()
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let response = build_router(test_state(dir.path()))
            .oneshot(get_request("/files/99/records"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
