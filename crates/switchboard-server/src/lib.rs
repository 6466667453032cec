use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use reqwest::Client;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};
use switchboard_config::Config;
use switchboard_contracts::{
    contracts_manifest_v1, AudioSegment, ContractsMetadata, DialogueVocabulary, Entity, NluResult,
    SessionCreated, SessionList, SessionView, SynthesisRequest, SynthesisResult, TranscriptResult,
    TurnRequest, TurnResponse, Utterance, API_VERSION,
};
use switchboard_kernel::{decide, render, Action, DialogueState};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr '{}': {e}", cfg.server.listen_addr))?;
    let hops = cfg.server.hops.clone();
    let app = build_app(cfg)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind {addr}: {e}"))?;
    info!(listen_addr = %addr, hops = ?hops, "switchboard listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("server error: {e}"))
}

pub fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg)?;
    let mut app = Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/contracts", get(contracts_metadata));
    for hop in &state.cfg.server.hops {
        app = match hop.as_str() {
            "transcription" => app.route("/v1/audio-segments", post(audio_segments)),
            "understanding" => app.route("/v1/utterances", post(utterances)),
            "dialogue" => app
                .route("/v1/turns", post(turns))
                .route("/v1/sessions", post(create_session).get(list_sessions))
                .route(
                    "/v1/sessions/{session_id}",
                    get(get_session).delete(end_session),
                ),
            "synthesis" => app.route("/v1/syntheses", post(syntheses)),
            other => return Err(format!("unknown hop '{other}' in server.hops")),
        };
    }
    Ok(app.with_state(state))
}

#[derive(Clone)]
struct AppState {
    cfg: Config,
    store: Arc<SessionStore>,
    hops: HopClient,
    transcriber: Arc<dyn TranscriptionProvider>,
    recognizer: Arc<dyn UnderstandingProvider>,
    synthesizer: Arc<dyn SynthesisProvider>,
}

impl AppState {
    fn new(cfg: Config) -> Result<Self, String> {
        let store = SessionStore::open(&cfg)?;
        let hops = HopClient::new(&cfg)?;
        Ok(Self {
            store: Arc::new(store),
            hops,
            transcriber: Arc::new(PlaceholderTranscriber),
            recognizer: Arc::new(RuleRecognizer),
            synthesizer: Arc::new(PlaceholderSynthesizer),
            cfg,
        })
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn contracts_metadata(State(state): State<AppState>) -> Json<ContractsMetadata> {
    let manifest = contracts_manifest_v1();
    Json(ContractsMetadata {
        api_version: API_VERSION.to_string(),
        openapi_sha256: manifest.openapi_sha256.to_string(),
        contracts_set_sha256: manifest.contracts_set_sha256.to_string(),
        generated_at: manifest.generated_at.to_string(),
        schemas: manifest
            .schemas
            .iter()
            .map(|s| (s.path.to_string(), s.sha256.to_string()))
            .collect(),
        dialogue: DialogueVocabulary {
            hops: state.cfg.server.hops.clone(),
            intents: to_strings(&["greeting", "get_help", "get_weather", "order_drink", "goodbye"]),
            outcomes: to_strings(&[
                "greeted",
                "help_offered",
                "weather_answered",
                "asked_location",
                "still_asking_location",
                "asked_drink_name",
                "still_asking_drink_name",
                "asked_drink_size",
                "still_asking_drink_size",
                "order_confirmed",
                "farewell",
                "upstream_apology",
                "unknown_intent",
                "empty_utterance",
            ]),
            slots: to_strings(&["location", "drink_name", "drink_size"]),
        },
    })
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

async fn audio_segments(
    State(state): State<AppState>,
    Json(segment): Json<AudioSegment>,
) -> Result<Json<TranscriptResult>, (StatusCode, Json<Value>)> {
    validate_audio_segment(&segment).map_err(bad_request)?;

    let transcription = match state.transcriber.transcribe(&segment) {
        Ok(t) => t,
        Err(err) => {
            warn!(
                session_id = %segment.session_id,
                hop = "transcription",
                kind = provider_error_kind(&err),
                "transcription provider failed: {err}"
            );
            Transcription {
                transcript: String::new(),
                confidence: 0.0,
            }
        }
    };
    let result = TranscriptResult {
        session_id: segment.session_id.clone(),
        sequence_number: segment.sequence_number,
        transcript: transcription.transcript,
        is_final: segment.is_final,
        confidence: transcription.confidence,
    };
    info!(
        session_id = %result.session_id,
        hop = "transcription",
        sequence_number = result.sequence_number,
        is_final = result.is_final,
        "segment transcribed"
    );

    let downstream = Utterance {
        session_id: result.session_id.clone(),
        text: result.transcript.clone(),
    };
    state
        .hops
        .forward(
            "understanding",
            &state.cfg.downstream.understanding_addr,
            "/v1/utterances",
            &downstream,
            &result.session_id,
        )
        .await;

    Ok(Json(result))
}

async fn utterances(
    State(state): State<AppState>,
    Json(utterance): Json<Utterance>,
) -> Result<Json<NluResult>, (StatusCode, Json<Value>)> {
    validate_utterance(&utterance).map_err(bad_request)?;

    let result = match state.recognizer.analyze(&utterance.text) {
        Ok(analysis) => NluResult {
            session_id: utterance.session_id.clone(),
            intent: analysis.intent,
            intent_confidence: analysis.confidence,
            entities: analysis.entities,
            processed_text: utterance.text.trim().to_string(),
        },
        Err(err) => {
            warn!(
                session_id = %utterance.session_id,
                hop = "understanding",
                kind = provider_error_kind(&err),
                "understanding provider failed: {err}"
            );
            sentinel_nlu_result(&utterance.session_id, utterance.text.trim(), &err)
        }
    };
    info!(
        session_id = %result.session_id,
        hop = "understanding",
        intent = %result.intent,
        entities = result.entities.len(),
        "utterance analyzed"
    );

    let downstream = TurnRequest {
        session_id: result.session_id.clone(),
        nlu_result: result.clone(),
    };
    state
        .hops
        .forward(
            "dialogue",
            &state.cfg.downstream.dialogue_addr,
            "/v1/turns",
            &downstream,
            &result.session_id,
        )
        .await;

    Ok(Json(result))
}

async fn turns(
    State(state): State<AppState>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<TurnResponse>, (StatusCode, Json<Value>)> {
    validate_turn_request(&request).map_err(bad_request)?;
    let session_id = request.session_id.clone();

    let turn_lock = state.store.turn_lock(&session_id);
    let response = {
        let _guard = turn_lock.lock().await;
        let current = state.store.get_or_create(&session_id);
        let (decision, next_state) = decide(&request.nlu_result, &current);
        let response_text = render(&decision);
        match decision.action {
            Action::Terminate => state.store.clear(&session_id),
            _ => state.store.commit(&session_id, &next_state),
        }
        info!(
            session_id = %session_id,
            hop = "dialogue",
            intent = %request.nlu_result.intent,
            outcome = decision.outcome.as_str(),
            "turn decided"
        );
        TurnResponse {
            session_id: session_id.clone(),
            response_text,
            outcome: decision.outcome.as_str().to_string(),
        }
    };

    let downstream = SynthesisRequest {
        session_id: session_id.clone(),
        text: response.response_text.clone(),
        voice_profile_id: state.cfg.synthesis.default_voice.clone(),
    };
    state
        .hops
        .forward(
            "synthesis",
            &state.cfg.downstream.synthesis_addr,
            "/v1/syntheses",
            &downstream,
            &session_id,
        )
        .await;

    Ok(Json(response))
}

async fn syntheses(
    State(state): State<AppState>,
    Json(request): Json<SynthesisRequest>,
) -> Result<Json<SynthesisResult>, (StatusCode, Json<Value>)> {
    validate_synthesis_request(&request).map_err(bad_request)?;

    let voice = if request.voice_profile_id.trim().is_empty() {
        state.cfg.synthesis.default_voice.clone()
    } else {
        request.voice_profile_id.clone()
    };
    let result = match state.synthesizer.synthesize(&request, &voice) {
        Ok(r) => r,
        Err(err) => {
            warn!(
                session_id = %request.session_id,
                hop = "synthesis",
                kind = provider_error_kind(&err),
                "synthesis provider failed: {err}"
            );
            SynthesisResult {
                session_id: request.session_id.clone(),
                status_message: format!(
                    "Synthesis for session '{}' is unavailable right now.",
                    request.session_id
                ),
                audio_b64: None,
                audio_format: None,
            }
        }
    };
    info!(session_id = %result.session_id, hop = "synthesis", voice = %voice, "synthesis acknowledged");
    Ok(Json(result))
}

async fn create_session(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<SessionCreated>), (StatusCode, Json<Value>)> {
    let session_id = Uuid::new_v4().to_string();
    match state.store.create(&session_id) {
        Ok(created_at) => Ok((
            StatusCode::CREATED,
            Json(SessionCreated {
                session_id,
                created_at,
            }),
        )),
        Err(err) => Err(internal_error(err)),
    }
}

async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<SessionList>, (StatusCode, Json<Value>)> {
    match state.store.list() {
        Ok(sessions) => Ok(Json(SessionList { sessions })),
        Err(err) => Err(internal_error(err)),
    }
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, (StatusCode, Json<Value>)> {
    match state.store.get(&session_id) {
        Ok(Some(view)) => Ok(Json(view)),
        Ok(None) => Err(not_found(format!("session '{session_id}' not found"))),
        Err(err) => Err(internal_error(err)),
    }
}

async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    match state.store.remove(&session_id) {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(not_found(format!("session '{session_id}' not found"))),
        Err(err) => Err(internal_error(err)),
    }
}

fn validate_audio_segment(segment: &AudioSegment) -> Result<(), String> {
    if segment.session_id.trim().is_empty() {
        return Err("session_id is required".to_string());
    }
    if segment.audio_format.trim().is_empty() {
        return Err("audio_format is required".to_string());
    }
    if segment.decoded_audio().is_err() {
        return Err("audio_b64 is not valid base64".to_string());
    }
    Ok(())
}

fn validate_utterance(utterance: &Utterance) -> Result<(), String> {
    if utterance.session_id.trim().is_empty() {
        return Err("session_id is required".to_string());
    }
    Ok(())
}

fn validate_turn_request(request: &TurnRequest) -> Result<(), String> {
    if request.session_id.trim().is_empty() {
        return Err("session_id is required".to_string());
    }
    Ok(())
}

fn validate_synthesis_request(request: &SynthesisRequest) -> Result<(), String> {
    if request.session_id.trim().is_empty() {
        return Err("session_id is required".to_string());
    }
    Ok(())
}

fn bad_request(message: String) -> (StatusCode, Json<Value>) {
    error_body(StatusCode::BAD_REQUEST, "validation_error", message)
}

fn not_found(message: String) -> (StatusCode, Json<Value>) {
    error_body(StatusCode::NOT_FOUND, "not_found", message)
}

fn internal_error(message: String) -> (StatusCode, Json<Value>) {
    error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
}

fn error_body(status: StatusCode, code: &str, message: String) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({"error": {"code": code, "message": message}})),
    )
}

#[derive(Debug, Error)]
enum ForwardError {
    #[error("downstream call timed out")]
    Timeout,
    #[error("downstream unreachable: {0}")]
    Connect(String),
    #[error("downstream transport failed: {0}")]
    Transport(String),
    #[error("downstream rejected the call with status {0}")]
    Status(u16),
}

impl ForwardError {
    fn kind(&self) -> &'static str {
        match self {
            ForwardError::Timeout => "timeout",
            ForwardError::Connect(_) => "connect",
            ForwardError::Transport(_) => "transport",
            ForwardError::Status(_) => "status",
        }
    }
}

impl From<reqwest::Error> for ForwardError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ForwardError::Timeout
        } else if err.is_connect() {
            ForwardError::Connect(err.to_string())
        } else {
            ForwardError::Transport(err.to_string())
        }
    }
}

#[derive(Clone)]
struct HopClient {
    client: Client,
}

impl HopClient {
    fn new(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.downstream.request_timeout_ms))
            .build()
            .map_err(|e| format!("failed to build downstream client: {e}"))?;
        Ok(Self { client })
    }

    async fn forward<T: Serialize>(
        &self,
        hop: &'static str,
        base_addr: &str,
        path: &str,
        payload: &T,
        session_id: &str,
    ) {
        match self.send(base_addr, path, payload).await {
            Ok(status) => {
                info!(session_id = %session_id, hop = hop, status = status.as_u16(), "downstream hop acknowledged");
            }
            Err(err) => {
                warn!(session_id = %session_id, hop = hop, kind = err.kind(), "downstream call failed: {err}");
            }
        }
    }

    async fn send<T: Serialize>(
        &self,
        base_addr: &str,
        path: &str,
        payload: &T,
    ) -> Result<reqwest::StatusCode, ForwardError> {
        let url = format!("{}{}", base_addr.trim_end_matches('/'), path);
        let response = self.client.post(&url).json(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::Status(status.as_u16()));
        }
        Ok(status)
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    #[error("provider call failed: {0}")]
    Failed(String),
}

fn provider_error_kind(err: &ProviderError) -> &'static str {
    match err {
        ProviderError::NotConfigured(_) => "provider_unconfigured",
        ProviderError::Failed(_) => "provider_error",
    }
}

struct Transcription {
    transcript: String,
    confidence: f64,
}

trait TranscriptionProvider: Send + Sync {
    fn transcribe(&self, segment: &AudioSegment) -> Result<Transcription, ProviderError>;
}

struct PlaceholderTranscriber;

impl TranscriptionProvider for PlaceholderTranscriber {
    fn transcribe(&self, segment: &AudioSegment) -> Result<Transcription, ProviderError> {
        let mut transcript = format!(
            "Placeholder transcript for segment {} of session {}.",
            segment.sequence_number, segment.session_id
        );
        if segment.is_final {
            transcript.push_str(" (Final)");
        }
        Ok(Transcription {
            transcript,
            confidence: 0.90,
        })
    }
}

struct Analysis {
    intent: String,
    confidence: f64,
    entities: Vec<Entity>,
}

trait UnderstandingProvider: Send + Sync {
    fn analyze(&self, text: &str) -> Result<Analysis, ProviderError>;
}

const DRINK_WORDS: [&str; 7] = [
    "latte",
    "mocha",
    "espresso",
    "cappuccino",
    "americano",
    "tea",
    "coffee",
];
const SIZE_WORDS: [&str; 3] = ["small", "medium", "large"];

struct RuleRecognizer;

impl UnderstandingProvider for RuleRecognizer {
    fn analyze(&self, text: &str) -> Result<Analysis, ProviderError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Analysis {
                intent: String::new(),
                confidence: 0.0,
                entities: Vec::new(),
            });
        }
        let has = |needle: &str| {
            trimmed
                .split(|c: char| !c.is_alphanumeric())
                .any(|word| word.eq_ignore_ascii_case(needle))
        };

        if has("bye") || has("goodbye") {
            return Ok(analysis("goodbye", Vec::new()));
        }
        if has("hello") || has("hi") || has("hey") {
            return Ok(analysis("greeting", Vec::new()));
        }
        if has("help") {
            return Ok(analysis("get_help", Vec::new()));
        }
        if has("weather") {
            let mut entities = Vec::new();
            if let Some(location) = location_after_in(trimmed) {
                entities.push(entity("location", &location));
            }
            if let Some(date) = DATE_WORDS.iter().copied().find(|&w| has(w)) {
                entities.push(entity("date", date));
            }
            return Ok(analysis("get_weather", entities));
        }
        let drink = DRINK_WORDS.iter().copied().find(|&w| has(w));
        if has("order") || drink.is_some() {
            let mut entities = Vec::new();
            if let Some(name) = drink {
                entities.push(entity("drink_name", name));
            }
            if let Some(size) = SIZE_WORDS.iter().copied().find(|&w| has(w)) {
                entities.push(entity("drink_size", size));
            }
            return Ok(analysis("order_drink", entities));
        }

        Ok(Analysis {
            intent: "no_intent_matched".to_string(),
            confidence: 0.0,
            entities: Vec::new(),
        })
    }
}

const DATE_WORDS: [&str; 3] = ["today", "tomorrow", "tonight"];

fn analysis(intent: &str, entities: Vec<Entity>) -> Analysis {
    Analysis {
        intent: intent.to_string(),
        confidence: 0.9,
        entities,
    }
}

fn entity(name: &str, value: &str) -> Entity {
    Entity {
        name: name.to_string(),
        value: value.to_string(),
        confidence: 1.0,
    }
}

fn location_after_in(text: &str) -> Option<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let pos = words.iter().position(|w| w.eq_ignore_ascii_case("in"))?;
    let location: Vec<&str> = words[pos + 1..]
        .iter()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .take_while(|w| !w.is_empty() && !DATE_WORDS.contains(&w.to_ascii_lowercase().as_str()))
        .collect();
    if location.is_empty() {
        None
    } else {
        Some(location.join(" "))
    }
}

fn sentinel_nlu_result(session_id: &str, text: &str, err: &ProviderError) -> NluResult {
    let intent = match err {
        ProviderError::NotConfigured(_) => "error_provider_unavailable",
        ProviderError::Failed(_) => "error_calling_provider",
    };
    NluResult {
        session_id: session_id.to_string(),
        intent: intent.to_string(),
        intent_confidence: 0.0,
        entities: vec![entity("error_message", &err.to_string())],
        processed_text: text.to_string(),
    }
}

trait SynthesisProvider: Send + Sync {
    fn synthesize(
        &self,
        request: &SynthesisRequest,
        voice: &str,
    ) -> Result<SynthesisResult, ProviderError>;
}

struct PlaceholderSynthesizer;

impl SynthesisProvider for PlaceholderSynthesizer {
    fn synthesize(
        &self,
        request: &SynthesisRequest,
        voice: &str,
    ) -> Result<SynthesisResult, ProviderError> {
        Ok(SynthesisResult {
            session_id: request.session_id.clone(),
            status_message: format!(
                "Text for session '{}' (voice: '{}') received by TTS. Placeholder synthesis initiated.",
                request.session_id, voice
            ),
            audio_b64: None,
            audio_format: None,
        })
    }
}

#[derive(Debug, Clone)]
struct SessionRecord {
    state: DialogueState,
    created_at: String,
    updated_at: String,
}

struct SessionStore {
    turn_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    backend: StoreBackend,
}

impl SessionStore {
    fn open(cfg: &Config) -> Result<Self, String> {
        let backend = if cfg.store.kind == "sqlite" {
            let path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for the sqlite store".to_string())?;
            StoreBackend::Sqlite(SqliteStore::new(&path)?)
        } else {
            StoreBackend::Memory(MemoryStore::default())
        };
        Ok(Self {
            turn_locks: DashMap::new(),
            backend,
        })
    }

    fn turn_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        self.turn_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn get_or_create(&self, session_id: &str) -> DialogueState {
        match self.backend.load(session_id) {
            Ok(Some(record)) => record.state,
            Ok(None) => DialogueState::default(),
            Err(err) => {
                warn!(session_id = %session_id, hop = "dialogue", kind = "store", "session load failed, starting fresh: {err}");
                DialogueState::default()
            }
        }
    }

    fn commit(&self, session_id: &str, state: &DialogueState) {
        if let Err(err) = self.backend.save(session_id, state, now_rfc3339()) {
            warn!(session_id = %session_id, hop = "dialogue", kind = "store", "session persist failed, state dropped: {err}");
        }
    }

    fn clear(&self, session_id: &str) {
        if let Err(err) = self.backend.remove(session_id) {
            warn!(session_id = %session_id, hop = "dialogue", kind = "store", "session clear failed: {err}");
        }
    }

    fn create(&self, session_id: &str) -> Result<String, String> {
        let now = now_rfc3339();
        self.backend
            .save(session_id, &DialogueState::default(), now.clone())?;
        Ok(now)
    }

    fn get(&self, session_id: &str) -> Result<Option<SessionView>, String> {
        Ok(self
            .backend
            .load(session_id)?
            .map(|record| session_view(session_id, &record)))
    }

    fn list(&self) -> Result<Vec<SessionView>, String> {
        let mut sessions: Vec<SessionView> = self
            .backend
            .list()?
            .iter()
            .map(|(session_id, record)| session_view(session_id, record))
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    fn remove(&self, session_id: &str) -> Result<bool, String> {
        self.backend.remove(session_id)
    }
}

fn session_view(session_id: &str, record: &SessionRecord) -> SessionView {
    SessionView {
        session_id: session_id.to_string(),
        pending_question: record
            .state
            .pending_question
            .map(|slot| slot.as_str().to_string()),
        pending_slots: record.state.pending_slots.clone(),
        last_intent: record.state.last_intent.clone(),
        created_at: record.created_at.clone(),
        updated_at: record.updated_at.clone(),
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl StoreBackend {
    fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, String> {
        match self {
            StoreBackend::Memory(store) => {
                Ok(store.sessions.get(session_id).map(|r| r.value().clone()))
            }
            StoreBackend::Sqlite(store) => store.load(session_id),
        }
    }

    fn save(&self, session_id: &str, state: &DialogueState, now: String) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .sessions
                    .entry(session_id.to_string())
                    .and_modify(|record| {
                        record.state = state.clone();
                        record.updated_at = now.clone();
                    })
                    .or_insert_with(|| SessionRecord {
                        state: state.clone(),
                        created_at: now.clone(),
                        updated_at: now.clone(),
                    });
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.save(session_id, state, &now),
        }
    }

    fn remove(&self, session_id: &str) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.sessions.remove(session_id).is_some()),
            StoreBackend::Sqlite(store) => store.remove(session_id),
        }
    }

    fn list(&self) -> Result<Vec<(String, SessionRecord)>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .sessions
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect()),
            StoreBackend::Sqlite(store) => store.list(),
        }
    }
}

#[derive(Default)]
struct MemoryStore {
    sessions: DashMap<String, SessionRecord>,
}

struct SqliteStore {
    conn: StdMutex<Connection>,
}

impl SqliteStore {
    fn new(path: &str) -> Result<Self, String> {
        let conn =
            Connection::open(path).map_err(|e| format!("failed to open sqlite store: {e}"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                state_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .map_err(|e| format!("failed to initialize sqlite store: {e}"))?;
        Ok(Self {
            conn: StdMutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, String> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT state_json, created_at, updated_at FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| e.to_string())?;
        match row {
            Some((state_json, created_at, updated_at)) => {
                let state = serde_json::from_str(&state_json)
                    .map_err(|e| format!("corrupt session state: {e}"))?;
                Ok(Some(SessionRecord {
                    state,
                    created_at,
                    updated_at,
                }))
            }
            None => Ok(None),
        }
    }

    fn save(&self, session_id: &str, state: &DialogueState, now: &str) -> Result<(), String> {
        let state_json = serde_json::to_string(state).map_err(|e| e.to_string())?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (session_id, state_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(session_id) DO UPDATE SET
                 state_json = excluded.state_json,
                 updated_at = excluded.updated_at",
            params![session_id, state_json, now],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn remove(&self, session_id: &str) -> Result<bool, String> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "DELETE FROM sessions WHERE session_id = ?1",
                params![session_id],
            )
            .map_err(|e| e.to_string())?;
        Ok(changed > 0)
    }

    fn list(&self) -> Result<Vec<(String, SessionRecord)>, String> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT session_id, state_json, created_at, updated_at FROM sessions
                 ORDER BY session_id",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| e.to_string())?;
        let mut sessions = Vec::new();
        for row in rows {
            let (session_id, state_json, created_at, updated_at) =
                row.map_err(|e| e.to_string())?;
            let state = serde_json::from_str(&state_json)
                .map_err(|e| format!("corrupt session state: {e}"))?;
            sessions.push((
                session_id,
                SessionRecord {
                    state,
                    created_at,
                    updated_at,
                },
            ));
        }
        Ok(sessions)
    }
}
