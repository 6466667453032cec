use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const API_VERSION: &str = "1.0.0";

#[derive(Debug, Clone)]
pub struct ContractSchema {
    pub path: &'static str,
    pub sha256: &'static str,
    pub body: &'static str,
}

include!(concat!(env!("OUT_DIR"), "/generated_contracts.rs"));

#[derive(Debug, Clone)]
pub struct ContractsManifest {
    pub openapi_sha256: &'static str,
    pub contracts_set_sha256: &'static str,
    pub generated_at: &'static str,
    pub schemas: &'static [ContractSchema],
}

pub fn contracts_manifest_v1() -> ContractsManifest {
    ContractsManifest {
        openapi_sha256: GENERATED_OPENAPI_SHA256,
        contracts_set_sha256: GENERATED_CONTRACTS_SET_SHA256,
        generated_at: GENERATED_AT_RFC3339,
        schemas: GENERATED_SCHEMAS,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudioSegment {
    pub session_id: String,
    pub sequence_number: u64,
    pub audio_format: String,
    pub audio_b64: String,
    pub is_final: bool,
}

impl AudioSegment {
    pub fn decoded_audio(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.audio_b64)
    }
}

pub fn encode_audio(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranscriptResult {
    pub session_id: String,
    pub sequence_number: u64,
    pub transcript: String,
    pub is_final: bool,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Utterance {
    pub session_id: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Entity {
    pub name: String,
    pub value: String,
    #[serde(default = "default_entity_confidence")]
    pub confidence: f64,
}

fn default_entity_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NluResult {
    pub session_id: String,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub intent_confidence: f64,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub processed_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TurnRequest {
    pub session_id: String,
    pub nlu_result: NluResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TurnResponse {
    pub session_id: String,
    pub response_text: String,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SynthesisRequest {
    pub session_id: String,
    pub text: String,
    #[serde(default)]
    pub voice_profile_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SynthesisResult {
    pub session_id: String,
    pub status_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionCreated {
    pub session_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionView {
    pub session_id: String,
    #[serde(default)]
    pub pending_question: Option<String>,
    #[serde(default)]
    pub pending_slots: BTreeMap<String, String>,
    #[serde(default)]
    pub last_intent: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionList {
    pub sessions: Vec<SessionView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DialogueVocabulary {
    pub hops: Vec<String>,
    pub intents: Vec<String>,
    pub outcomes: Vec<String>,
    pub slots: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContractsMetadata {
    pub api_version: String,
    pub openapi_sha256: String,
    pub contracts_set_sha256: String,
    pub generated_at: String,
    pub schemas: BTreeMap<String, String>,
    pub dialogue: DialogueVocabulary,
}
