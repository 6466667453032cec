use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use switchboard_config::{Config, Downstream, Server, Store, Synthesis, HOP_NAMES};
use switchboard_contracts::{contracts_manifest_v1, ErrorResponse};
use switchboard_server::build_app;
use tower::util::ServiceExt;

fn dead_addr() -> String {
    "http://127.0.0.1:9".to_string()
}

fn test_config() -> Config {
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
            hops: HOP_NAMES.iter().map(|h| h.to_string()).collect(),
        },
        store: Store {
            kind: "memory".to_string(),
            sqlite_path: None,
        },
        downstream: Downstream {
            understanding_addr: dead_addr(),
            dialogue_addr: dead_addr(),
            synthesis_addr: dead_addr(),
            request_timeout_ms: 250,
        },
        synthesis: Synthesis {
            default_voice: "default".to_string(),
        },
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            builder.body(Body::from(value.to_string()))
        }
        None => builder.body(Body::empty()),
    }
    .expect("request");

    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, value)
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    send(app, "POST", uri, Some(body)).await
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, "GET", uri, None).await
}

fn turn(session_id: &str, intent: &str, text: &str, entities: Value) -> Value {
    json!({
        "session_id": session_id,
        "nlu_result": {
            "session_id": session_id,
            "intent": intent,
            "intent_confidence": if intent.is_empty() { 0.0 } else { 0.9 },
            "entities": entities,
            "processed_text": text,
        }
    })
}

#[tokio::test]
async fn healthz_reports_ok() {
    let app = build_app(test_config()).expect("build app");
    let (status, body) = get(&app, "/v1/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("ok".to_string()));
}

#[tokio::test]
async fn contracts_metadata_lists_schemas_and_vocabulary() {
    let app = build_app(test_config()).expect("build app");
    let (status, body) = get(&app, "/v1/contracts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["api_version"], "1.0.0");
    assert_eq!(body["openapi_sha256"].as_str().map(str::len), Some(64));
    assert_eq!(
        body["contracts_set_sha256"].as_str().map(str::len),
        Some(64)
    );

    let schemas = body["schemas"].as_object().expect("schemas object");
    assert!(schemas.len() >= 8);
    assert!(schemas.contains_key("contracts/v1/turn_response.schema.json"));

    let outcomes = body["dialogue"]["outcomes"].as_array().expect("outcomes");
    assert!(outcomes.iter().any(|v| v == "order_confirmed"));
    let intents = body["dialogue"]["intents"].as_array().expect("intents");
    assert!(intents.iter().any(|v| v == "order_drink"));
    assert_eq!(body["dialogue"]["hops"].as_array().map(Vec::len), Some(4));
}

#[tokio::test]
async fn transcription_answers_even_when_understanding_hop_is_dead() {
    let app = build_app(test_config()).expect("build app");
    let (status, body) = post(
        &app,
        "/v1/audio-segments",
        json!({
            "session_id": "s-stt",
            "sequence_number": 3,
            "audio_format": "pcm16",
            "audio_b64": "",
            "is_final": true,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["transcript"],
        "Placeholder transcript for segment 3 of session s-stt. (Final)"
    );
    assert_eq!(body["confidence"], 0.9);
    assert_eq!(body["is_final"], true);
}

#[tokio::test]
async fn invalid_base64_audio_is_a_validation_error() {
    let app = build_app(test_config()).expect("build app");
    let (status, body) = post(
        &app,
        "/v1/audio-segments",
        json!({
            "session_id": "s-stt",
            "sequence_number": 1,
            "audio_format": "pcm16",
            "audio_b64": "!!! not base64 !!!",
            "is_final": false,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let parsed: ErrorResponse = serde_json::from_value(body).expect("typed error body");
    assert_eq!(parsed.error.code, "validation_error");
    assert!(parsed.error.message.contains("audio_b64"));
}

#[tokio::test]
async fn unknown_payload_fields_are_rejected() {
    let app = build_app(test_config()).expect("build app");
    let (status, _) = post(
        &app,
        "/v1/utterances",
        json!({"session_id": "s-nlu", "text": "hello", "mood": "cheerful"}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn utterance_analysis_survives_dead_dialogue_hop() {
    let app = build_app(test_config()).expect("build app");
    let (status, body) = post(
        &app,
        "/v1/utterances",
        json!({"session_id": "s-nlu", "text": "  what's the weather in New York tomorrow?  "}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["intent"], "get_weather");
    assert_eq!(
        body["processed_text"],
        "what's the weather in New York tomorrow?"
    );
    let entities = body["entities"].as_array().expect("entities");
    assert!(entities
        .iter()
        .any(|e| e["name"] == "location" && e["value"] == "New York"));
    assert!(entities
        .iter()
        .any(|e| e["name"] == "date" && e["value"] == "tomorrow"));
}

#[tokio::test]
async fn drink_order_completes_over_three_turns() {
    let app = build_app(test_config()).expect("build app");

    let (status, body) = post(
        &app,
        "/v1/turns",
        turn("s-order", "order_drink", "I'd like to order a drink", json!([])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "asked_drink_name");
    assert_eq!(body["response_text"], "What drink would you like?");

    let (_, body) = post(
        &app,
        "/v1/turns",
        turn("s-order", "no_intent_matched", "latte", json!([])),
    )
    .await;
    assert_eq!(body["outcome"], "asked_drink_size");
    assert_eq!(body["response_text"], "What size would you like?");

    let (_, body) = post(&app, "/v1/turns", turn("s-order", "", "large", json!([]))).await;
    assert_eq!(body["outcome"], "order_confirmed");
    assert_eq!(body["response_text"], "Okay, one large latte coming up!");

    let (status, body) = get(&app, "/v1/sessions/s-order").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending_question"], Value::Null);
}

#[tokio::test]
async fn goodbye_clears_the_session() {
    let app = build_app(test_config()).expect("build app");

    post(
        &app,
        "/v1/turns",
        turn("s-bye", "order_drink", "drink please", json!([])),
    )
    .await;
    let (status, _) = get(&app, "/v1/sessions/s-bye").await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = post(&app, "/v1/turns", turn("s-bye", "goodbye", "bye", json!([]))).await;
    assert_eq!(body["outcome"], "farewell");
    assert_eq!(body["response_text"], "Goodbye! Talk to you soon.");

    let (status, body) = get(&app, "/v1/sessions/s-bye").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn weather_question_resolves_with_a_raw_city_answer() {
    let app = build_app(test_config()).expect("build app");

    let (_, body) = post(
        &app,
        "/v1/turns",
        turn("s-wx", "get_weather", "what's the weather", json!([])),
    )
    .await;
    assert_eq!(body["outcome"], "asked_location");
    assert_eq!(
        body["response_text"],
        "Sure! Which city would you like the weather for?"
    );

    let (_, body) = post(&app, "/v1/turns", turn("s-wx", "", "Paris", json!([]))).await;
    assert_eq!(body["outcome"], "weather_answered");
    assert_eq!(
        body["response_text"],
        "I'm sorry, I can't fetch the actual weather for Paris, but I hope it's pleasant!"
    );
}

#[tokio::test]
async fn weather_with_location_entity_answers_immediately() {
    let app = build_app(test_config()).expect("build app");
    let (_, body) = post(
        &app,
        "/v1/turns",
        turn(
            "s-wx2",
            "get_weather",
            "weather in London",
            json!([{"name": "location", "value": "London", "confidence": 1.0}]),
        ),
    )
    .await;
    assert_eq!(body["outcome"], "weather_answered");
    assert_eq!(
        body["response_text"],
        "I'm sorry, I can't fetch the actual weather for London, but I hope it's pleasant!"
    );
}

#[tokio::test]
async fn sentinel_intents_render_an_apology() {
    let app = build_app(test_config()).expect("build app");
    let (_, body) = post(
        &app,
        "/v1/turns",
        turn(
            "s-err",
            "error_calling_provider",
            "what's the weather",
            json!([{"name": "error_message", "value": "connection refused"}]),
        ),
    )
    .await;
    assert_eq!(body["outcome"], "upstream_apology");
    assert_eq!(
        body["response_text"],
        "I'm sorry, I'm having trouble understanding requests right now. Please try again in a moment."
    );
}

#[tokio::test]
async fn missing_session_id_is_a_validation_error() {
    let app = build_app(test_config()).expect("build app");
    let (status, body) = post(&app, "/v1/turns", turn("  ", "greeting", "hi", json!([]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn synthesis_acknowledges_with_the_default_voice() {
    let app = build_app(test_config()).expect("build app");
    let (status, body) = post(
        &app,
        "/v1/syntheses",
        json!({"session_id": "s-tts", "text": "Hello!", "voice_profile_id": ""}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["status_message"],
        "Text for session 's-tts' (voice: 'default') received by TTS. Placeholder synthesis initiated."
    );
    assert!(body.get("audio_b64").is_none());
}

#[tokio::test]
async fn turn_responses_match_the_published_contract() {
    let app = build_app(test_config()).expect("build app");
    let (_, body) = post(
        &app,
        "/v1/turns",
        turn("s-contract", "greeting", "hello", json!([])),
    )
    .await;

    let manifest = contracts_manifest_v1();
    let schema = manifest
        .schemas
        .iter()
        .find(|s| s.path == "contracts/v1/turn_response.schema.json")
        .expect("turn_response schema present");
    let schema_value: Value = serde_json::from_str(schema.body).expect("schema parses");
    let validator = jsonschema::validator_for(&schema_value).expect("schema compiles");
    assert!(
        validator.validate(&body).is_ok(),
        "turn response violates contract: {body}"
    );
}

#[tokio::test]
async fn session_admin_lifecycle_works() {
    let app = build_app(test_config()).expect("build app");

    let (status, created) = post(&app, "/v1/sessions", json!({})).await;
    assert_eq!(status, StatusCode::CREATED);
    let session_id = created["session_id"].as_str().expect("session id").to_string();
    assert!(!created["created_at"].as_str().expect("created_at").is_empty());

    let (status, listing) = get(&app, "/v1/sessions").await;
    assert_eq!(status, StatusCode::OK);
    let sessions = listing["sessions"].as_array().expect("sessions");
    assert!(sessions.iter().any(|s| s["session_id"] == *session_id));

    let uri = format!("/v1/sessions/{session_id}");
    let (status, view) = get(&app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["pending_question"], Value::Null);
    assert_eq!(view["last_intent"], Value::Null);

    let (status, _) = send(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unmounted_hops_are_not_routed() {
    let mut cfg = test_config();
    cfg.server.hops = vec!["dialogue".to_string()];
    let app = build_app(cfg).expect("build app");

    let (status, _) = post(
        &app,
        "/v1/audio-segments",
        json!({
            "session_id": "s1",
            "sequence_number": 1,
            "audio_format": "pcm16",
            "audio_b64": "",
            "is_final": false,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post(&app, "/v1/turns", turn("s1", "greeting", "hi", json!([]))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn sqlite_sessions_survive_a_restart() {
    let db_path = std::env::temp_dir().join(format!(
        "switchboard-api-test-{}.sqlite",
        uuid_like_suffix()
    ));
    let db_path_str = db_path.to_string_lossy().into_owned();
    let mut cfg = test_config();
    cfg.store = Store {
        kind: "sqlite".to_string(),
        sqlite_path: Some(db_path_str.clone()),
    };

    {
        let app = build_app(cfg.clone()).expect("build app");
        let (_, body) = post(
            &app,
            "/v1/turns",
            turn("s-persist", "order_drink", "drink please", json!([])),
        )
        .await;
        assert_eq!(body["outcome"], "asked_drink_name");
    }

    let app = build_app(cfg).expect("rebuild app");
    let (status, view) = get(&app, "/v1/sessions/s-persist").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["pending_question"], "drink_name");
    assert_eq!(view["last_intent"], "order_drink");

    let _ = std::fs::remove_file(&db_path);
}

fn uuid_like_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    format!("{}-{nanos}", std::process::id())
}
