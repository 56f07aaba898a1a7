//! Operator control surface.
//!
//! One signed interactions endpoint carries every command: `stats`,
//! `set`, `apply`, `rollback`, and the report-approval components. All
//! mutations flow through the parameter store's validation, backup,
//! audit and rate-limit pipeline with the interaction author attached.

pub mod auth;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::{schema, ApplyError, ParamStore};

#[derive(Clone)]
pub struct ControlState {
    pub params: Arc<ParamStore>,
    /// Hex shared secret; requests failing verification get 401 before
    /// any body processing.
    pub signing_key: Arc<String>,
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/interactions", post(interactions))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
struct Interaction {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    custom_id: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    args: Option<Value>,
}

fn reply(ok: bool, code: &str, message: impl Into<String>) -> Json<Value> {
    Json(json!({"ok": ok, "code": code, "message": message.into()}))
}

fn apply_error_reply(err: &ApplyError) -> Json<Value> {
    reply(false, err.code(), err.to_string())
}

async fn interactions(
    State(state): State<ControlState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Signature check precedes all body processing.
    let timestamp = headers
        .get("x-signature-timestamp")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !auth::timestamp_fresh(timestamp, Utc::now().timestamp())
        || !auth::verify_signature(&state.signing_key, timestamp, &body, signature)
    {
        warn!("Rejected unsigned or stale interaction");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let interaction: Interaction = match serde_json::from_slice(&body) {
        Ok(interaction) => interaction,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                reply(false, "MALFORMED", format!("malformed interaction: {e}")),
            )
                .into_response()
        }
    };
    let author = interaction.author.clone().unwrap_or_else(|| "unknown".to_string());

    match interaction.kind.as_str() {
        "command" => handle_command(&state, &interaction, &author).into_response(),
        "component" => handle_component(&state, &interaction, &author).into_response(),
        other => (
            StatusCode::BAD_REQUEST,
            reply(false, "UNKNOWN_TYPE", format!("unknown interaction type: {other}")),
        )
            .into_response(),
    }
}

fn handle_command(state: &ControlState, interaction: &Interaction, author: &str) -> Json<Value> {
    let name = interaction.name.as_deref().unwrap_or("");
    match name {
        "stats" => {
            let history: Vec<Value> = state
                .params
                .history(10)
                .unwrap_or_default()
                .into_iter()
                .map(|entry| {
                    json!({
                        "ts": entry.ts.to_rfc3339(),
                        "revision": entry.revision,
                        "author": entry.author,
                        "source": entry.source_tag,
                        "delta": entry.delta_json,
                    })
                })
                .collect();
            Json(json!({
                "ok": true,
                "code": "OK",
                "revision": state.params.params().revision,
                "values": state.params.values_json(),
                "audit": history,
            }))
        }
        "set" => {
            let Some(args) = interaction.args.as_ref() else {
                return reply(false, "MISSING_ARGS", "set requires key and value");
            };
            let (Some(key), Some(value)) = (
                args.get("key").and_then(Value::as_str),
                args.get("value"),
            ) else {
                return reply(false, "MISSING_ARGS", "set requires key and value");
            };
            let mut delta = BTreeMap::new();
            delta.insert(key.to_string(), coerce_value(key, value.clone()));
            run_apply(state, delta, author, "control-set")
        }
        "apply" => {
            let delta_obj = interaction
                .args
                .as_ref()
                .and_then(|args| args.get("delta"))
                .and_then(Value::as_object);
            let Some(delta_obj) = delta_obj else {
                return reply(false, "MISSING_ARGS", "apply requires a delta object");
            };
            let delta: BTreeMap<String, Value> = delta_obj
                .iter()
                .map(|(k, v)| (k.clone(), coerce_value(k, v.clone())))
                .collect();
            run_apply(state, delta, author, "control-apply")
        }
        "rollback" => {
            let n = interaction
                .args
                .as_ref()
                .and_then(|args| args.get("n"))
                .and_then(Value::as_u64)
                .unwrap_or(1) as u32;
            match state.params.rollback(n, author) {
                Ok(revision) => {
                    info!(author, revision, "Rollback via control surface");
                    reply(true, "OK", format!("rolled back; revision {revision}"))
                }
                Err(e) => apply_error_reply(&e),
            }
        }
        other => reply(false, "UNKNOWN_COMMAND", format!("unknown command: {other}")),
    }
}

/// Report-approval buttons: `reco:KEY=VALUE` applies a single-key delta,
/// `reco_reject:KEY` acknowledges without changes.
fn handle_component(state: &ControlState, interaction: &Interaction, author: &str) -> Json<Value> {
    let custom_id = interaction.custom_id.as_deref().unwrap_or("");
    if let Some(encoded) = custom_id.strip_prefix("reco:") {
        let Some((key, raw_value)) = encoded.split_once('=') else {
            return reply(false, "MALFORMED", "malformed recommendation id");
        };
        let value: Value = serde_json::from_str(raw_value)
            .unwrap_or_else(|_| Value::String(raw_value.to_string()));
        let mut delta = BTreeMap::new();
        delta.insert(key.to_string(), coerce_value(key, value));
        return run_apply(state, delta, author, "report-approve");
    }
    if let Some(key) = custom_id.strip_prefix("reco_reject:") {
        info!(author, key, "Recommendation rejected");
        return reply(true, "OK", format!("recommendation for {key} dismissed"));
    }
    reply(false, "UNKNOWN_COMPONENT", format!("unknown component: {custom_id}"))
}

fn run_apply(
    state: &ControlState,
    delta: BTreeMap<String, Value>,
    author: &str,
    source_tag: &str,
) -> Json<Value> {
    match state.params.apply(delta, author, source_tag) {
        Ok(revision) => reply(true, "OK", format!("applied; revision {revision}")),
        Err(e) => apply_error_reply(&e),
    }
}

/// Chat commands deliver every value as a string; coerce toward the
/// registered schema kind so `set MIN_SCORE 0.30` works.
fn coerce_value(key: &str, value: Value) -> Value {
    let Some(spec) = schema::spec_for(key) else {
        return value;
    };
    let Value::String(raw) = &value else {
        return value;
    };
    let raw = raw.trim();
    match spec.kind {
        schema::ParamKind::Float { .. } | schema::ParamKind::OptFloat { .. } => {
            if raw.eq_ignore_ascii_case("null") || raw.eq_ignore_ascii_case("none") {
                Value::Null
            } else {
                raw.parse::<f64>().map(|v| json!(v)).unwrap_or(value)
            }
        }
        schema::ParamKind::Uint { .. } => raw.parse::<u64>().map(|v| json!(v)).unwrap_or(value),
        schema::ParamKind::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" | "on" | "1" => json!(true),
            "false" | "off" | "0" => json!(false),
            _ => value,
        },
        schema::ParamKind::StringList => {
            let items: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            json!(items)
        }
        schema::ParamKind::FloatMap { .. } => {
            serde_json::from_str::<Value>(raw).unwrap_or(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    const SECRET: &str = "00112233445566778899aabbccddeeff";

    fn state() -> ControlState {
        ControlState {
            params: Arc::new(ParamStore::load(Storage::open_in_memory().unwrap()).unwrap()),
            signing_key: Arc::new(SECRET.to_string()),
        }
    }

    fn signed_request(body: &str) -> Request<Body> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = auth::sign(SECRET, &timestamp, body.as_bytes()).unwrap();
        Request::builder()
            .method("POST")
            .uri("/interactions")
            .header("content-type", "application/json")
            .header("x-signature-timestamp", timestamp)
            .header("x-signature", signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    }

    #[tokio::test]
    async fn unsigned_request_is_401_without_body_processing() {
        let app = router(state());
        let request = Request::builder()
            .method("POST")
            .uri("/interactions")
            .body(Body::from("{not even json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bad_signature_is_401() {
        let app = router(state());
        let timestamp = Utc::now().timestamp().to_string();
        let request = Request::builder()
            .method("POST")
            .uri("/interactions")
            .header("x-signature-timestamp", timestamp)
            .header("x-signature", "deadbeef")
            .body(Body::from(r#"{"type":"command","name":"stats"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn stats_returns_snapshot_and_audit() {
        let app = router(state());
        let response = app
            .oneshot(signed_request(
                r#"{"type":"command","name":"stats","author":"alice"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
        assert!(body["values"]["MIN_SCORE"].is_number());
        assert!(body["audit"].is_array());
    }

    #[tokio::test]
    async fn set_coerces_and_applies() {
        let s = state();
        let app = router(s.clone());
        let response = app
            .oneshot(signed_request(
                r#"{"type":"command","name":"set","author":"alice","args":{"key":"MIN_SCORE","value":"0.35"}}"#,
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["ok"], true, "unexpected reply: {body}");
        assert!((s.params.params().min_score - 0.35).abs() < 1e-12);
    }

    #[tokio::test]
    async fn invalid_set_reports_machine_code() {
        let s = state();
        let app = router(s.clone());
        let response = app
            .oneshot(signed_request(
                r#"{"type":"command","name":"set","author":"alice","args":{"key":"MIN_SCORE","value":"9.9"}}"#,
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["code"], "INVALID_VALUE");
        assert!((s.params.params().min_score - 0.25).abs() < 1e-12);
    }

    #[tokio::test]
    async fn report_approval_component_applies_delta() {
        let s = state();
        let app = router(s.clone());
        let response = app
            .oneshot(signed_request(
                r#"{"type":"component","custom_id":"reco:MIN_SCORE=0.3","author":"ops"}"#,
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["ok"], true, "unexpected reply: {body}");
        assert!((s.params.params().min_score - 0.30).abs() < 1e-12);

        let history = s.params.history(5).unwrap();
        assert_eq!(history[0].source_tag, "report-approve");
        assert_eq!(history[0].author, "ops");
    }
}
