use crate::app::AppState;
use crate::error::Error;
use axum::{
    body::Bytes,
    extract::{RawQuery, State},
    http::{header::CONTENT_TYPE, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use std::time::Instant;
use tracing::{error, info, warn};

use super::middleware::{clientaddr::ClientAddr, request_log::AccessNote};

/// Names the deal id has been sent under by the different CRM automations.
const DEAL_ID_KEYS: [&str; 3] = ["dealId", "deal_id", "DEAL_ID"];
const DOCUMENT_KEY: &str = "document_id";

pub async fn verify_handler(
    client_addr: ClientAddr,
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let Some(deal_id) = extract_deal_id(query.as_deref(), content_type, &body) else {
        warn!(
            client = %client_addr,
            query = query.as_deref().unwrap_or("-"),
            body_len = body.len(),
            "deal id not found in request"
        );
        return Error::MissingIdentifier.into_response();
    };

    let start_time = Instant::now();
    info!(client = %client_addr, deal_id = %deal_id, "verifying URA interaction");
    let (mut response, outcome) = match state.classifier.classify(&deal_id).await {
        Ok(classification) => {
            info!(
                deal_id = %deal_id,
                verdict = ?classification.verdict,
                reason = ?classification.reason,
                elapsed_ms = start_time.elapsed().as_millis() as u64,
                "URA verification done"
            );
            let outcome = format!("{:?}/{:?}", classification.verdict, classification.reason);
            (Json(classification).into_response(), outcome)
        }
        Err(err) => {
            match &err {
                Error::Upstream(message) => error!(deal_id = %deal_id, "URA verification failed: {}", message),
                other => warn!(deal_id = %deal_id, "URA verification rejected: {}", other),
            }
            let outcome = err.to_string();
            (err.into_response(), outcome)
        }
    };
    response
        .extensions_mut()
        .insert(AccessNote { deal_id, outcome });
    response
}

/// Query string first, then the body as JSON or as a URL-encoded form.
pub fn extract_deal_id(query: Option<&str>, content_type: Option<&str>, body: &[u8]) -> Option<String> {
    if let Some(id) = query.and_then(|q| from_pairs(q.as_bytes())) {
        return Some(id);
    }

    let text = std::str::from_utf8(body).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    let is_json = content_type
        .map(|ct| ct.contains("json"))
        .unwrap_or(false)
        || text.starts_with('{');
    if is_json {
        let value: Value = serde_json::from_str(text).ok()?;
        return from_json(&value);
    }
    from_pairs(text.as_bytes())
}

fn from_pairs(input: &[u8]) -> Option<String> {
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(input).into_owned().collect();
    for key in DEAL_ID_KEYS {
        let found = pairs
            .iter()
            .filter(|(k, _)| k == key)
            .find_map(|(_, v)| non_empty(v));
        if found.is_some() {
            return found;
        }
    }
    // Bitrix robots post `document_id[]=crm&document_id[]=CCrmDocumentDeal&document_id[]=DEAL_42`
    pairs
        .iter()
        .filter(|(k, _)| is_document_key(k))
        .filter_map(|(_, v)| document_deal_id(v))
        .last()
}

fn from_json(value: &Value) -> Option<String> {
    let object = value.as_object()?;
    for key in DEAL_ID_KEYS {
        let found = match object.get(key) {
            Some(Value::String(s)) => non_empty(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        if found.is_some() {
            return found;
        }
    }
    match object.get(DOCUMENT_KEY)? {
        Value::String(s) => document_deal_id(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(document_deal_id)
            .last(),
        _ => None,
    }
}

fn is_document_key(key: &str) -> bool {
    match key.strip_prefix(DOCUMENT_KEY) {
        Some("") => true,
        Some(rest) => rest.starts_with('[') && rest.ends_with(']'),
        None => false,
    }
}

fn document_deal_id(value: &str) -> Option<String> {
    let value = value.trim();
    let id = value.strip_prefix("DEAL_").unwrap_or(value);
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        Some(id.to_string())
    } else {
        None
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
