//! ANY /{project}/{function} — synchronous invocation.
//!
//! Normalize, dispatch to the ledger, then hold the connection until the
//! job's result shows up in the shared store. If the client goes away the
//! handler future is dropped, which cancels the wait; the dispatched job
//! still runs.

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{Map, Value};

use peerhost_core::canonical::{encode, RawRequest};
use peerhost_core::wire::FunctionResponse;
use peerhost_core::FunctionId;

use super::{owner_from_host, validate_name, ApiError, ApiState};

pub async fn handle_invoke(
    State(state): State<ApiState>,
    method: Method,
    Path((project, function)): Path<(String, String)>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let owner = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(owner_from_host)
        .ok_or_else(|| ApiError::invalid("invalid owner subdomain"))?;
    if !validate_name(&project) {
        return Err(ApiError::invalid("invalid project name"));
    }
    if !validate_name(&function) {
        return Err(ApiError::invalid("invalid function name"));
    }

    let raw = RawRequest {
        method: method.as_str().to_string(),
        query: Some(query_value(query)),
        headers: header_pairs(&headers),
        body: body_value(&body),
    };
    let encoded = encode(&raw, &FunctionId::new(&owner, &project, &function));

    let request_id = state
        .dispatcher
        .dispatch(&encoded.request, &encoded.fingerprint)
        .await?;
    let result = state.waiter.wait(&request_id, state.wait_timeout).await?;

    tracing::info!(request_id = %request_id, %owner, %project, %function, "invocation answered");
    Ok(function_response(FunctionResponse::from_result(&result)))
}

/// Repeated query keys become arrays, in arrival order.
fn query_value(pairs: Vec<(String, String)>) -> Value {
    let mut map = Map::new();
    for (key, value) in pairs {
        match map.get_mut(&key) {
            None => {
                map.insert(key, Value::String(value));
            }
            Some(Value::Array(values)) => values.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
        }
    }
    Value::Object(map)
}

/// Headers with non-visible-ASCII values are dropped.
fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect()
}

/// JSON if it parses, otherwise the raw text. Empty means no body.
fn body_value(body: &[u8]) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    Some(
        serde_json::from_slice(body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned())),
    )
}

/// Map a function's `{status, headers, body}` onto the HTTP response.
fn function_response(resp: FunctionResponse) -> Response {
    let status = resp
        .status
        .and_then(|s| StatusCode::from_u16(s).ok())
        .unwrap_or(StatusCode::OK);

    let mut response = match resp.body {
        Value::Null => Response::new(Body::empty()),
        Value::String(text) => ([(CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response(),
        other => Json(other).into_response(),
    };
    *response.status_mut() = status;

    for (name, value) in resp.headers.unwrap_or_default() {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => tracing::warn!(header = %name, "dropping invalid response header from function"),
        }
    }
    response
}
