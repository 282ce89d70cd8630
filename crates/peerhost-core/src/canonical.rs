//! Canonical request encoding.
//!
//! An inbound HTTP call is normalized into an `ExecutionRequest`, rendered as
//! canonical JSON (object keys sorted, array order kept, no whitespace) and
//! fingerprinted with BLAKE3. Two requests that differ only in key order
//! produce identical bytes and an identical fingerprint.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::FunctionId;

/// Hop-by-hop headers (RFC 7230 §6.1). Never forwarded to function code.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// An already-parsed inbound request, as handed over by the HTTP layer.
///
/// Every field is optional in spirit: missing query/headers are treated as
/// empty and a missing body as `null`.
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    pub method: String,
    pub query: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

/// Who is being called: owner identity plus project and function name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    pub owner: String,
    pub project: String,
    pub function: String,
}

/// The HTTP half of a normalized request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: Value,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

/// Normalized representation of an inbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub meta: RequestMeta,
    pub http: HttpRequest,
}

impl ExecutionRequest {
    pub fn function_id(&self) -> FunctionId {
        FunctionId::new(&self.meta.owner, &self.meta.project, &self.meta.function)
    }
}

/// 256-bit BLAKE3 digest of canonical request bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Fingerprint(*blake3::hash(bytes).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

/// Output of [`encode`].
#[derive(Debug, Clone)]
pub struct EncodedRequest {
    pub request: ExecutionRequest,
    pub canonical: String,
    pub fingerprint: Fingerprint,
}

/// Normalize `raw` for the function `id`, render it canonically and fingerprint it.
pub fn encode(raw: &RawRequest, id: &FunctionId) -> EncodedRequest {
    let request = ExecutionRequest {
        meta: RequestMeta {
            owner: id.owner.clone(),
            project: id.project.clone(),
            function: id.function.clone(),
        },
        http: HttpRequest {
            method: raw.method.to_ascii_uppercase(),
            path: format!("/{}/{}", id.project, id.function),
            query: match &raw.query {
                None | Some(Value::Null) => Value::Object(Default::default()),
                Some(v) => v.clone(),
            },
            headers: filter_headers(&raw.headers),
            body: raw.body.clone().unwrap_or(Value::Null),
        },
    };

    let canonical = canonical_json(&request_value(&request));
    let fingerprint = Fingerprint::of(canonical.as_bytes());

    EncodedRequest {
        request,
        canonical,
        fingerprint,
    }
}

/// Strip hop-by-hop headers and lower-case the rest.
///
/// Repeated names (after lower-casing) are joined with ", " in arrival order.
pub fn filter_headers(headers: &[(String, String)]) -> BTreeMap<String, String> {
    let mut clean: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        clean
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.clone());
    }
    clean
}

/// Render a JSON value with sorted object keys and no insignificant whitespace.
///
/// Independent of `serde_json`'s map ordering feature.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, item)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // String escaping is infallible for `Value::String`.
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn request_value(request: &ExecutionRequest) -> Value {
    let headers: serde_json::Map<String, Value> = request
        .http
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    serde_json::json!({
        "meta": {
            "owner": request.meta.owner,
            "project": request.meta.project,
            "function": request.meta.function,
        },
        "http": {
            "method": request.http.method,
            "path": request.http.path,
            "query": request.http.query,
            "headers": Value::Object(headers),
            "body": request.http.body,
        }
    })
}
