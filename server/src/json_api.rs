use serde::Serialize;
use serde_json::{json, Map, Value};

pub type JsonObject = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonApiMethod {
    Get,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonApiStatus {
    Ok,
    NotFound,
    BadRequest,
    BadMethod,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonApiResult {
    pub status: JsonApiStatus,
    pub body: Value,
}

impl JsonApiResult {
    pub fn ok(body: Value) -> Self {
        Self {
            status: JsonApiStatus::Ok,
            body,
        }
    }

    /// Serializes `value` as the response body.
    pub fn ok_from<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => Self::ok(body),
            Err(err) => {
                log::error!("Cannot serialize API response: {}", err);
                Self::error(JsonApiStatus::BadRequest, "response not serializable")
            }
        }
    }

    pub fn error(status: JsonApiStatus, message: &str) -> Self {
        Self {
            status,
            body: json!({ "status": "error", "message": message }),
        }
    }

    pub fn not_found() -> Self {
        Self::error(JsonApiStatus::NotFound, "not found")
    }

    pub fn bad_method() -> Self {
        Self::error(JsonApiStatus::BadMethod, "bad method")
    }

    pub fn bad_request(message: &str) -> Self {
        Self::error(JsonApiStatus::BadRequest, message)
    }
}

/// Splits the first segment off an API path.
pub fn pop_api_path(path: &[String]) -> (Option<&str>, &[String]) {
    match path.split_first() {
        Some((head, tail)) => (Some(head.as_str()), tail),
        None => (None, path),
    }
}

/// Splits a slash delimited resource path into segments.
pub fn split_api_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_owned)
        .collect()
}
