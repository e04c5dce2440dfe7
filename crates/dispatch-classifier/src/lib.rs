//! Maps a raw HTTP outcome into the dispatch engine's closed failure taxonomy.
//!
//! This is the only module in the engine that inspects a raw response body
//! or transport error shape — everywhere else deals in [`ApiError`]. The
//! taxonomy and its retry/user-action metadata are fixed by the category
//! table below; nothing here is pluggable the way
//! `tower_resilience_circuitbreaker::classifier::FailureClassifier` is,
//! because the category set is closed by design, not by the caller.

mod extract;
mod transport;

pub use transport::TransportCondition;

use serde_json::Value;
use std::collections::HashMap;

/// The closed set of failure categories the dispatch engine recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    RequiresUserAction,
    AuthError,
    TemporaryFailure,
    SystemError,
    NetworkError,
    UnknownError,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::RequiresUserAction => "REQUIRES_USER_ACTION",
            Category::AuthError => "AUTH_ERROR",
            Category::TemporaryFailure => "TEMPORARY_FAILURE",
            Category::SystemError => "SYSTEM_ERROR",
            Category::NetworkError => "NETWORK_ERROR",
            Category::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission metadata extracted for a `403` response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PermissionInfo {
    pub permission: Option<String>,
    pub required_permissions: Vec<String>,
}

/// The classified outcome of one HTTP attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub category: Category,
    pub status_code: Option<u16>,
    pub message: String,
    pub can_retry: bool,
    pub user_action_required: bool,
    pub validation_errors: Option<Vec<String>>,
    pub permission_info: Option<PermissionInfo>,
    pub user_action_guidance: Option<String>,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{}: {} (status {code})", self.category, self.message),
            None => write!(f, "{}: {}", self.category, self.message),
        }
    }
}

impl std::error::Error for ApiError {}

/// Raw material the classifier needs: either a terminated HTTP response, or
/// a transport-level condition that never reached the server.
pub enum RawOutcome<'a> {
    Response {
        status: u16,
        headers: &'a HashMap<String, String>,
        body: &'a [u8],
        response_description: Option<&'a str>,
    },
    Transport(TransportCondition),
}

/// Classifies a raw HTTP outcome per the category table in §4.3.
pub fn classify(outcome: RawOutcome<'_>) -> ApiError {
    match outcome {
        RawOutcome::Transport(condition) => classify_transport(condition),
        RawOutcome::Response {
            status,
            headers,
            body,
            response_description,
        } => classify_response(status, headers, body, response_description),
    }
}

fn classify_transport(condition: TransportCondition) -> ApiError {
    ApiError {
        category: Category::NetworkError,
        status_code: None,
        message: condition.message().to_string(),
        can_retry: true,
        user_action_required: false,
        validation_errors: None,
        permission_info: None,
        user_action_guidance: None,
    }
}

fn classify_response(
    status: u16,
    headers: &HashMap<String, String>,
    body: &[u8],
    response_description: Option<&str>,
) -> ApiError {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();

    // 403 overlaps AUTH_ERROR and REQUIRES_USER_ACTION; REQUIRES_USER_ACTION wins.
    let category = match status {
        400 | 404 | 409 | 422 => Category::RequiresUserAction,
        403 => Category::RequiresUserAction,
        401 => Category::AuthError,
        429 => Category::TemporaryFailure,
        s if s >= 500 => Category::SystemError,
        _ => Category::UnknownError,
    };

    let message = response_description
        .map(str::to_string)
        .or_else(|| parsed.as_ref().and_then(extract::error_message))
        .unwrap_or_else(|| format!("request failed with status {status}"));

    let validation_errors = matches!(status, 400 | 422)
        .then(|| extract::validation_errors(parsed.as_ref()))
        .flatten();

    let permission_info = (status == 403)
        .then(|| extract::permission_info(parsed.as_ref(), headers))
        .flatten();

    let user_action_guidance = matches!(category, Category::RequiresUserAction)
        .then(|| extract::user_action_guidance(parsed.as_ref(), headers))
        .flatten();

    ApiError {
        can_retry: matches!(category, Category::TemporaryFailure | Category::NetworkError),
        user_action_required: matches!(category, Category::RequiresUserAction),
        category,
        status_code: Some(status),
        message,
        validation_errors,
        permission_info,
        user_action_guidance,
    }
}
