//! Field extraction from heterogeneous remote error payloads.
//!
//! Remote APIs disagree on where they put validation errors, required
//! permissions, or user guidance. These helpers check the documented
//! fallback chain (body path, then body path, then header) and stop at the
//! first hit.

use crate::PermissionInfo;
use serde_json::Value;
use std::collections::HashMap;

/// `errors | validationErrors | details`, each coerced to a list of strings.
pub(crate) fn validation_errors(body: Option<&Value>) -> Option<Vec<String>> {
    let body = body?;
    for key in ["errors", "validationErrors", "details"] {
        if let Some(value) = body.get(key) {
            if let Some(list) = value_to_string_list(value) {
                return Some(list);
            }
        }
    }
    None
}

/// `permission | requiredPermissions` from the body, else the
/// `required-permission` response header.
pub(crate) fn permission_info(
    body: Option<&Value>,
    headers: &HashMap<String, String>,
) -> Option<PermissionInfo> {
    let permission = body
        .and_then(|b| b.get("permission"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let required_permissions = body
        .and_then(|b| b.get("requiredPermissions"))
        .and_then(value_to_string_list)
        .unwrap_or_default();

    if permission.is_some() || !required_permissions.is_empty() {
        return Some(PermissionInfo {
            permission,
            required_permissions,
        });
    }

    headers.get("required-permission").map(|header| PermissionInfo {
        permission: Some(header.clone()),
        required_permissions: Vec::new(),
    })
}

/// `userAction | userGuidance` from the body, else the `user-action` header.
pub(crate) fn user_action_guidance(
    body: Option<&Value>,
    headers: &HashMap<String, String>,
) -> Option<String> {
    body.and_then(|b| b.get("userAction").or_else(|| b.get("userGuidance")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| headers.get("user-action").cloned())
}

/// `message | error | description`, the generic human-readable fallback.
pub(crate) fn error_message(body: &Value) -> Option<String> {
    for key in ["message", "error", "description"] {
        if let Some(s) = body.get(key).and_then(Value::as_str) {
            return Some(s.to_string());
        }
    }
    None
}

fn value_to_string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => Some(
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
        ),
        Value::String(s) => Some(vec![s.clone()]),
        Value::Object(_) => Some(vec![value.to_string()]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validation_errors_checks_fallback_chain() {
        assert_eq!(
            validation_errors(Some(&json!({"errors": ["a"]}))),
            Some(vec!["a".to_string()])
        );
        assert_eq!(
            validation_errors(Some(&json!({"validationErrors": ["b"]}))),
            Some(vec!["b".to_string()])
        );
        assert_eq!(
            validation_errors(Some(&json!({"details": "single"}))),
            Some(vec!["single".to_string()])
        );
        assert_eq!(validation_errors(Some(&json!({}))), None);
    }

    #[test]
    fn permission_info_prefers_body_over_header() {
        let headers = HashMap::from([("required-permission".to_string(), "x".to_string())]);
        let info = permission_info(Some(&json!({"permission": "records:write"})), &headers);
        assert_eq!(info.unwrap().permission, Some("records:write".to_string()));
    }

    #[test]
    fn permission_info_falls_back_to_header() {
        let headers = HashMap::from([("required-permission".to_string(), "x".to_string())]);
        let info = permission_info(None, &headers);
        assert_eq!(info.unwrap().permission, Some("x".to_string()));
    }

    #[test]
    fn user_action_guidance_falls_back_to_header() {
        let headers = HashMap::from([("user-action".to_string(), "contact support".to_string())]);
        assert_eq!(
            user_action_guidance(None, &headers),
            Some("contact support".to_string())
        );
    }
}
