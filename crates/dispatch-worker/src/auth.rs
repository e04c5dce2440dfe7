use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;

use crate::session::SessionAuth;

/// `{ Authorization: Basic base64(userId:apiKey), X-User-Id: userId }`.
pub fn build_auth_headers(auth: &SessionAuth) -> HashMap<String, String> {
    let token = STANDARD.encode(format!("{}:{}", auth.user_id, auth.api_key));
    let mut headers = HashMap::with_capacity(2);
    headers.insert("Authorization".to_string(), format!("Basic {token}"));
    headers.insert("X-User-Id".to_string(), auth.user_id.clone());
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_basic_auth_and_sets_user_id() {
        let auth = SessionAuth {
            user_id: "u1".to_string(),
            api_key: "secret".to_string(),
        };
        let headers = build_auth_headers(&auth);
        assert_eq!(headers.get("Authorization").unwrap(), "Basic dTE6c2VjcmV0");
        assert_eq!(headers.get("X-User-Id").unwrap(), "u1");
    }
}
