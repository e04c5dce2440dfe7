//! URL pattern normalization: collapses numeric ids and UUID-shaped hex
//! runs so `latestEndpointPatterns` groups by route shape, not by
//! per-request identifier.

/// Replaces every run of ASCII digits with `:id` and every run of 32 hex
/// characters with `:uuid`.
pub fn normalize_url_pattern(url: &str) -> String {
    let chars: Vec<char> = url.chars().collect();
    let n = chars.len();
    let mut out = String::with_capacity(n);
    let mut i = 0;
    while i < n {
        if chars[i].is_ascii_hexdigit() {
            let mut j = i;
            while j < n && chars[j].is_ascii_hexdigit() {
                j += 1;
            }
            if j - i >= 32 {
                out.push_str(":uuid");
                i = j;
                continue;
            }
        }
        if chars[i].is_ascii_digit() {
            let mut j = i;
            while j < n && chars[j].is_ascii_digit() {
                j += 1;
            }
            out.push_str(":id");
            i = j;
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_numeric_segments() {
        assert_eq!(normalize_url_pattern("/members/123/batch"), "/members/:id/batch");
    }

    #[test]
    fn collapses_32_hex_uuids() {
        let url = "/sessions/a1b2c3d4e5f60718293a4b5c6d7e8f90/records";
        assert_eq!(normalize_url_pattern(url), "/sessions/:uuid/records");
    }

    #[test]
    fn leaves_non_numeric_segments_alone() {
        assert_eq!(normalize_url_pattern("/v1/members"), "/v:id/members");
    }

    #[test]
    fn collapses_embedded_digit_runs_but_not_short_hex_runs() {
        assert_eq!(normalize_url_pattern("/color/ff00aa"), "/color/ff:idaa");
    }
}
