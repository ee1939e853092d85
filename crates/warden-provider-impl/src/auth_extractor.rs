use warden_provider_core::{Headers, header_get, header_set};

pub fn set_bearer(headers: &mut Headers, token: &str) {
    header_set(headers, "Authorization", format!("Bearer {token}"));
}

pub fn set_header(headers: &mut Headers, name: &str, value: &str) {
    header_set(headers, name, value);
}

/// Token from `Authorization: Bearer ...`, if any.
pub fn extract_bearer(headers: &Headers) -> Option<String> {
    let value = header_get(headers, "authorization")?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Caller credential from any of the header shapes vendors use.
pub fn extract_caller_key(headers: &Headers) -> Option<String> {
    extract_bearer(headers).or_else(|| {
        ["x-api-key", "x-goog-api-key"]
            .into_iter()
            .filter_map(|name| header_get(headers, name))
            .map(str::trim)
            .find(|value| !value.is_empty())
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_takes_precedence() {
        let headers: Headers = vec![
            ("x-api-key".into(), "from-header".into()),
            ("Authorization".into(), "Bearer sk-1".into()),
        ];
        assert_eq!(extract_caller_key(&headers).as_deref(), Some("sk-1"));
    }

    #[test]
    fn falls_back_to_vendor_headers() {
        let headers: Headers = vec![("x-goog-api-key".into(), " g-1 ".into())];
        assert_eq!(extract_caller_key(&headers).as_deref(), Some("g-1"));
        let headers: Headers = vec![("authorization".into(), "Basic abc".into())];
        assert_eq!(extract_caller_key(&headers), None);
    }
}
