//! Header forwarding rules: strip hop-by-hop headers, then attach whichever
//! upstream credential shape the target provider expects — bearer token for
//! everything except Gemini-native URLs, which carry the key as a `key`
//! query parameter instead.

use http::{HeaderMap, HeaderValue};

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

pub fn forwardable_headers(client_headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in client_headers.iter() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

pub fn with_bearer_auth(mut headers: HeaderMap, api_key: &str) -> HeaderMap {
    headers.remove(http::header::AUTHORIZATION);
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
        headers.insert(http::header::AUTHORIZATION, value);
    }
    headers
}

/// Gemini native upstreams authenticate via a `key` query parameter rather
/// than a bearer header; this strips any client-sent `Authorization` so it
/// doesn't leak to the upstream and returns the query string to append.
pub fn gemini_key_query_param(mut headers: HeaderMap, api_key: &str) -> (HeaderMap, String) {
    headers.remove(http::header::AUTHORIZATION);
    (headers, format!("key={}", urlencoding::encode(api_key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let out = forwardable_headers(&headers);
        assert!(!out.contains_key(http::header::CONNECTION));
        assert!(out.contains_key(http::header::CONTENT_TYPE));
    }

    #[test]
    fn bearer_auth_replaces_any_existing_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer client-key"));
        let out = with_bearer_auth(headers, "upstream-key");
        assert_eq!(out.get(http::header::AUTHORIZATION).unwrap(), "Bearer upstream-key");
    }
}
