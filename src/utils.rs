//! Shared utility functions used across the crate.

use std::error::Error;

/// Render an error together with its `source()` chain, e.g.
/// `client error (Connect): tcp connect error: Connection refused (os error 111)`.
pub fn error_chain(err: &(dyn Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.ends_with(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}

/// Canonical MIME header form (`content-type` -> `Content-Type`), the shape the controller
/// receives header names in.
pub fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Strip a leading numeric status code and the whitespace after it from a status line,
/// e.g. `"200 OK"` -> `"OK"`. Lines without a numeric prefix are returned trimmed.
pub fn strip_status_code(status_line: &str) -> &str {
    let trimmed = status_line.trim();
    let digits = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    if digits == 0 {
        return trimmed;
    }
    let rest = &trimmed[digits..];
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        rest.trim_start()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl std::fmt::Display for Outer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "client error")
        }
    }

    impl Error for Outer {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let err = Outer(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert_eq!(error_chain(&err), "client error: connection refused");
    }

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("content-type"), "Content-Type");
        assert_eq!(canonical_header_name("x-request-id"), "X-Request-Id");
        assert_eq!(canonical_header_name("ETAG"), "Etag");
        assert_eq!(canonical_header_name("title"), "Title");
    }

    #[test]
    fn test_strip_status_code() {
        assert_eq!(strip_status_code("200 OK"), "OK");
        assert_eq!(strip_status_code("404   Not Found"), "Not Found");
        assert_eq!(strip_status_code("OK"), "OK");
        assert_eq!(strip_status_code("200"), "");
        assert_eq!(strip_status_code("2xx custom"), "2xx custom");
        assert_eq!(strip_status_code(" 503 Service Unavailable "), "Service Unavailable");
    }
}
