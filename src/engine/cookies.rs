use cookie::Cookie;
use std::collections::BTreeMap;

/// Request header value that opts a request out of cookie forwarding.
const NO_COOKIE: &str = "nocookie";

/// Cookies seen during one batch iteration, keyed by cookie name.
///
/// The first value observed for a name is kept for the rest of the batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CookieJar {
    cookies: BTreeMap<String, String>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw `name=value` string stored for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Record a `Set-Cookie` response header value. Attributes (Path, Expires...) are dropped.
    pub fn observe_set_cookie(&mut self, header: &str) {
        match Cookie::parse(header.trim()) {
            Ok(c) if !c.name().is_empty() => {
                let raw = format!("{}={}", c.name(), c.value());
                self.insert(c.name(), raw);
            }
            _ => {
                for (name, raw) in read_cookies(header) {
                    self.insert(&name, raw);
                }
            }
        }
    }

    /// Record every pair of a `Cookie` style header (`a=1; b=2`).
    pub fn observe_cookie_header(&mut self, header: &str) {
        for (name, raw) in read_cookies(header) {
            self.insert(&name, raw);
        }
    }

    fn insert(&mut self, name: &str, raw: String) -> bool {
        if self.cookies.contains_key(name) {
            return false;
        }
        self.cookies.insert(name.to_string(), raw);
        true
    }

    /// Append jar cookies missing from a request's `Cookie` header value.
    pub fn apply(&self, header_value: &str) -> String {
        if self.cookies.is_empty() || header_value == NO_COOKIE {
            return header_value.to_string();
        }
        let present = read_cookies(header_value);
        let mut value = header_value.to_string();
        for (name, raw) in &self.cookies {
            if !present.contains_key(name) {
                if !value.is_empty() {
                    value.push(';');
                }
                value.push_str(raw);
            }
        }
        value
    }
}

/// Split a cookie header into `name -> "name=value"` pairs.
pub fn read_cookies(header: &str) -> BTreeMap<String, String> {
    header
        .split(';')
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .map(|piece| {
            let name = piece.split_once('=').map_or(piece, |(n, _)| n);
            (name.to_string(), piece.to_string())
        })
        .collect()
}
