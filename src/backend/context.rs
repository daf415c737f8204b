//! Request attributes that selection may key on.

use std::collections::HashMap;
use std::net::IpAddr;

/// What the caller knows about the request being routed.
///
/// Header names are case-insensitive. A `Cookie` header also fills the
/// cookie map.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    client_ip: Option<IpAddr>,
    session_key: Option<String>,
    path: Option<String>,
    headers: HashMap<String, String>,
    cookies: HashMap<String, String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        let name = name.to_ascii_lowercase();
        let value = value.into();
        if name == "cookie" {
            self.cookies.extend(parse_cookies(&value));
        }
        self.headers.insert(name, value);
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    pub fn session_key(&self) -> Option<&str> {
        self.session_key.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }
}

/// Split a `Cookie` header into name/value pairs.
fn parse_cookies(header: &str) -> impl Iterator<Item = (String, String)> + '_ {
    header.split(';').filter_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some((name.to_string(), value.trim().to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let ctx = RequestContext::new().with_header("X-Tenant", "acme");
        assert_eq!(ctx.header("x-tenant"), Some("acme"));
        assert_eq!(ctx.header("X-TENANT"), Some("acme"));
        assert_eq!(ctx.header("x-other"), None);
    }

    #[test]
    fn test_cookie_header_is_parsed() {
        let ctx = RequestContext::new().with_header("Cookie", "LB_SESSION=abc; theme=dark;  bad");
        assert_eq!(ctx.cookie("LB_SESSION"), Some("abc"));
        assert_eq!(ctx.cookie("theme"), Some("dark"));
        assert_eq!(ctx.cookie("bad"), None);
    }

    #[test]
    fn test_builder_fields() {
        let ctx = RequestContext::new()
            .with_client_ip("10.0.0.1".parse().unwrap())
            .with_session_key("s-1")
            .with_path("/api/users");
        assert_eq!(ctx.client_ip(), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(ctx.session_key(), Some("s-1"));
        assert_eq!(ctx.path(), Some("/api/users"));
    }
}
