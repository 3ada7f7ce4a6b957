//! URL normalization (§6) and small shared string helpers.
//!
//! `normalize_url` replaces the teacher's mirror-path/crawl-queue URL
//! helpers: this control plane never writes crawled content to disk, it only
//! needs a canonical key to hash for the cache and queue.

use crate::error::AuditError;
use url::Url;

/// Normalizes a client-submitted URL per the control plane's validation
/// rules: trims whitespace, assumes `https://` when no scheme is given,
/// requires `http`/`https`, requires a host with a dot (unless it's
/// `localhost` or a literal IP), and validates the port range.
pub fn normalize_url(input: &str) -> Result<String, AuditError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AuditError::ValidationFailed("url must not be empty".to_string()));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(AuditError::ValidationFailed("url must not contain whitespace".to_string()));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let parsed = Url::parse(&candidate)
        .map_err(|e| AuditError::ValidationFailed(format!("invalid url: {e}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AuditError::ValidationFailed(format!(
            "unsupported scheme {:?}, expected http or https",
            parsed.scheme()
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AuditError::ValidationFailed("url has no host".to_string()))?;

    let is_localhost = host == "localhost";
    let is_literal_ip = host.parse::<std::net::IpAddr>().is_ok();
    if !is_localhost && !is_literal_ip && !host.contains('.') {
        return Err(AuditError::ValidationFailed(format!("host {host:?} is not a valid domain")));
    }

    if let Some(port) = parsed.port() && port == 0 {
        return Err(AuditError::ValidationFailed("port must be in 1..=65535".to_string()));
    }

    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepends_https_when_scheme_missing() {
        assert_eq!(normalize_url("example.com/page").unwrap(), "https://example.com/page");
    }

    #[test]
    fn rejects_unsupported_scheme() {
        assert!(normalize_url("ftp://example.com/").is_err());
    }

    #[test]
    fn rejects_whitespace_in_host() {
        assert!(normalize_url("exa mple.com").is_err());
    }

    #[test]
    fn accepts_localhost_without_a_dot() {
        assert_eq!(normalize_url("http://localhost:3000/").unwrap(), "http://localhost:3000/");
    }

    #[test]
    fn accepts_literal_ipv4_without_a_dot_requirement() {
        assert!(normalize_url("http://192.168.1.1/").is_ok());
    }

    #[test]
    fn rejects_bare_hostname_with_no_dot() {
        assert!(normalize_url("http://notadomain/").is_err());
    }

    #[test]
    fn trims_surrounding_whitespace() {
        assert_eq!(normalize_url("  example.com  ").unwrap(), "https://example.com/");
    }
}
