//! Reverse proxy integration.
//!
//! Routing intent is expressed as container labels picked up by the proxy's
//! docker provider; nothing here talks to the proxy directly.

mod labels;

pub use labels::{generate_labels, router_name};

use serde::{Deserialize, Serialize};

use crate::container::validate_dns_label;
use crate::error::{EngineError, EngineResult};

/// Where a resource is exposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Apex domain, e.g. `example.com`.
    pub domain: String,
    /// Optional subdomain prepended to the domain.
    #[serde(default)]
    pub subdomain: Option<String>,
    /// Optional path prefix, starting with `/`.
    #[serde(default)]
    pub path: Option<String>,
}

impl RoutingConfig {
    /// Fully qualified host name.
    pub fn host(&self) -> String {
        match &self.subdomain {
            Some(sub) => format!("{}.{}", sub, self.domain),
            None => self.domain.clone(),
        }
    }

    /// Public URL for the route, scheme chosen by whether TLS is on.
    pub fn public_url(&self, tls: bool) -> String {
        let scheme = if tls { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.host(), self.path.as_deref().unwrap_or(""))
    }
}

/// Proxy settings shared by every resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Network the proxy and all resources join.
    pub network: String,
    /// Proxy entrypoint to attach routers to.
    pub entrypoint: String,
    /// Terminate TLS at the proxy.
    pub tls: bool,
    /// Certificate resolver for TLS routers.
    pub cert_resolver: Option<String>,
    /// Domains resources may route on. Empty allows any domain.
    pub verified_domains: Vec<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            network: "dockyard-proxy".to_string(),
            entrypoint: "websecure".to_string(),
            tls: true,
            cert_resolver: Some("letsencrypt".to_string()),
            verified_domains: Vec::new(),
        }
    }
}

/// Validate a routing intent before it is stored.
pub fn validate_routing(routing: &RoutingConfig, settings: &ProxySettings) -> EngineResult<()> {
    let invalid = |msg: String| Err(EngineError::ProxyConfigInvalid(msg));

    let domain = routing.domain.trim_end_matches('.');
    if domain.is_empty() || domain.len() > 253 || !domain.contains('.') {
        return invalid(format!("'{}' is not a valid domain", routing.domain));
    }
    for label in domain.split('.') {
        if let Err(reason) = validate_dns_label(label) {
            return invalid(format!("domain '{}': {}", routing.domain, reason));
        }
    }

    if let Some(sub) = &routing.subdomain
        && let Err(reason) = validate_dns_label(sub)
    {
        return invalid(format!("subdomain '{}': {}", sub, reason));
    }

    if let Some(path) = &routing.path {
        let valid_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.');
        if !path.starts_with('/') || path.contains("//") || !path.chars().all(valid_char) {
            return invalid(format!("'{}' is not a valid path prefix", path));
        }
    }

    if !settings.verified_domains.is_empty()
        && !settings
            .verified_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
    {
        return invalid(format!("domain '{}' is not verified", routing.domain));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing(domain: &str, sub: Option<&str>, path: Option<&str>) -> RoutingConfig {
        RoutingConfig {
            domain: domain.to_string(),
            subdomain: sub.map(String::from),
            path: path.map(String::from),
        }
    }

    #[test]
    fn test_host_and_url() {
        let r = routing("example.com", Some("api"), Some("/v1"));
        assert_eq!(r.host(), "api.example.com");
        assert_eq!(r.public_url(true), "https://api.example.com/v1");
        assert_eq!(routing("example.com", None, None).public_url(false), "http://example.com");
    }

    #[test]
    fn test_validate_routing() {
        let open = ProxySettings::default();
        assert!(validate_routing(&routing("example.com", Some("api"), None), &open).is_ok());
        assert!(validate_routing(&routing("localhost", None, None), &open).is_err());
        assert!(validate_routing(&routing("exa mple.com", None, None), &open).is_err());
        assert!(validate_routing(&routing("example.com", Some("-api"), None), &open).is_err());
        assert!(validate_routing(&routing("example.com", None, Some("v1")), &open).is_err());
        assert!(validate_routing(&routing("example.com", None, Some("/a`b")), &open).is_err());
    }

    #[test]
    fn test_verified_domains_are_enforced() {
        let settings = ProxySettings {
            verified_domains: vec!["example.com".to_string()],
            ..Default::default()
        };
        assert!(validate_routing(&routing("Example.com", Some("api"), None), &settings).is_ok());
        assert!(matches!(
            validate_routing(&routing("other.org", None, None), &settings),
            Err(EngineError::ProxyConfigInvalid(_))
        ));
    }
}
