//! DNS provider selection for acme.sh DNS-01 challenges
//!
//! Both the queuing path and the provisioning run resolve providers through
//! [`normalize`], so a zone registered with the default provider is later
//! issued with the very same slug.

use crate::types::{AcmeError, AcmeResult};
use std::fmt;

/// Slug used when nothing is configured
pub const DEFAULT_PROVIDER: &str = "dns_hetzner";

/// Alias → canonical acme.sh DNS API slug
const ALIASES: &[(&str, &str)] = &[
    ("hetzner", "dns_hetzner"),
    ("dns_hetzner", "dns_hetzner"),
    ("cloudflare", "dns_cf"),
    ("cf", "dns_cf"),
    ("dns_cf", "dns_cf"),
    ("route53", "dns_aws"),
    ("aws", "dns_aws"),
    ("dns_aws", "dns_aws"),
    ("digitalocean", "dns_dgon"),
    ("dns_dgon", "dns_dgon"),
    ("gandi", "dns_gandi_livedns"),
    ("dns_gandi_livedns", "dns_gandi_livedns"),
    ("inwx", "dns_inwx"),
    ("dns_inwx", "dns_inwx"),
    ("ovh", "dns_ovh"),
    ("dns_ovh", "dns_ovh"),
];

/// Canonical provider slug understood by the ACME client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderSlug(&'static str);

impl ProviderSlug {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl Default for ProviderSlug {
    fn default() -> Self {
        Self(DEFAULT_PROVIDER)
    }
}

impl fmt::Display for ProviderSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Normalize a loosely specified provider name.
///
/// `None` and blank input yield [`DEFAULT_PROVIDER`]; unknown names are rejected.
pub fn normalize(raw: Option<&str>) -> AcmeResult<ProviderSlug> {
    let candidate = raw.map(|v| v.trim().to_ascii_lowercase()).unwrap_or_default();
    if candidate.is_empty() {
        return Ok(ProviderSlug::default());
    }

    ALIASES
        .iter()
        .find(|(alias, _)| *alias == candidate)
        .map(|(_, slug)| ProviderSlug(*slug))
        .ok_or_else(|| AcmeError::UnsupportedProvider(candidate))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_when_missing_or_blank() {
        assert_eq!(normalize(None).unwrap().as_str(), "dns_hetzner");
        assert_eq!(normalize(Some("")).unwrap(), normalize(None).unwrap());
        assert_eq!(normalize(Some("   ")).unwrap(), ProviderSlug::default());
    }

    #[test]
    fn test_aliases_map_to_canonical_slugs() {
        assert_eq!(normalize(Some("hetzner")).unwrap().as_str(), "dns_hetzner");
        assert_eq!(normalize(Some("cloudflare")).unwrap().as_str(), "dns_cf");
        assert_eq!(normalize(Some("CLOUDflare")).unwrap().as_str(), "dns_cf");
        assert_eq!(normalize(Some(" dns_cf ")).unwrap().as_str(), "dns_cf");
        assert_eq!(normalize(Some("Route53")).unwrap().as_str(), "dns_aws");
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        match normalize(Some("carrier-pigeon")) {
            Err(AcmeError::UnsupportedProvider(name)) => assert_eq!(name, "carrier-pigeon"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_every_canonical_slug_is_accepted_as_is() {
        for (_, slug) in ALIASES {
            assert_eq!(normalize(Some(*slug)).unwrap().as_str(), *slug);
        }
    }
}
