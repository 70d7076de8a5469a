//! Registrable zone derivation for wildcard certificates
//!
//! A wildcard certificate covers `<zone>` and `*.<zone>`, so every host must
//! collapse onto the same registrable domain. The resolver ships a small table
//! of multi-label public suffixes and can be extended with rules in public
//! suffix list format (exact, `*.` wildcard and `!` exception rules).

use crate::types::{AcmeError, AcmeResult};
use std::collections::HashSet;
use std::path::Path;

const MAX_HOST_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Second-level registry labels under country-code TLDs
const BUILTIN_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "me.uk", "ltd.uk", "plc.uk", "net.uk", "ac.uk", "gov.uk", "sch.uk",
    "com.au", "net.au", "org.au", "edu.au", "gov.au", "id.au", "asn.au",
    "co.nz", "net.nz", "org.nz", "ac.nz", "govt.nz",
    "co.jp", "ne.jp", "or.jp", "ac.jp", "go.jp",
    "co.za", "org.za", "net.za", "gov.za",
    "com.br", "net.br", "org.br", "gov.br",
    "com.mx", "org.mx", "gob.mx",
    "com.ar", "com.tr", "org.tr",
    "com.cn", "net.cn", "org.cn", "gov.cn",
    "co.in", "net.in", "org.in", "firm.in",
    "co.il", "org.il", "ac.il",
    "co.kr", "or.kr",
    "com.sg", "com.hk", "com.tw", "com.my",
    "co.at", "or.at",
    "com.pl", "com.es", "com.ua", "co.id",
];

/// Normalize a configured host: lower-case, without scheme, path, credentials,
/// port or trailing dot. Internationalized labels come back as punycode.
pub fn normalize_host(raw: &str) -> AcmeResult<String> {
    let invalid = || AcmeError::InvalidHost(raw.trim().to_string());

    let mut host = raw.trim().to_ascii_lowercase();
    if let Some((_, rest)) = host.split_once("://") {
        host = rest.to_string();
    }
    if let Some(end) = host.find(['/', '?', '#']) {
        host.truncate(end);
    }
    if let Some((_, rest)) = host.rsplit_once('@') {
        host = rest.to_string();
    }
    if host.starts_with('[') {
        return Err(invalid());
    }
    if let Some((name, _port)) = host.split_once(':') {
        host = name.to_string();
    }
    let host = host.trim_start_matches("*.").trim_end_matches('.');
    let host = if host.is_ascii() {
        host.to_string()
    } else {
        idna::domain_to_ascii_strict(host).map_err(|_| invalid())?
    };

    if host.is_empty() || host.len() > MAX_HOST_LEN || !host.contains('.') {
        return Err(invalid());
    }

    let labels: Vec<&str> = host.split('.').collect();
    if !labels.iter().all(|label| is_valid_label(label)) {
        return Err(invalid());
    }
    // IPv4 literals have no zone
    if labels.last().is_some_and(|tld| tld.chars().all(|c| c.is_ascii_digit())) {
        return Err(invalid());
    }

    Ok(host)
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !label.starts_with('-')
        && !label.ends_with('-')
}

/// Maps hosts to the registrable zone a wildcard certificate covers
#[derive(Debug, Clone)]
pub struct ZoneResolver {
    exact: HashSet<String>,
    /// Stored without the leading `*.`
    wildcard: HashSet<String>,
    /// Stored without the leading `!`
    exception: HashSet<String>,
}

impl Default for ZoneResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoneResolver {
    /// Resolver with the built-in multi-label suffixes only
    pub fn new() -> Self {
        Self {
            exact: BUILTIN_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            wildcard: HashSet::new(),
            exception: HashSet::new(),
        }
    }

    /// Built-in suffixes extended by a public suffix list file
    pub fn from_psl_file<P: AsRef<Path>>(path: P) -> AcmeResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::new().with_rules(&content))
    }

    /// Add rules in public suffix list format
    pub fn with_rules(mut self, rules: &str) -> Self {
        for line in rules.lines() {
            let Some(rule) = line.split_whitespace().next() else {
                continue;
            };
            if rule.starts_with("//") {
                continue;
            }

            if let Some(exception) = rule.strip_prefix('!') {
                self.exception.extend(rule_to_ascii(exception));
            } else if let Some(parent) = rule.strip_prefix("*.") {
                self.wildcard.extend(rule_to_ascii(parent));
            } else {
                self.exact.extend(rule_to_ascii(rule));
            }
        }
        self
    }

    /// Number of loaded suffix rules
    pub fn rule_count(&self) -> usize {
        self.exact.len() + self.wildcard.len() + self.exception.len()
    }

    /// Derive the registrable zone of `host`
    pub fn derive_zone(&self, host: &str) -> AcmeResult<String> {
        let normalized = normalize_host(host)?;
        let labels: Vec<&str> = normalized.split('.').collect();
        let suffix_len = self.public_suffix_len(&labels);

        if labels.len() <= suffix_len {
            return Err(AcmeError::InvalidHost(normalized));
        }

        Ok(labels[labels.len() - suffix_len - 1..].join("."))
    }

    /// Number of trailing labels forming the public suffix
    fn public_suffix_len(&self, labels: &[&str]) -> usize {
        let n = labels.len();

        // Exception rules win and drop their leftmost label
        for i in 0..n {
            if self.exception.contains(&labels[i..].join(".")) {
                return n - i - 1;
            }
        }

        for i in 0..n {
            if self.exact.contains(&labels[i..].join(".")) {
                return n - i;
            }
            if i + 1 < n && self.wildcard.contains(&labels[i + 1..].join(".")) {
                return n - i;
            }
        }

        1
    }
}

/// Suffix rules are matched against punycode hosts
fn rule_to_ascii(rule: &str) -> Option<String> {
    if rule.is_ascii() {
        return Some(rule.to_ascii_lowercase());
    }
    idna::domain_to_ascii_strict(rule).ok()
}
