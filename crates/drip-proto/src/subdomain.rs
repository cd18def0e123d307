//! Subdomain validation and generation.
//!
//! A subdomain is a lowercase DNS label, 3 to 63 characters, that starts and
//! ends with `[a-z0-9]` and contains only `[a-z0-9-]` in between.

use std::collections::HashSet;

use rand::Rng;

const SUBDOMAIN_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Default length of generated subdomain labels.
pub const DEFAULT_SUBDOMAIN_LENGTH: usize = 6;

const DEFAULT_RESERVED: &[&str] = &[
    "www", "api", "admin", "app", "mail", "ftp", "blog", "shop", "status", "health", "test",
    "dev", "staging",
];

/// Check a candidate subdomain against the label grammar.
pub fn validate_subdomain(subdomain: &str) -> bool {
    let bytes = subdomain.as_bytes();
    if bytes.len() < 3 || bytes.len() > 63 {
        return false;
    }
    let inner_ok = bytes
        .iter()
        .all(|&b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    let edge = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    inner_ok && edge(bytes[0]) && edge(bytes[bytes.len() - 1])
}

/// Generate a random label of `length` characters from `[a-z0-9]` using the
/// OS RNG. Zero falls back to the default length.
pub fn generate_subdomain(length: usize) -> String {
    let length = if length == 0 {
        DEFAULT_SUBDOMAIN_LENGTH
    } else {
        length
    };
    let mut rng = rand::rngs::OsRng;
    (0..length)
        .map(|_| SUBDOMAIN_CHARS[rng.gen_range(0..SUBDOMAIN_CHARS.len())] as char)
        .collect()
}

/// The set of labels that may never be assigned to a tunnel.
///
/// Deployments can extend the default set; membership checks are exact.
#[derive(Debug, Clone)]
pub struct ReservedSubdomains {
    labels: HashSet<String>,
}

impl ReservedSubdomains {
    pub fn new() -> Self {
        Self {
            labels: DEFAULT_RESERVED.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Extend the default set with deployment-specific labels.
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        set.labels.extend(extra.into_iter().map(Into::into));
        set
    }

    pub fn contains(&self, subdomain: &str) -> bool {
        self.labels.contains(subdomain)
    }
}

impl Default for ReservedSubdomains {
    fn default() -> Self {
        Self::new()
    }
}
