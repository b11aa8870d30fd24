//! Content fingerprints used to identify articles and recognize redelivered events.
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use crate::types::Stage;

/// Number of hex characters kept by `short_hash`.
const SHORT_HASH_LEN: usize = 8;

/// Returned by `extract_domain` when the URL has no usable host.
pub const UNKNOWN_DOMAIN: &str = "unknown";

const WWW_PREFIX: &str = "www.";

/// Separates the components of an idempotency key. The timestamp is always the last component,
/// so a key can be split back with `splitn(4, ':')`.
pub const IDEMPOTENCY_KEY_SEPARATOR: &str = ":";

/// Full SHA-256 hex digest of the raw URL bytes.
pub fn hash_url(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// First 8 hex characters of `hash_url`. Only used inside idempotency keys; storage-level
/// uniqueness always uses the full digest.
pub fn short_hash(url: &str) -> String {
    let mut digest = hash_url(url);
    digest.truncate(SHORT_HASH_LEN);
    digest
}

/// Hostname of `url` with one leading `www.` removed, or `"unknown"` if the URL can't be parsed
/// or has no usable host. Scheme-relative URLs (`//host/path`) are read as `http`, and IPv6
/// literals are returned without brackets.
pub fn extract_domain(url: &str) -> String {
    let parsed = match url.strip_prefix("//") {
        Some(rest) => url::Url::parse(&format!("http://{rest}")),
        None => url::Url::parse(url),
    };
    let Ok(parsed) = parsed else {
        return UNKNOWN_DOMAIN.to_owned();
    };

    let host = match parsed.host() {
        Some(url::Host::Domain(domain)) => domain.to_owned(),
        Some(url::Host::Ipv4(addr)) => addr.to_string(),
        Some(url::Host::Ipv6(addr)) => addr.to_string(),
        None => return UNKNOWN_DOMAIN.to_owned(),
    };

    match host.strip_prefix(WWW_PREFIX).unwrap_or(&host) {
        "" => UNKNOWN_DOMAIN.to_owned(),
        domain => domain.to_owned(),
    }
}

/// Deterministic key for one logical event: `{service}:{stage}:{short_hash}:{occurred_at}`.
///
/// `occurred_at` is rendered as RFC 3339 with second precision, so a redelivery of the same event
/// maps to the same key while a genuine re-crawl at a different time gets a new one.
pub fn derive_idempotency_key(
    service_name: &str,
    stage: Stage,
    url: &str,
    occurred_at: DateTime<Utc>,
) -> String {
    [
        service_name,
        stage.as_str(),
        &short_hash(url),
        &occurred_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    ]
    .join(IDEMPOTENCY_KEY_SEPARATOR)
}
