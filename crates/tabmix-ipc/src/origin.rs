// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Origin derivation and domain-name validation.

use regex::Regex;
use std::sync::OnceLock;
use url::Url;

/// Maximum length of a domain name.
const MAX_DOMAIN_LEN: usize = 253;

fn domain_regex() -> &'static Regex {
    static DOMAIN: OnceLock<Regex> = OnceLock::new();
    DOMAIN.get_or_init(|| {
        // Labels start and end alphanumeric; at least two labels.
        Regex::new(r"^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)+$")
            .expect("static domain regex")
    })
}

/// Derive the origin key for a URL.
///
/// Returns the lowercased host name, or an empty string for URLs without a
/// host (`about:blank`, `data:` and unparseable input).
pub fn origin_from_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_end_matches('.').to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Check an origin against the strict domain-name grammar.
///
/// Rejects leading or trailing dots and hyphens, doubled dots, and names
/// without at least one dot.
pub fn is_valid_origin(origin: &str) -> bool {
    if origin.is_empty() || origin.len() > MAX_DOMAIN_LEN {
        return false;
    }
    domain_regex().is_match(&origin.to_ascii_lowercase())
}
