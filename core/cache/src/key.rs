//! Cache key normalization.

/// Normalize a request URL to its cache key: path plus query string.
///
/// Scheme, host, port and fragment are dropped so the same resource maps to
/// one key whichever endpoint served it.
pub fn cache_key(url: &str) -> String {
    let without_origin = match url.find("://") {
        Some(scheme_end) => {
            let rest = &url[scheme_end + 3..];
            match rest.find(['/', '?']) {
                Some(i) => &rest[i..],
                None => "",
            }
        }
        None => url,
    };

    let without_fragment = without_origin
        .split('#')
        .next()
        .unwrap_or(without_origin);
    let trimmed = without_fragment.strip_suffix('?').unwrap_or(without_fragment);

    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Path component of a cache key.
pub fn key_path(key: &str) -> &str {
    key.split('?').next().unwrap_or(key)
}
