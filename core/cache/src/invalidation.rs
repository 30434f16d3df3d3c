//! Cache keys affected by a mutation.

use fiscalgate_common::HttpMethod;

use crate::key::{cache_key, key_path};

/// Resources whose cached views also embed another resource.
const DEPENDENTS: &[(&str, &[&str])] = &[
    ("receipts", &["/mf1/point-of-sales/*/receipts*"]),
    ("cashiers", &["/mf1/point-of-sales/*/cashiers*"]),
    ("merchants", &["/mf1/merchants*", "/mf2/merchants*"]),
    ("suppliers", &["/mf1/suppliers*", "/mf2/suppliers*"]),
];

fn is_api_version(segment: &str) -> bool {
    segment.len() > 2
        && segment.starts_with("mf")
        && segment[2..].chars().all(|c| c.is_ascii_digit())
}

/// Glob patterns of cache keys made stale by a successful mutating call.
///
/// A mutation anywhere under a collection invalidates every list and detail
/// key of that collection, e.g. `POST /mf1/receipts` and
/// `POST /mf1/receipts/{id}/return` both yield `/mf1/receipts*`.
/// Reads yield nothing.
pub fn patterns_for_mutation(url: &str, method: HttpMethod) -> Vec<String> {
    if !method.is_mutating() {
        return Vec::new();
    }

    let key = cache_key(url);
    let segments: Vec<&str> = key_path(&key)
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let (collection, resource) = match segments.as_slice() {
        [] => return Vec::new(),
        [version, resource, ..] if is_api_version(version) => {
            (format!("/{}/{}", version, resource), *resource)
        }
        [resource, ..] => (format!("/{}", resource), *resource),
    };

    let mut patterns = vec![format!("{}*", collection)];
    let mut touched = vec![resource];

    // Nested collections such as /mf1/point-of-sales/{id}/receipts.
    if segments.len() >= 4 {
        let nested = segments[segments.len() - 1];
        if nested != resource && DEPENDENTS.iter().any(|(name, _)| *name == nested) {
            touched.push(nested);
        }
    }

    for (name, dependents) in DEPENDENTS {
        if touched.contains(name) {
            for dependent in dependents.iter() {
                patterns.push(dependent.to_string());
            }
        }
    }

    patterns.sort();
    patterns.dedup();
    patterns
}
