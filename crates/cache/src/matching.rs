//! Key comparison rules
//!
//! A hit is exact when the returned key equals the requested one ignoring
//! letter case. Accents still count: `é` and `e` differ.

use cachenix_remote::CacheEntry;

/// Whether `requested` and `returned` name the same cache entry
#[must_use]
pub fn is_exact_match(requested: &str, returned: &str) -> bool {
    requested
        .chars()
        .flat_map(char::to_lowercase)
        .eq(returned.chars().flat_map(char::to_lowercase))
}

/// Whether `key` falls under the restore or purge `prefix`
#[must_use]
pub fn matches_prefix(key: &str, prefix: &str) -> bool {
    key.starts_with(prefix)
}

/// Newest entry first; entries without a creation time sort last
pub fn sort_newest_first(entries: &mut [CacheEntry]) {
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

/// Drop entries whose key was already seen, keeping the first
#[must_use]
pub fn dedup_by_key(entries: Vec<CacheEntry>) -> Vec<CacheEntry> {
    let mut seen = std::collections::HashSet::new();
    entries
        .into_iter()
        .filter(|entry| seen.insert(entry.key.clone()))
        .collect()
}
