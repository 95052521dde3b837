//! Capability registry: aggregates tools, resources and prompts across all
//! backend servers.
//!
//! Provides:
//! - Namespaced lookup (`server__name`)
//! - Secondary indices by server, original name and category
//! - Atomic per-server replacement: every mutation builds a complete new
//!   [`RegistrySnapshot`] and swaps it in with one pointer store, so readers
//!   see either the old or the new set and never a mix
//! - Fuzzy name resolution for callers that get a name slightly wrong

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use super::types::{CapabilityDescriptor, CapabilityKind, NAMESPACE_DELIMITER};

/// Build the namespaced identifier for a capability.
pub fn namespaced_id(server: &str, original: &str) -> String {
    format!("{server}{NAMESPACE_DELIMITER}{original}")
}

/// Split a namespaced identifier into `(server, original)`.
///
/// Server names never contain the delimiter, so the first occurrence is
/// the boundary even when the original name contains it.
pub fn split_id(id: &str) -> Option<(&str, &str)> {
    id.split_once(NAMESPACE_DELIMITER)
        .filter(|(server, original)| !server.is_empty() && !original.is_empty())
}

// ─── Entries ─────────────────────────────────────────────────────────────────

/// Usage counters. Shared between snapshots so that recording a call does
/// not require a registry swap, and carried over when a server re-registers.
#[derive(Debug, Default)]
pub struct UsageStats {
    count: AtomicU64,
    last_used: Mutex<Option<DateTime<Utc>>>,
}

impl UsageStats {
    fn record(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_used.lock() {
            *last = Some(Utc::now());
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn last_used(&self) -> Option<DateTime<Utc>> {
        self.last_used.lock().ok().and_then(|l| *l)
    }
}

impl Serialize for UsageStats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct View {
            usage_count: u64,
            last_used: Option<DateTime<Utc>>,
        }
        View {
            usage_count: self.count(),
            last_used: self.last_used(),
        }
        .serialize(serializer)
    }
}

/// One registered tool, resource or prompt.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityEntry {
    /// `<server>__<original_name>`; unique across the registry.
    pub id: String,
    pub kind: CapabilityKind,
    pub server: String,
    pub original_name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub category: Option<String>,
    #[serde(flatten)]
    usage: Arc<UsageStats>,
}

impl CapabilityEntry {
    fn new(server: &str, descriptor: CapabilityDescriptor, usage: Arc<UsageStats>) -> Self {
        Self {
            id: namespaced_id(server, &descriptor.name),
            kind: descriptor.kind,
            server: server.to_string(),
            original_name: descriptor.name,
            description: descriptor.description,
            input_schema: descriptor.input_schema,
            category: descriptor.category,
            usage,
        }
    }

    pub fn usage_count(&self) -> u64 {
        self.usage.count()
    }

    pub fn last_used(&self) -> Option<DateTime<Utc>> {
        self.usage.last_used()
    }
}

// ─── Filter ──────────────────────────────────────────────────────────────────

/// Criteria for listing capabilities. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct CapabilityFilter {
    pub server: Option<String>,
    pub kind: Option<CapabilityKind>,
    pub category: Option<String>,
    /// Case-insensitive substring of the id or description.
    pub query: Option<String>,
}

impl CapabilityFilter {
    pub fn server(name: &str) -> Self {
        Self {
            server: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn kind(kind: CapabilityKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    fn matches(&self, entry: &CapabilityEntry) -> bool {
        if self.server.as_deref().is_some_and(|s| s != entry.server) {
            return false;
        }
        if self.kind.is_some_and(|k| k != entry.kind) {
            return false;
        }
        if let Some(category) = &self.category {
            if entry.category.as_deref() != Some(category.as_str()) {
                return false;
            }
        }
        if let Some(query) = &self.query {
            let q = query.to_lowercase();
            if !entry.id.to_lowercase().contains(&q)
                && !entry.description.to_lowercase().contains(&q)
            {
                return false;
            }
        }
        true
    }
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// Immutable view of every registered capability plus its indices.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    version: u64,
    entries: BTreeMap<String, Arc<CapabilityEntry>>,
    by_server: BTreeMap<String, Vec<String>>,
    by_original: BTreeMap<String, Vec<String>>,
    by_category: BTreeMap<String, Vec<String>>,
}

impl RegistrySnapshot {
    fn build(version: u64, entries: BTreeMap<String, Arc<CapabilityEntry>>) -> Self {
        let mut by_server: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut by_original: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut by_category: BTreeMap<String, Vec<String>> = BTreeMap::new();

        // BTreeMap iteration is ordered by id, so every index list is sorted too.
        for (id, entry) in &entries {
            by_server
                .entry(entry.server.clone())
                .or_default()
                .push(id.clone());
            by_original
                .entry(entry.original_name.clone())
                .or_default()
                .push(id.clone());
            if let Some(category) = &entry.category {
                by_category
                    .entry(category.clone())
                    .or_default()
                    .push(id.clone());
            }
        }

        Self {
            version,
            entries,
            by_server,
            by_original,
            by_category,
        }
    }

    /// Monotonic counter bumped on every swap.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, id: &str) -> Option<&Arc<CapabilityEntry>> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of every server with at least one capability, sorted.
    pub fn servers(&self) -> Vec<&str> {
        self.by_server.keys().map(String::as_str).collect()
    }

    /// Capabilities owned by one server, ordered by id.
    pub fn for_server(&self, server: &str) -> Vec<Arc<CapabilityEntry>> {
        self.collect_ids(self.by_server.get(server))
    }

    /// Capabilities sharing an original name, across servers.
    pub fn by_original_name(&self, name: &str) -> Vec<Arc<CapabilityEntry>> {
        self.collect_ids(self.by_original.get(name))
    }

    pub fn by_category(&self, category: &str) -> Vec<Arc<CapabilityEntry>> {
        self.collect_ids(self.by_category.get(category))
    }

    /// Original names published by more than one server.
    pub fn collisions(&self) -> BTreeMap<&str, Vec<&str>> {
        self.by_original
            .iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(name, ids)| {
                let servers = ids
                    .iter()
                    .filter_map(|id| self.entries.get(id))
                    .map(|e| e.server.as_str())
                    .collect();
                (name.as_str(), servers)
            })
            .collect()
    }

    /// Filtered listing in id order.
    pub fn list(&self, filter: &CapabilityFilter) -> Vec<Arc<CapabilityEntry>> {
        let candidates: Box<dyn Iterator<Item = &Arc<CapabilityEntry>> + '_> = match &filter.server {
            Some(server) => Box::new(
                self.by_server
                    .get(server)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| self.entries.get(id)),
            ),
            None => Box::new(self.entries.values()),
        };
        candidates
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect()
    }

    /// Check that every index points at a live entry that agrees with it and
    /// that every entry is reachable from its indices.
    pub fn is_consistent(&self) -> bool {
        let indexed = |index: &BTreeMap<String, Vec<String>>, key_of: &dyn Fn(&CapabilityEntry) -> Option<String>| {
            index.iter().all(|(key, ids)| {
                !ids.is_empty()
                    && ids.iter().all(|id| {
                        self.entries
                            .get(id)
                            .is_some_and(|e| key_of(e).as_deref() == Some(key.as_str()))
                    })
            })
        };
        let servers_ok = indexed(&self.by_server, &|e| Some(e.server.clone()));
        let originals_ok = indexed(&self.by_original, &|e| Some(e.original_name.clone()));
        let categories_ok = indexed(&self.by_category, &|e| e.category.clone());

        let server_count: usize = self.by_server.values().map(Vec::len).sum();
        let original_count: usize = self.by_original.values().map(Vec::len).sum();
        let ids_match = self
            .entries
            .iter()
            .all(|(id, e)| *id == namespaced_id(&e.server, &e.original_name));

        servers_ok
            && originals_ok
            && categories_ok
            && ids_match
            && server_count == self.entries.len()
            && original_count == self.entries.len()
    }

    fn collect_ids(&self, ids: Option<&Vec<String>>) -> Vec<Arc<CapabilityEntry>> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Registry shared by every connection.
///
/// Reads take the read lock only long enough to clone the current `Arc`.
/// Writers serialize on a separate mutex while building the next snapshot.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    writer: Mutex<()>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot. Cheap; hold it as long as a consistent view is needed.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace every capability owned by `server` in one step.
    ///
    /// Returns the number of entries now registered for the server. Usage
    /// statistics of ids that survive the replacement are kept.
    pub fn register_server(&self, server: &str, capabilities: Vec<CapabilityDescriptor>) -> usize {
        self.mutate(|previous| {
            let mut entries: BTreeMap<String, Arc<CapabilityEntry>> = previous
                .entries
                .iter()
                .filter(|(_, e)| e.server != server)
                .map(|(id, e)| (id.clone(), Arc::clone(e)))
                .collect();

            let mut added = 0;
            for descriptor in capabilities {
                let id = namespaced_id(server, &descriptor.name);
                if entries.contains_key(&id) {
                    tracing::warn!(server, id = %id, kind = ?descriptor.kind, "duplicate capability name, keeping first");
                    continue;
                }
                let usage = previous
                    .entries
                    .get(&id)
                    .map(|e| Arc::clone(&e.usage))
                    .unwrap_or_default();
                entries.insert(id, Arc::new(CapabilityEntry::new(server, descriptor, usage)));
                added += 1;
            }
            (entries, added)
        })
    }

    /// Remove every capability owned by `server`. Returns how many went away.
    pub fn unregister_server(&self, server: &str) -> usize {
        self.mutate(|previous| {
            let before = previous.entries.len();
            let entries: BTreeMap<_, _> = previous
                .entries
                .iter()
                .filter(|(_, e)| e.server != server)
                .map(|(id, e)| (id.clone(), Arc::clone(e)))
                .collect();
            let removed = before - entries.len();
            (entries, removed)
        })
    }

    /// Bump the usage counter of an entry. Returns false for unknown ids.
    pub fn record_usage(&self, id: &str) -> bool {
        match self.snapshot().get(id) {
            Some(entry) => {
                entry.usage.record();
                true
            }
            None => false,
        }
    }

    pub fn list(&self, filter: &CapabilityFilter) -> Vec<Arc<CapabilityEntry>> {
        self.snapshot().list(filter)
    }

    fn mutate<F>(&self, build: F) -> usize
    where
        F: FnOnce(&RegistrySnapshot) -> (BTreeMap<String, Arc<CapabilityEntry>>, usize),
    {
        let _writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let previous = self.snapshot();
        let (entries, count) = build(&previous);
        let next = Arc::new(RegistrySnapshot::build(previous.version + 1, entries));
        tracing::debug!(version = next.version, total = next.len(), "registry snapshot swapped");
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        count
    }
}

// ─── Name Resolution ─────────────────────────────────────────────────────────

/// How a possibly-wrong tool name was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The name is a registered id.
    Exact(String),
    /// A bare original name that exactly one server publishes.
    Unprefixed { resolved: String, original: String },
    /// A namespaced name that does not exist; the closest tool on the same
    /// server was picked by edit distance.
    Corrected {
        resolved: String,
        original: String,
        score: f64,
    },
    /// A bare name published by several servers.
    Ambiguous {
        original: String,
        candidates: Vec<String>,
    },
    /// Nothing close enough. `suggestions` holds up to three near misses.
    NotFound {
        original: String,
        suggestions: Vec<String>,
    },
}

impl Resolution {
    pub fn resolved_id(&self) -> Option<&str> {
        match self {
            Self::Exact(id) => Some(id),
            Self::Unprefixed { resolved, .. } | Self::Corrected { resolved, .. } => Some(resolved),
            Self::Ambiguous { .. } | Self::NotFound { .. } => None,
        }
    }
}

impl RegistrySnapshot {
    /// Resolve a tool name that may be unprefixed or slightly wrong.
    ///
    /// First match wins: exact id, unique bare name, closest same-server
    /// tool at or above `min_similarity`, not found.
    pub fn resolve_tool(&self, name: &str, min_similarity: f64) -> Resolution {
        if self
            .entries
            .get(name)
            .is_some_and(|e| e.kind == CapabilityKind::Tool)
        {
            return Resolution::Exact(name.to_string());
        }

        let Some((server, suffix)) = split_id(name) else {
            let candidates: Vec<String> = self
                .by_original_name(name)
                .into_iter()
                .filter(|e| e.kind == CapabilityKind::Tool)
                .map(|e| e.id.clone())
                .collect();
            return match candidates.len() {
                0 => Resolution::NotFound {
                    original: name.to_string(),
                    suggestions: self.find_similar(name, 3),
                },
                1 => Resolution::Unprefixed {
                    resolved: candidates[0].clone(),
                    original: name.to_string(),
                },
                _ => Resolution::Ambiguous {
                    original: name.to_string(),
                    candidates,
                },
            };
        };

        let best = self
            .for_server(server)
            .into_iter()
            .filter(|e| e.kind == CapabilityKind::Tool)
            .map(|e| {
                let score = similarity(suffix, &e.original_name);
                (e.id.clone(), score)
            })
            .filter(|(_, score)| *score >= min_similarity)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((resolved, score)) => Resolution::Corrected {
                resolved,
                original: name.to_string(),
                score,
            },
            None => Resolution::NotFound {
                original: name.to_string(),
                suggestions: self.find_similar(name, 3),
            },
        }
    }

    /// Up to `max_results` tool ids whose original names resemble `name`.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let query = split_id(name).map(|(_, original)| original).unwrap_or(name);

        let mut scored: Vec<(&str, f64)> = self
            .entries
            .values()
            .filter(|e| e.kind == CapabilityKind::Tool)
            .map(|e| (e.id.as_str(), similarity(query, &e.original_name)))
            .filter(|(_, score)| *score > 0.3)
            .collect();

        // Stable sort keeps id order among equal scores.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(max_results)
            .map(|(id, _)| id.to_string())
            .collect()
    }
}

// ─── Edit Distance ───────────────────────────────────────────────────────────

/// Levenshtein distance over chars.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// 1.0 for identical strings, 0.0 for nothing in common.
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn tool(name: &str) -> CapabilityDescriptor {
        CapabilityDescriptor {
            kind: CapabilityKind::Tool,
            name: name.to_string(),
            description: format!("Test tool: {name}"),
            input_schema: serde_json::json!({"type": "object"}),
            category: None,
        }
    }

    fn categorized(name: &str, category: &str) -> CapabilityDescriptor {
        CapabilityDescriptor {
            category: Some(category.to_string()),
            ..tool(name)
        }
    }

    fn build_registry() -> CapabilityRegistry {
        let registry = CapabilityRegistry::new();
        registry.register_server(
            "filesystem",
            vec![
                categorized("list_dir", "files"),
                categorized("read_file", "files"),
                categorized("write_file", "files"),
                tool("move_file"),
                tool("search"),
            ],
        );
        registry.register_server("web", vec![tool("search"), tool("fetch_page")]);
        registry
    }

    #[test]
    fn test_ids_are_namespaced_and_unique() {
        let registry = build_registry();
        let snap = registry.snapshot();
        assert_eq!(snap.len(), 7);
        assert!(snap.get("filesystem__search").is_some());
        assert!(snap.get("web__search").is_some());
        let ids: BTreeSet<_> = snap.list(&CapabilityFilter::default()).iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids.len(), snap.len());
        assert!(snap.is_consistent());
    }

    #[test]
    fn test_split_id_uses_first_delimiter() {
        assert_eq!(split_id("fs__read__all"), Some(("fs", "read__all")));
        assert_eq!(split_id("plain"), None);
        assert_eq!(split_id("__x"), None);
    }

    #[test]
    fn test_register_replaces_previous_set() {
        let registry = build_registry();
        registry.register_server("filesystem", vec![tool("stat")]);
        let snap = registry.snapshot();
        assert_eq!(snap.for_server("filesystem").len(), 1);
        assert!(snap.get("filesystem__read_file").is_none());
        assert!(snap.by_category("files").is_empty());
        assert!(snap.is_consistent());
    }

    #[test]
    fn test_unregister_leaves_no_dangling_indices() {
        let registry = build_registry();
        let removed = registry.unregister_server("filesystem");
        assert_eq!(removed, 5);

        let snap = registry.snapshot();
        assert!(snap.for_server("filesystem").is_empty());
        assert!(snap
            .list(&CapabilityFilter::default())
            .iter()
            .all(|e| e.server != "filesystem"));
        assert_eq!(snap.by_original_name("search").len(), 1);
        assert!(snap.by_category("files").is_empty());
        assert_eq!(snap.servers(), vec!["web"]);
        assert!(snap.is_consistent());
    }

    #[test]
    fn test_old_snapshot_unaffected_by_swap() {
        let registry = build_registry();
        let before = registry.snapshot();
        registry.unregister_server("web");
        assert_eq!(before.len(), 7);
        assert_eq!(registry.snapshot().len(), 5);
        assert!(registry.snapshot().version() > before.version());
    }

    #[test]
    fn test_listing_is_sorted_and_filtered() {
        let registry = build_registry();
        let all = registry.list(&CapabilityFilter::default());
        let ids: Vec<_> = all.iter().map(|e| e.id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);

        let web = registry.list(&CapabilityFilter::server("web"));
        assert_eq!(web.len(), 2);

        let files = registry.list(&CapabilityFilter {
            category: Some("files".into()),
            ..CapabilityFilter::default()
        });
        assert_eq!(files.len(), 3);

        let query = registry.list(&CapabilityFilter {
            query: Some("FETCH".into()),
            ..CapabilityFilter::default()
        });
        assert_eq!(query.len(), 1);
        assert_eq!(query[0].id, "web__fetch_page");
    }

    #[test]
    fn test_collisions_reported() {
        let registry = build_registry();
        let snap = registry.snapshot();
        let collisions = snap.collisions();
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions["search"], vec!["filesystem", "web"]);
    }

    #[test]
    fn test_usage_survives_reregistration() {
        let registry = build_registry();
        assert!(registry.record_usage("web__search"));
        assert!(registry.record_usage("web__search"));
        assert!(!registry.record_usage("web__ghost"));

        registry.register_server("web", vec![tool("search")]);
        let snap = registry.snapshot();
        let entry = snap.get("web__search").unwrap();
        assert_eq!(entry.usage_count(), 2);
        assert!(entry.last_used().is_some());

        let json = serde_json::to_value(entry.as_ref()).unwrap();
        assert_eq!(json["usage_count"], 2);
    }

    #[test]
    fn test_entry_serializes_usage_inline() {
        let registry = build_registry();
        let snap = registry.snapshot();
        let json = serde_json::to_value(snap.get("web__search").unwrap().as_ref()).unwrap();
        assert_eq!(json["id"], "web__search");
        assert_eq!(json["usage_count"], 0);
        assert!(json["last_used"].is_null());
        assert!(json.get("usage").is_none());
    }

    #[test]
    fn test_duplicate_names_keep_first() {
        let registry = CapabilityRegistry::new();
        let mut prompt = tool("summarize");
        prompt.kind = CapabilityKind::Prompt;
        let count = registry.register_server("llm", vec![tool("summarize"), prompt]);
        assert_eq!(count, 1);
        let snap = registry.snapshot();
        assert_eq!(snap.get("llm__summarize").unwrap().kind, CapabilityKind::Tool);
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
        assert!((similarity("", "") - 1.0).abs() < f64::EPSILON);
        assert!(similarity("abc", "xyz") < 0.5);
    }

    #[test]
    fn test_resolve_exact_and_unprefixed() {
        let snap = build_registry().snapshot();
        assert_eq!(
            snap.resolve_tool("filesystem__list_dir", 0.5),
            Resolution::Exact("filesystem__list_dir".into())
        );
        let res = snap.resolve_tool("move_file", 0.5);
        assert_eq!(res.resolved_id(), Some("filesystem__move_file"));
    }

    #[test]
    fn test_resolve_ambiguous_bare_name() {
        let snap = build_registry().snapshot();
        match snap.resolve_tool("search", 0.5) {
            Resolution::Ambiguous { candidates, .. } => {
                assert_eq!(candidates, vec!["filesystem__search", "web__search"]);
            }
            other => panic!("expected Ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_corrected_same_server() {
        let snap = build_registry().snapshot();
        match snap.resolve_tool("filesystem__read_files", 0.5) {
            Resolution::Corrected { resolved, score, .. } => {
                assert_eq!(resolved, "filesystem__read_file");
                assert!(score > 0.8);
            }
            other => panic!("expected Corrected, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_not_found_with_suggestions() {
        let snap = build_registry().snapshot();
        let res = snap.resolve_tool("ghost__read_fil", 0.5);
        match res {
            Resolution::NotFound { suggestions, .. } => {
                assert_eq!(suggestions.first().map(String::as_str), Some("filesystem__read_file"));
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
        assert!(snap.resolve_tool("zzzzzzzz", 0.5).resolved_id().is_none());
    }
}
