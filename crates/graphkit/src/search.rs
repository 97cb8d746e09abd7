//! Structural / semantic / hybrid search with a TTL-bounded LRU cache (C6,
//! spec §4.6).
//!
//! The fuzzy matcher's Levenshtein distance follows the same
//! dynamic-programming shape as the teacher's
//! `dashflow-streaming/src/evals/dataset.rs::levenshtein_distance`.

use crate::entity_store::{EntityStore, ListParams};
use crate::error::Result;
use crate::model::Entity;
use crate::store::vector::{SearchOpts as VectorSearchOpts, VectorHit, VectorStore};
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default result limit for structural search (spec §4.6).
pub const DEFAULT_STRUCTURAL_LIMIT: usize = 50;
/// Fuzzy match acceptance threshold (spec §4.6).
pub const FUZZY_THRESHOLD: f64 = 0.6;
/// A filter predicate with strictly more than this many clauses routes to
/// structural search (spec §4.6 Open Question, resolved as a named
/// constant rather than a magic number at the call site).
pub const STRUCTURAL_FILTER_ARITY: usize = 2;
/// Cache capacity (spec §4.6).
pub const CACHE_CAPACITY: usize = 500;
/// Cache entry TTL (spec §4.6).
pub const CACHE_TTL: Duration = Duration::from_secs(300);

/// Explicit strategy selection, overriding the heuristic (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Structural,
    Semantic,
    Hybrid,
}

/// Search request (spec §4.6).
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub strategy: Option<Strategy>,
    pub fuzzy: bool,
    pub filter_arity: usize,
    pub limit: usize,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query: String::new(),
            strategy: None,
            fuzzy: false,
            filter_arity: 0,
            limit: DEFAULT_STRUCTURAL_LIMIT,
        }
    }
}

/// One ranked search result, strategy-agnostic.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    pub entity_id: String,
    pub score: f32,
}

fn canonical_cache_key(request: &SearchRequest) -> String {
    let strategy = match request.strategy {
        Some(Strategy::Structural) => "structural",
        Some(Strategy::Semantic) => "semantic",
        Some(Strategy::Hybrid) => "hybrid",
        None => "auto",
    };
    format!(
        "q={}|strategy={}|fuzzy={}|arity={}|limit={}",
        request.query, strategy, request.fuzzy, request.filter_arity, request.limit
    )
}

/// Picks a strategy when the caller did not pin one (spec §4.6: "queries
/// containing `/` or `:` or a filter of arity >2 route to structural;
/// pure natural-language queries route to hybrid").
fn select_strategy(request: &SearchRequest) -> Strategy {
    if let Some(strategy) = request.strategy {
        return strategy;
    }
    if request.query.contains('/') || request.query.contains(':') || request.filter_arity > STRUCTURAL_FILTER_ARITY {
        Strategy::Structural
    } else {
        Strategy::Hybrid
    }
}

struct CacheEntry {
    hits: Vec<SearchHit>,
    inserted_at: Instant,
}

/// Structural (exact/fuzzy) + semantic + hybrid search over entities (C6).
pub struct SearchEngine {
    entities: EntityStore,
    vectors: Option<Arc<dyn VectorStore>>,
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl SearchEngine {
    pub fn new(entities: EntityStore, vectors: Option<Arc<dyn VectorStore>>) -> Self {
        Self {
            entities,
            vectors,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("CACHE_CAPACITY is nonzero"),
            )),
        }
    }

    pub async fn search(&self, request: SearchRequest) -> Result<Vec<SearchHit>> {
        let key = canonical_cache_key(&request);
        if let Some(cached) = self.cache_get(&key) {
            return Ok(cached);
        }

        let hits = match select_strategy(&request) {
            Strategy::Structural => self.structural(&request).await?,
            Strategy::Semantic => self.semantic(&request).await?,
            Strategy::Hybrid => self.hybrid(&request).await?,
        };

        self.cache.lock().put(
            key,
            CacheEntry {
                hits: hits.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(hits)
    }

    fn cache_get(&self, key: &str) -> Option<Vec<SearchHit>> {
        let mut cache = self.cache.lock();
        let entry = cache.get(key)?;
        if entry.inserted_at.elapsed() > CACHE_TTL {
            cache.pop(key);
            return None;
        }
        Some(entry.hits.clone())
    }

    /// Drops every cached entry whose key matches `predicate` (spec §4.6:
    /// "explicit `invalidate(predicate)` from mutators on entity/relationship
    /// change").
    pub fn invalidate(&self, predicate: impl Fn(&str) -> bool) {
        let mut cache = self.cache.lock();
        let stale: Vec<String> = cache
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    async fn structural(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let all = self
            .entities
            .list(ListParams {
                limit: 0,
                ..Default::default()
            })
            .await?;
        let mut hits: Vec<SearchHit> = all
            .items
            .iter()
            .filter_map(|entity| structural_score(entity, &request.query, request.fuzzy))
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(request.limit.max(1));
        Ok(hits)
    }

    async fn semantic(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let Some(vectors) = &self.vectors else {
            return Ok(vec![]);
        };
        let embedding = embed_query_stub(&request.query);
        let hits = vectors
            .search(
                &embedding,
                VectorSearchOpts {
                    limit: request.limit.max(1),
                    ..Default::default()
                },
            )
            .await?;
        Ok(hits.into_iter().map(vector_hit_to_search_hit).collect())
    }

    /// Runs both halves with half the limit each, merges by entity id
    /// (averaging scores on overlap, boosting structural-only hits 1.2x),
    /// sorts and truncates to the full limit (spec §4.6).
    async fn hybrid(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let half_limit = (request.limit.max(1) / 2).max(1);
        let half_request = SearchRequest {
            limit: half_limit,
            ..request.clone()
        };

        let structural = self.structural(&half_request).await?;
        let semantic = self.semantic(&half_request).await?;

        let mut merged: BTreeMap<String, (f32, u8)> = BTreeMap::new();
        for hit in structural {
            merged.insert(hit.entity_id, (hit.score * 1.2, 1));
        }
        for hit in semantic {
            merged
                .entry(hit.entity_id)
                .and_modify(|(score, count)| {
                    // Undo the structural-only boost before averaging so an
                    // id present in both halves isn't double-counted.
                    *score = (*score / 1.2 + hit.score) / 2.0;
                    *count += 1;
                })
                .or_insert((hit.score, 1));
        }

        let mut hits: Vec<SearchHit> = merged
            .into_iter()
            .map(|(entity_id, (score, _))| SearchHit { entity_id, score })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(request.limit.max(1));
        Ok(hits)
    }

    pub async fn find_symbols_by_name(&self, name: &str, fuzzy: bool, limit: usize) -> Result<Vec<SearchHit>> {
        self.structural(&SearchRequest {
            query: name.to_string(),
            strategy: Some(Strategy::Structural),
            fuzzy,
            filter_arity: 0,
            limit,
        })
        .await
    }

    /// Returns symbols in `file_path` whose line falls within `±range` of
    /// `line`, ordered by distance (spec §4.6).
    pub async fn find_nearby_symbols(
        &self,
        file_path: &str,
        line: u32,
        range: u32,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        let all = self
            .entities
            .list(ListParams {
                path_prefix: Some(file_path.to_string()),
                limit: 0,
                ..Default::default()
            })
            .await?;
        let mut candidates: Vec<(u32, Entity)> = all
            .items
            .into_iter()
            .filter(|e| e.path.as_deref() == Some(file_path))
            .filter_map(|e| {
                let entity_line = e
                    .properties
                    .get("line")
                    .and_then(|p| match p {
                        crate::model::Property::Int(i) => Some(*i as u32),
                        _ => None,
                    })
                    .unwrap_or(0);
                let distance = entity_line.abs_diff(line);
                (distance <= range).then_some((distance, e))
            })
            .collect();
        candidates.sort_by_key(|(distance, _)| *distance);
        candidates.truncate(limit.max(1));
        Ok(candidates.into_iter().map(|(_, e)| e).collect())
    }

    /// `pattern` is translated from glob to regex when `is_glob` is set
    /// (`* → .*`, `? → .`), per spec §4.6.
    pub async fn pattern_search(&self, pattern: &str, is_glob: bool, limit: usize) -> Result<Vec<Entity>> {
        let regex_source = if is_glob { glob_to_regex(pattern) } else { pattern.to_string() };
        let regex = Regex::new(&regex_source)
            .map_err(|e| crate::error::Error::Validation(format!("invalid pattern: {e}")))?;
        let all = self
            .entities
            .list(ListParams {
                limit: 0,
                ..Default::default()
            })
            .await?;
        let hits: Vec<Entity> = all
            .items
            .into_iter()
            .filter(|e| {
                e.name.as_deref().is_some_and(|n| regex.is_match(n))
                    || e.path.as_deref().is_some_and(|p| regex.is_match(p))
            })
            .take(limit.max(1))
            .collect();
        Ok(hits)
    }

    /// Up to 5 callers/users with code snippets (spec §4.6). The snippet is
    /// the referencing entity's own `content`, truncated; real call-site
    /// extraction belongs to the ingestion-side parser, out of scope here.
    pub async fn get_entity_examples(&self, entity_id: &str, relationships: &crate::relationship_store::RelationshipStore) -> Result<Vec<String>> {
        let edges = relationships
            .list(crate::relationship_store::RelationshipListParams {
                to: Some(entity_id.to_string()),
                limit: 5,
                ..Default::default()
            })
            .await?;
        let mut examples = Vec::new();
        for edge in edges {
            if let Some(caller) = self.entities.get(&edge.from_entity_id).await? {
                if let Some(content) = caller.content {
                    examples.push(content.chars().take(200).collect());
                }
            }
        }
        Ok(examples)
    }
}

fn structural_score(entity: &Entity, query: &str, fuzzy: bool) -> Option<SearchHit> {
    let candidates = [entity.name.as_deref(), entity.path.as_deref(), Some(entity.id.as_str())];
    let mut best: Option<f32> = None;
    for candidate in candidates.into_iter().flatten() {
        if candidate == query || candidate.contains(query) {
            best = Some(best.map_or(1.0, |b: f32| b.max(1.0)));
            continue;
        }
        if fuzzy {
            let similarity = levenshtein_similarity(candidate, query);
            if similarity >= FUZZY_THRESHOLD {
                let score = similarity as f32;
                best = Some(best.map_or(score, |b| b.max(score)));
            }
        }
    }
    best.map(|score| SearchHit {
        entity_id: entity.id.clone(),
        score,
    })
}

fn vector_hit_to_search_hit(hit: VectorHit) -> SearchHit {
    SearchHit {
        entity_id: hit.entity_id,
        score: hit.score,
    }
}

/// Placeholder for the out-of-scope "embed(text)→vector" collaborator
/// (spec §1 Non-goals). Callers that need real embeddings construct their
/// own vector and call `VectorStore` directly; this keeps `SearchEngine`
/// usable in tests without an embedding model wired in.
fn embed_query_stub(_query: &str) -> Vec<f32> {
    vec![]
}

pub(crate) fn glob_to_regex(glob: &str) -> String {
    const REGEX_METACHARS: &[char] = &['.', '+', '^', '$', '(', ')', '[', ']', '{', '}', '|', '\\'];
    let mut out = String::from("^");
    for ch in glob.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c if REGEX_METACHARS.contains(&c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    out
}

fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    let distance = levenshtein_distance(a, b);
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        1.0
    } else {
        1.0 - (distance as f64 / max_len as f64)
    }
}

/// Dynamic-programming Levenshtein distance.
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();
    let len1 = s1_chars.len();
    let len2 = s2_chars.len();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut dp = vec![vec![0usize; len2 + 1]; len1 + 1];
    for (i, row) in dp.iter_mut().enumerate().take(len1 + 1) {
        row[0] = i;
    }
    for j in 0..=len2 {
        dp[0][j] = j;
    }
    for i in 1..=len1 {
        for j in 1..=len2 {
            let cost = if s1_chars[i - 1] == s2_chars[j - 1] { 0 } else { 1 };
            dp[i][j] = (dp[i - 1][j] + 1).min(dp[i][j - 1] + 1).min(dp[i - 1][j - 1] + cost);
        }
    }
    dp[len1][len2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityType;
    use crate::namespace::NamespaceScope;
    use crate::store::MemoryGraphStore;
    use crate::telemetry::Telemetry;
    use chrono::Utc;

    fn setup() -> SearchEngine {
        let entities = EntityStore::new(
            Arc::new(MemoryGraphStore::new()),
            NamespaceScope::new("test"),
            Telemetry::new(),
        );
        SearchEngine::new(entities, None)
    }

    #[test]
    fn levenshtein_matches_known_distances() {
        assert_eq!(levenshtein_distance("", ""), 0);
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("Paris", "Parus"), 1);
    }

    #[test]
    fn strategy_routes_path_like_queries_to_structural() {
        let request = SearchRequest {
            query: "src/lib.rs".to_string(),
            ..Default::default()
        };
        assert_eq!(select_strategy(&request), Strategy::Structural);
    }

    #[test]
    fn strategy_routes_plain_text_to_hybrid() {
        let request = SearchRequest {
            query: "parse the config file".to_string(),
            ..Default::default()
        };
        assert_eq!(select_strategy(&request), Strategy::Hybrid);
    }

    #[tokio::test]
    async fn exact_match_ranks_above_fuzzy_miss() {
        let engine = setup();
        let mut entity = crate::model::Entity::new("sym_1", EntityType::Symbol, Utc::now());
        entity.name = Some("parseConfig".to_string());
        engine.entities.create(entity).await.unwrap();

        let hits = engine
            .structural(&SearchRequest {
                query: "parseConfig".to_string(),
                fuzzy: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 1.0);
    }

    #[tokio::test]
    async fn cache_returns_same_result_without_recomputation() {
        let engine = setup();
        let mut entity = crate::model::Entity::new("sym_1", EntityType::Symbol, Utc::now());
        entity.name = Some("parseConfig".to_string());
        engine.entities.create(entity).await.unwrap();

        let request = SearchRequest {
            query: "parseConfig".to_string(),
            strategy: Some(Strategy::Structural),
            ..Default::default()
        };
        let first = engine.search(request.clone()).await.unwrap();
        let second = engine.search(request).await.unwrap();
        assert_eq!(first.len(), second.len());
    }

    #[tokio::test]
    async fn pattern_search_translates_glob_wildcards() {
        let engine = setup();
        let mut entity = crate::model::Entity::new("sym_1", EntityType::Symbol, Utc::now());
        entity.name = Some("handleRequest".to_string());
        engine.entities.create(entity).await.unwrap();

        let hits = engine.pattern_search("handle*", true, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
