//! Process-local hybrid entity index.
//!
//! Three structures behind one mutex: a lowercased alias map, a profile map,
//! and a flat inner-product vector index over summary embeddings. Hydrated
//! from the graph at startup; refreshed by the batch pipeline; consulted by
//! every stage that needs to know whether a name is already someone.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use vestige_config::ResolverConfig;
use vestige_graph::GraphStore;

pub mod embedding;
pub mod fuzzy;
mod index;

pub use embedding::{Embedder, HashEmbedder};
pub use index::VectorIndex;

/// Snapshot of one entity as the resolver knows it.
#[derive(Debug, Clone, Serialize)]
pub struct EntityProfile {
    pub id: i64,
    pub canonical_name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Every surface form, canonical included.
    pub aliases: Vec<String>,
    pub summary: String,
    pub topic: String,
    pub last_profiled_msg_id: i64,
}

impl EntityProfile {
    fn has_alias(&self, text: &str) -> bool {
        self.aliases.iter().any(|a| a.eq_ignore_ascii_case(text))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    Exact,
    Fuzzy,
    Vector,
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: i64,
    /// Normalized to [0, 1] across both score families.
    pub score: f64,
    pub source: MatchSource,
    pub profile: EntityProfile,
}

#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved(Candidate),
    Ambiguous(Vec<Candidate>),
    New,
}

#[derive(Debug, Clone)]
pub struct MergeCandidate {
    pub primary_id: i64,
    pub secondary_id: i64,
    pub similarity: f32,
    pub primary: EntityProfile,
    pub secondary: EntityProfile,
}

/// Type groups whose members may describe the same real-world thing.
const COMPATIBLE_TYPE_GROUPS: &[&[&str]] = &[
    &["person", "team"],
    &["organization", "company", "team", "product"],
    &["project", "product", "initiative", "technology"],
    &["location", "place", "city", "country", "region"],
];

pub fn types_compatible(a: &str, b: &str) -> bool {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a == b {
        return true;
    }
    COMPATIBLE_TYPE_GROUPS
        .iter()
        .any(|group| group.contains(&a.as_str()) && group.contains(&b.as_str()))
}

#[derive(Default)]
struct State {
    name_to_id: std::collections::HashMap<String, i64>,
    profiles: std::collections::HashMap<i64, EntityProfile>,
    index: VectorIndex,
}

impl State {
    fn insert_alias(&mut self, alias: &str, id: i64) {
        self.name_to_id.insert(alias.to_lowercase(), id);
    }
}

pub struct EntityResolver {
    state: Mutex<State>,
    embedder: Arc<dyn Embedder>,
    cfg: ResolverConfig,
}

impl EntityResolver {
    pub fn new(embedder: Arc<dyn Embedder>, cfg: ResolverConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            embedder,
            cfg,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("resolver state poisoned")
    }

    /// Rebuild all state from the graph in one pass. Called at startup,
    /// where failure is fatal, and before every batch to pick up profile
    /// updates written since.
    pub async fn hydrate(&self, store: &dyn GraphStore) -> Result<usize> {
        let entities = store
            .get_all_entities_for_hydration()
            .await
            .context("resolver hydration query failed")?;

        // Embeddings for summaries the graph has not vectorized yet are
        // computed before taking the lock.
        let mut prepared = Vec::with_capacity(entities.len());
        for entity in entities {
            let embedding = if entity.embedding.len() == self.embedder.dim() {
                Some(entity.embedding.clone())
            } else if !entity.summary.is_empty() {
                Some(self.embedder.embed(&entity.summary))
            } else {
                None
            };
            prepared.push((entity, embedding));
        }

        let mut state = self.lock();
        state.name_to_id.clear();
        state.profiles.clear();
        state.index.clear();

        let count = prepared.len();
        for (entity, embedding) in prepared {
            let mut aliases: Vec<String> = entity.aliases.clone();
            if !aliases
                .iter()
                .any(|a| a.eq_ignore_ascii_case(&entity.canonical_name))
            {
                aliases.push(entity.canonical_name.clone());
            }

            for alias in &aliases {
                state.insert_alias(alias, entity.id);
            }
            if let Some(vector) = embedding {
                state.index.insert(entity.id, vector);
            }
            state.profiles.insert(
                entity.id,
                EntityProfile {
                    id: entity.id,
                    canonical_name: entity.canonical_name,
                    entity_type: entity.entity_type,
                    aliases,
                    summary: entity.summary,
                    topic: entity.topic.unwrap_or_else(|| "General".to_string()),
                    last_profiled_msg_id: entity.last_profiled_msg_id,
                },
            );
        }

        info!(entities = count, "resolver hydrated");
        Ok(count)
    }

    /// Exact lowercase alias lookup.
    pub fn get_id(&self, text: &str) -> Option<i64> {
        self.lock().name_to_id.get(&text.to_lowercase()).copied()
    }

    pub fn profile(&self, id: i64) -> Option<EntityProfile> {
        self.lock().profiles.get(&id).cloned()
    }

    pub fn aliases_for(&self, id: i64) -> Vec<String> {
        self.lock()
            .profiles
            .get(&id)
            .map(|p| p.aliases.clone())
            .unwrap_or_default()
    }

    pub fn entity_count(&self) -> usize {
        self.lock().profiles.len()
    }

    /// Two-stage resolution: exact alias hit, else fused fuzzy + vector
    /// candidates scored into [0, 1].
    pub fn resolve(&self, text: &str, context: &str) -> Resolution {
        {
            let state = self.lock();
            if let Some(&id) = state.name_to_id.get(&text.to_lowercase()) {
                if let Some(profile) = state.profiles.get(&id) {
                    return Resolution::Resolved(Candidate {
                        id,
                        score: 1.0,
                        source: MatchSource::Exact,
                        profile: profile.clone(),
                    });
                }
            }
        }

        // Embed outside the lock; the query carries the batch context.
        let query = self
            .embedder
            .embed(&format!("{text} mentioned in context of: {context}"));

        let state = self.lock();
        let mut candidates: std::collections::HashMap<i64, (f64, MatchSource)> =
            std::collections::HashMap::new();

        let fuzzy_hits = fuzzy::extract_top(
            text,
            state.name_to_id.keys().map(String::as_str),
            self.cfg.fuzzy_cutoff,
            self.cfg.top_k,
        );
        for hit in fuzzy_hits {
            if let Some(&id) = state.name_to_id.get(&hit.candidate) {
                let norm = hit.score / 100.0;
                let entry = candidates.entry(id).or_insert((norm, MatchSource::Fuzzy));
                if norm > entry.0 {
                    entry.0 = norm;
                }
            }
        }

        if !state.index.is_empty() {
            for (id, score) in state.index.search(&query, self.cfg.top_k) {
                let norm = ((score + 1.0) / 2.0) as f64;
                match candidates.get_mut(&id) {
                    Some(entry) => {
                        entry.1 = MatchSource::Hybrid;
                        if norm > entry.0 {
                            entry.0 = norm;
                        }
                    }
                    None => {
                        candidates.insert(id, (norm, MatchSource::Vector));
                    }
                }
            }
        }

        let mut scored: Vec<Candidate> = candidates
            .into_iter()
            .filter_map(|(id, (score, source))| {
                state.profiles.get(&id).map(|profile| Candidate {
                    id,
                    score,
                    source,
                    profile: profile.clone(),
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.cfg.top_k);

        match scored.first() {
            Some(top) if top.score >= self.cfg.resolved_threshold => {
                Resolution::Resolved(top.clone())
            }
            Some(_) => {
                let ambiguous: Vec<Candidate> = scored
                    .into_iter()
                    .filter(|c| c.score > self.cfg.ambiguous_threshold)
                    .collect();
                if ambiguous.len() >= 2 {
                    Resolution::Ambiguous(ambiguous)
                } else {
                    Resolution::New
                }
            }
            None => Resolution::New,
        }
    }

    /// Resolve arbitrary user input to a canonical name: exact alias hit,
    /// else best fuzzy match at the lookup cutoff.
    pub fn resolve_to_canonical(&self, text: &str) -> Option<String> {
        let state = self.lock();
        if let Some(&id) = state.name_to_id.get(&text.to_lowercase()) {
            return state.profiles.get(&id).map(|p| p.canonical_name.clone());
        }

        let hit = fuzzy::extract_one(
            text,
            state.name_to_id.keys().map(String::as_str),
            self.cfg.lookup_cutoff,
        )?;
        debug!(input = text, matched = %hit.candidate, score = hit.score, "fuzzy canonical lookup");
        let id = *state.name_to_id.get(&hit.candidate)?;
        state.profiles.get(&id).map(|p| p.canonical_name.clone())
    }

    /// Atomically insert a freshly-disambiguated entity: all aliases into the
    /// alias map, the profile into the profile map. New entities carry no
    /// summary, so no vector is inserted yet.
    pub fn register_entity(
        &self,
        id: i64,
        canonical: &str,
        mentions: &[String],
        entity_type: &str,
        topic: &str,
    ) {
        let mut aliases: Vec<String> = vec![canonical.to_string()];
        for mention in mentions {
            if !aliases.iter().any(|a| a.eq_ignore_ascii_case(mention)) {
                aliases.push(mention.clone());
            }
        }

        let mut state = self.lock();
        for alias in &aliases {
            state.insert_alias(alias, id);
        }
        state.profiles.insert(
            id,
            EntityProfile {
                id,
                canonical_name: canonical.to_string(),
                entity_type: entity_type.to_string(),
                aliases,
                summary: String::new(),
                topic: topic.to_string(),
                last_profiled_msg_id: 0,
            },
        );
        debug!(id, canonical, "entity registered");
    }

    /// Confirm a canonical exists and fold in any unseen mentions as aliases.
    /// Returns `None` when the canonical is unknown (caller demotes to NEW).
    pub fn validate_existing(&self, canonical: &str, mentions: &[String]) -> Option<(i64, bool)> {
        let mut state = self.lock();
        let id = *state.name_to_id.get(&canonical.to_lowercase())?;

        let mut added = false;
        let mut new_aliases = Vec::new();
        {
            let profile = state.profiles.get_mut(&id)?;
            for mention in mentions {
                if !profile.has_alias(mention) {
                    profile.aliases.push(mention.clone());
                    new_aliases.push(mention.clone());
                    added = true;
                }
            }
        }
        for alias in new_aliases {
            state.insert_alias(&alias, id);
        }

        Some((id, added))
    }

    /// Recompute the embedding for a new summary and swap it into the index
    /// (remove-by-id first, then add). Returns the fresh embedding, or `None`
    /// for an unknown id.
    pub fn update_profile_summary(&self, id: i64, summary: &str) -> Option<Vec<f32>> {
        if !self.lock().profiles.contains_key(&id) {
            warn!(id, "profile summary update for unknown entity");
            return None;
        }

        let embedding = self.embedder.embed(summary);

        let mut state = self.lock();
        match state.profiles.get_mut(&id) {
            Some(profile) => profile.summary = summary.to_string(),
            None => return None,
        }
        state.index.remove(id);
        state.index.insert(id, embedding.clone());
        Some(embedding)
    }

    /// Pairs whose embeddings clear the similarity floor, whose types are
    /// compatible, and which share no direct relationship (the caller
    /// supplies adjacency as sorted id pairs). Higher similarity first;
    /// ties break toward the lower secondary id.
    pub fn detect_merge_candidates(&self, related: &HashSet<(i64, i64)>) -> Vec<MergeCandidate> {
        let state = self.lock();
        let mut out: Vec<MergeCandidate> = state
            .index
            .pairs_above(self.cfg.merge_similarity)
            .into_iter()
            .filter(|(a, b, _)| !related.contains(&(*a, *b)))
            .filter_map(|(a, b, similarity)| {
                let primary = state.profiles.get(&a)?;
                let secondary = state.profiles.get(&b)?;
                if !types_compatible(&primary.entity_type, &secondary.entity_type) {
                    return None;
                }
                Some(MergeCandidate {
                    primary_id: a,
                    secondary_id: b,
                    similarity,
                    primary: primary.clone(),
                    secondary: secondary.clone(),
                })
            })
            .collect();

        out.sort_by(|x, y| {
            y.similarity
                .partial_cmp(&x.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(x.secondary_id.cmp(&y.secondary_id))
        });
        out
    }

    /// After the store merges `secondary` into `primary`: remap every
    /// secondary alias, fold them into the primary profile, and drop the
    /// secondary from the profile map and vector index.
    pub fn remap_after_merge(&self, primary_id: i64, secondary_id: i64) {
        let mut state = self.lock();
        let Some(secondary) = state.profiles.remove(&secondary_id) else {
            return;
        };

        for alias in &secondary.aliases {
            state.insert_alias(alias, primary_id);
        }
        if let Some(primary) = state.profiles.get_mut(&primary_id) {
            for alias in secondary.aliases {
                if !primary.has_alias(&alias) {
                    primary.aliases.push(alias);
                }
            }
        }
        state.index.remove(secondary_id);
        info!(primary = primary_id, secondary = secondary_id, "resolver remapped after merge");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vestige_graph::{EntityRecord, MemoryGraph};

    fn resolver() -> EntityResolver {
        EntityResolver::new(
            Arc::new(HashEmbedder::new(384)),
            ResolverConfig::default(),
        )
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn registered_aliases_resolve_to_the_registered_id() {
        let r = resolver();
        r.register_entity(7, "Chloe", &strings(&["Chlo"]), "person", "General");

        for alias in ["Chloe", "chloe", "Chlo", "CHLO"] {
            match r.resolve(alias, "anything") {
                Resolution::Resolved(c) => {
                    assert_eq!(c.id, 7);
                    assert_eq!(c.source, MatchSource::Exact);
                    assert!((c.score - 1.0).abs() < f64::EPSILON);
                }
                other => panic!("expected resolved for {alias}, got {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_single_weak_candidate_is_new() {
        let r = resolver();
        r.register_entity(1, "Marcus Lee", &[], "person", "General");

        match r.resolve("Markus Le", "met at the gym") {
            Resolution::New => {}
            other => panic!("expected new, got {other:?}"),
        }
    }

    #[test]
    fn two_mid_confidence_candidates_are_ambiguous() {
        let r = resolver();
        r.register_entity(1, "Alex Chen", &[], "person", "General");
        r.register_entity(2, "Alex Chan", &[], "person", "General");

        match r.resolve("Alex C", "saw them at lunch") {
            Resolution::Ambiguous(candidates) => {
                assert_eq!(candidates.len(), 2);
                assert!(candidates.iter().all(|c| c.score > 0.65 && c.score < 0.90));
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn validate_existing_adds_only_unseen_mentions() {
        let r = resolver();
        r.register_entity(3, "Brianna", &[], "person", "General");

        let (id, added) = r.validate_existing("Brianna", &strings(&["Bri"])).unwrap();
        assert_eq!(id, 3);
        assert!(added);
        assert_eq!(r.get_id("bri"), Some(3));

        let (_, added_again) = r.validate_existing("brianna", &strings(&["Bri"])).unwrap();
        assert!(!added_again);

        assert!(r.validate_existing("Nobody", &[]).is_none());
    }

    #[test]
    fn update_profile_summary_swaps_the_vector() {
        let r = resolver();
        r.register_entity(4, "Priya", &[], "person", "General");

        let first = r.update_profile_summary(4, "Priya lifts at IronWorks").unwrap();
        let second = r
            .update_profile_summary(4, "Priya is training for a marathon")
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(r.profile(4).unwrap().summary, "Priya is training for a marathon");
        assert!(r.update_profile_summary(99, "ghost").is_none());
    }

    #[test]
    fn merge_candidates_require_similarity_type_and_no_edge() {
        let r = resolver();
        r.register_entity(1, "Prof Martinez", &[], "person", "School");
        r.register_entity(2, "Professor Martinez", &[], "person", "School");
        r.register_entity(3, "IronWorks", &[], "organization", "Fitness");

        let summary = "Teaches databases at the university, office hours on Tuesdays";
        r.update_profile_summary(1, summary);
        r.update_profile_summary(2, summary);
        r.update_profile_summary(3, summary);

        let candidates = r.detect_merge_candidates(&HashSet::new());
        // Only the person/person pair survives the type gate.
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].primary_id, 1);
        assert_eq!(candidates[0].secondary_id, 2);
        assert!(candidates[0].similarity > 0.99);

        let mut related = HashSet::new();
        related.insert((1, 2));
        assert!(r.detect_merge_candidates(&related).is_empty());
    }

    #[test]
    fn remap_after_merge_redirects_aliases_and_drops_secondary() {
        let r = resolver();
        r.register_entity(1, "Professor Martinez", &[], "person", "School");
        r.register_entity(2, "Prof Martinez", &strings(&["Prof M"]), "person", "School");
        r.update_profile_summary(2, "Teaches databases");

        r.remap_after_merge(1, 2);

        assert_eq!(r.get_id("Prof Martinez"), Some(1));
        assert_eq!(r.get_id("Prof M"), Some(1));
        assert!(r.profile(2).is_none());
        assert!(r.profile(1).unwrap().has_alias("Prof Martinez"));
        assert!(r.detect_merge_candidates(&HashSet::new()).is_empty());
    }

    #[tokio::test]
    async fn hydrate_round_trips_aliases_and_vectors() {
        let store = MemoryGraph::new();
        store
            .write_batch(
                &[
                    EntityRecord {
                        id: 1,
                        canonical_name: "Chloe".into(),
                        entity_type: "person".into(),
                        confidence: 1.0,
                        aliases: vec!["Chlo".into()],
                        summary: "My roommate who bakes".into(),
                        topic: "Home".into(),
                        embedding: vec![],
                        last_profiled_msg_id: 3,
                    },
                    EntityRecord {
                        id: 2,
                        canonical_name: "Chloe Park".into(),
                        entity_type: "person".into(),
                        confidence: 1.0,
                        aliases: vec![],
                        summary: "My roommate who bakes".into(),
                        topic: "Home".into(),
                        embedding: vec![],
                        last_profiled_msg_id: 0,
                    },
                ],
                &[],
                true,
            )
            .await
            .unwrap();

        let r = resolver();
        let count = r.hydrate(&store).await.unwrap();
        assert_eq!(count, 2);

        let profile = r.profile(1).unwrap();
        assert!(profile.has_alias("Chloe"));
        assert!(profile.has_alias("Chlo"));
        assert_eq!(profile.entity_type, "person");
        assert_eq!(r.get_id("chlo"), Some(1));

        // Identical summaries hydrate to identical vectors.
        let candidates = r.detect_merge_candidates(&HashSet::new());
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].similarity > 0.99);
    }

    #[test]
    fn canonical_lookup_falls_back_to_fuzzy() {
        let r = resolver();
        r.register_entity(1, "Chloe", &[], "person", "General");

        assert_eq!(r.resolve_to_canonical("chloe").as_deref(), Some("Chloe"));
        assert_eq!(r.resolve_to_canonical("Chlo").as_deref(), Some("Chloe"));
        assert!(r.resolve_to_canonical("Zebulon").is_none());
    }

    #[test]
    fn type_compatibility_groups() {
        assert!(types_compatible("person", "person"));
        assert!(types_compatible("person", "team"));
        assert!(types_compatible("company", "organization"));
        assert!(!types_compatible("person", "place"));
    }
}
