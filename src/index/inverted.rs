//! BM25 inverted index for hybrid search.
//!
//! Opt-in per schema via the `enable_bm25` extension. Postings live in the
//! `inverted` column family (`inv:{tenant}:{schema}:{term}:{id}` -> term
//! frequency + document length); corpus statistics (document frequency per
//! term, document/token counts) live in `meta`.

use crate::storage::batch::BatchBuilder;
use crate::storage::column_families::{CF_INVERTED, CF_META};
use crate::storage::{keys, Storage};
use crate::types::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// BM25 term saturation parameter.
pub const BM25_K1: f32 = 1.2;

/// BM25 length normalization parameter.
pub const BM25_B: f32 = 0.75;

/// One posting: term frequency plus the document's token count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Posting {
    pub tf: u32,
    pub doc_len: u32,
}

/// Per-schema corpus counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorpusStats {
    pub docs: u64,
    pub tokens: u64,
}

impl CorpusStats {
    fn avg_doc_len(&self) -> f32 {
        if self.docs == 0 {
            0.0
        } else {
            self.tokens as f32 / self.docs as f32
        }
    }
}

/// Tokenize text into searchable terms: lowercase, split on non-alphanumeric,
/// drop tokens shorter than 2 characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| s.len() >= 2)
        .map(String::from)
        .collect()
}

fn term_frequencies(text: &str) -> (HashMap<String, u32>, u32) {
    let tokens = tokenize(text);
    let doc_len = tokens.len() as u32;
    let mut frequencies: HashMap<String, u32> = HashMap::new();
    for token in tokens {
        *frequencies.entry(token).or_insert(0) += 1;
    }
    (frequencies, doc_len)
}

/// Manager for the BM25 postings and corpus statistics.
///
/// Corpus counters are read-modify-write; a per-manager mutex serialises the
/// read side so concurrent stagers do not base deltas on the same snapshot.
/// The counters are relevance statistics, not invariants, and vacuum rebuilds
/// them from the postings.
pub struct InvertedIndex {
    storage: Storage,
    counter_lock: Mutex<()>,
}

impl InvertedIndex {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            counter_lock: Mutex::new(()),
        }
    }

    fn read_doc_freq(&self, tenant: &str, schema: &str, term: &str) -> Result<u64> {
        let key = keys::meta_doc_freq_key(tenant, schema, term);
        Ok(self
            .storage
            .get(CF_META, &key)?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or(0))
    }

    fn read_corpus(&self, tenant: &str, schema: &str) -> Result<CorpusStats> {
        let key = keys::meta_doc_count_key(tenant, schema);
        Ok(self
            .storage
            .get(CF_META, &key)?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default())
    }

    /// Stage posting deltas for one document's text change.
    ///
    /// `old_text` is `None` on insert, `new_text` is `None` on delete.
    pub fn stage_update(
        &self,
        tenant: &str,
        schema: &str,
        id: Uuid,
        old_text: Option<&str>,
        new_text: Option<&str>,
        batch: &mut BatchBuilder,
    ) -> Result<()> {
        let (old_terms, old_len) = match old_text {
            Some(text) => term_frequencies(text),
            None => (HashMap::new(), 0),
        };
        let (new_terms, new_len) = match new_text {
            Some(text) => term_frequencies(text),
            None => (HashMap::new(), 0),
        };

        let _guard = self
            .counter_lock
            .lock()
            .map_err(|_| crate::types::DatabaseError::InternalError("counter lock poisoned".into()))?;

        // Removed terms: drop posting, decrement df.
        for term in old_terms.keys() {
            if !new_terms.contains_key(term) {
                batch.delete(CF_INVERTED, keys::inverted_key(tenant, schema, term, id));
                let df = self.read_doc_freq(tenant, schema, term)?.saturating_sub(1);
                batch.put(
                    CF_META,
                    keys::meta_doc_freq_key(tenant, schema, term),
                    serde_json::to_vec(&df)?,
                );
            }
        }

        // Added or retained terms: write posting, bump df for new ones.
        for (term, &tf) in &new_terms {
            let posting = Posting {
                tf,
                doc_len: new_len,
            };
            batch.put(
                CF_INVERTED,
                keys::inverted_key(tenant, schema, term, id),
                bincode::serialize(&posting)?,
            );
            if !old_terms.contains_key(term) {
                let df = self.read_doc_freq(tenant, schema, term)? + 1;
                batch.put(
                    CF_META,
                    keys::meta_doc_freq_key(tenant, schema, term),
                    serde_json::to_vec(&df)?,
                );
            }
        }

        // Corpus counters.
        let mut corpus = self.read_corpus(tenant, schema)?;
        match (old_text.is_some(), new_text.is_some()) {
            (false, true) => {
                corpus.docs += 1;
                corpus.tokens += new_len as u64;
            }
            (true, false) => {
                corpus.docs = corpus.docs.saturating_sub(1);
                corpus.tokens = corpus.tokens.saturating_sub(old_len as u64);
            }
            (true, true) => {
                corpus.tokens = corpus.tokens.saturating_sub(old_len as u64) + new_len as u64;
            }
            (false, false) => {}
        }
        batch.put(
            CF_META,
            keys::meta_doc_count_key(tenant, schema),
            serde_json::to_vec(&corpus)?,
        );

        Ok(())
    }

    /// BM25-scored search over the postings. Returns `(id, score)` sorted
    /// descending, truncated to `top_k`.
    pub fn search(
        &self,
        tenant: &str,
        schema: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<(Uuid, f32)>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let corpus = self.read_corpus(tenant, schema)?;
        if corpus.docs == 0 {
            return Ok(Vec::new());
        }
        let avg_len = corpus.avg_doc_len().max(1.0);
        let n = corpus.docs as f32;

        let mut scores: HashMap<Uuid, f32> = HashMap::new();
        let mut seen_terms: std::collections::HashSet<String> = std::collections::HashSet::new();

        for term in tokenize(query) {
            if !seen_terms.insert(term.clone()) {
                continue;
            }

            let df = self.read_doc_freq(tenant, schema, &term)? as f32;
            if df == 0.0 {
                continue;
            }
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            let prefix = keys::inverted_prefix(tenant, schema, &term);
            for (key, value) in self.storage.prefix_iter(CF_INVERTED, &prefix)? {
                let posting: Posting = bincode::deserialize(&value)?;
                let text = String::from_utf8_lossy(&key);
                let Some(id) = text.rsplit(':').next().and_then(|s| Uuid::parse_str(s).ok())
                else {
                    continue;
                };

                let tf = posting.tf as f32;
                let norm = 1.0 - BM25_B + BM25_B * (posting.doc_len as f32 / avg_len);
                let score = idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * norm);
                *scores.entry(id).or_insert(0.0) += score;
            }
        }

        let mut ranked: Vec<(Uuid, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(top_k);
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Storage, InvertedIndex) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let index = InvertedIndex::new(storage.clone());
        (dir, storage, index)
    }

    fn put(storage: &Storage, index: &InvertedIndex, id: Uuid, old: Option<&str>, new: Option<&str>) {
        let mut batch = BatchBuilder::new();
        index
            .stage_update("t1", "article", id, old, new, &mut batch)
            .unwrap();
        storage.commit(batch).unwrap();
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Hello, World!"), vec!["hello", "world"]);
        assert_eq!(tokenize("I am a test"), vec!["am", "test"]);
    }

    #[test]
    fn test_term_match_ranks_higher() {
        let (_dir, storage, index) = setup();
        let rust_doc = Uuid::new_v4();
        let other = Uuid::new_v4();

        put(&storage, &index, rust_doc, None, Some("Rust systems programming in practice"));
        put(&storage, &index, other, None, Some("Gardening for beginners in spring"));

        let hits = index.search("t1", "article", "Rust systems", 5).unwrap();
        assert_eq!(hits[0].0, rust_doc);
        assert!(hits.iter().all(|(id, _)| *id != other));
    }

    #[test]
    fn test_update_replaces_postings() {
        let (_dir, storage, index) = setup();
        let id = Uuid::new_v4();

        put(&storage, &index, id, None, Some("alpha beta"));
        assert_eq!(index.search("t1", "article", "alpha", 5).unwrap().len(), 1);

        put(&storage, &index, id, Some("alpha beta"), Some("gamma beta"));
        assert!(index.search("t1", "article", "alpha", 5).unwrap().is_empty());
        assert_eq!(index.search("t1", "article", "gamma", 5).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_clears_document() {
        let (_dir, storage, index) = setup();
        let id = Uuid::new_v4();

        put(&storage, &index, id, None, Some("alpha beta"));
        put(&storage, &index, id, Some("alpha beta"), None);

        assert!(index.search("t1", "article", "alpha beta", 5).unwrap().is_empty());
    }

    #[test]
    fn test_rare_term_outweighs_common() {
        let (_dir, storage, index) = setup();
        let rare = Uuid::new_v4();

        // "shared" appears everywhere; "unique" only once.
        for _ in 0..5 {
            put(&storage, &index, Uuid::new_v4(), None, Some("shared words here"));
        }
        put(&storage, &index, rare, None, Some("shared unique words"));

        let hits = index.search("t1", "article", "unique shared", 10).unwrap();
        assert_eq!(hits[0].0, rare);
    }

    #[test]
    fn test_empty_corpus_and_zero_k() {
        let (_dir, _storage, index) = setup();
        assert!(index.search("t1", "article", "anything", 5).unwrap().is_empty());
        assert!(index.search("t1", "article", "anything", 0).unwrap().is_empty());
    }
}
