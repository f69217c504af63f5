//! Lexical Ranker (component B).
//!
//! Okapi BM25 over an ephemeral, per-call corpus. Holds no state between
//! calls: the dense stage supplies a small candidate set, this module fits
//! and scores it fresh every time.

use std::collections::HashMap;

const K1: f32 = 1.2;
const B: f32 = 0.75;

/// A document handed to [`LexicalRanker::fit`].
#[derive(Debug, Clone)]
pub struct Doc<'a> {
    pub id: &'a str,
    pub text: &'a str,
}

/// Tokenize: lowercase, strip non-word characters, drop tokens of length <= 2.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|tok| tok.len() > 2)
        .map(|tok| tok.to_string())
        .collect()
}

struct FittedDoc {
    id: String,
    term_counts: HashMap<String, u32>,
    len: usize,
}

/// BM25 ranker fit against a fresh corpus per call.
#[derive(Default)]
pub struct LexicalRanker {
    docs: Vec<FittedDoc>,
    doc_freq: HashMap<String, usize>,
    avg_doc_len: f32,
}

impl LexicalRanker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the ephemeral index from a candidate document set.
    pub fn fit(&mut self, docs: &[Doc<'_>]) {
        self.docs.clear();
        self.doc_freq.clear();

        let mut total_len = 0usize;
        for doc in docs {
            let tokens = tokenize(doc.text);
            let mut term_counts: HashMap<String, u32> = HashMap::new();
            for tok in &tokens {
                *term_counts.entry(tok.clone()).or_insert(0) += 1;
            }
            for term in term_counts.keys() {
                *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            total_len += tokens.len();
            self.docs.push(FittedDoc {
                id: doc.id.to_string(),
                term_counts,
                len: tokens.len(),
            });
        }

        self.avg_doc_len = if self.docs.is_empty() {
            0.0
        } else {
            total_len as f32 / self.docs.len() as f32
        };
    }

    /// Score every fitted document against `query`, returning the top_k
    /// with score > 0, descending.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(String, f32)> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || self.docs.is_empty() {
            return Vec::new();
        }

        let n = self.docs.len() as f32;
        let mut scores: Vec<(String, f32)> = self
            .docs
            .iter()
            .map(|doc| {
                let score: f32 = query_terms
                    .iter()
                    .map(|term| {
                        let tf = *doc.term_counts.get(term).unwrap_or(&0) as f32;
                        if tf == 0.0 {
                            return 0.0;
                        }
                        let df = *self.doc_freq.get(term).unwrap_or(&0) as f32;
                        let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                        let denom = tf
                            + K1 * (1.0 - B + B * (doc.len as f32 / self.avg_doc_len.max(1.0)));
                        idf * (tf * (K1 + 1.0)) / denom
                    })
                    .sum();
                (doc.id.clone(), score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scores.truncate(top_k);
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_drops_short_tokens_and_punctuation() {
        let tokens = tokenize("Hi, the CAT sat on a mat!!");
        assert_eq!(tokens, vec!["the", "cat", "sat", "mat"]);
    }

    #[test]
    fn exact_match_outranks_unrelated_doc() {
        let mut ranker = LexicalRanker::new();
        let docs = vec![
            Doc { id: "a", text: "the capital of france is paris" },
            Doc { id: "b", text: "bananas are a good source of potassium" },
        ];
        ranker.fit(&docs);
        let results = ranker.search("capital of france", 10);
        assert_eq!(results[0].0, "a");
        assert!(results.iter().all(|(_, s)| *s > 0.0));
    }

    #[test]
    fn empty_query_yields_no_results() {
        let mut ranker = LexicalRanker::new();
        ranker.fit(&[Doc { id: "a", text: "some content" }]);
        assert!(ranker.search("", 10).is_empty());
    }

    #[test]
    fn no_persistent_state_across_fits() {
        let mut ranker = LexicalRanker::new();
        ranker.fit(&[Doc { id: "a", text: "paris france" }]);
        assert_eq!(ranker.search("paris", 10).len(), 1);
        ranker.fit(&[Doc { id: "b", text: "berlin germany" }]);
        assert!(ranker.search("paris", 10).is_empty());
    }
}
