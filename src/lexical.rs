//! BM25 (Okapi) lexical index over indexed chunks.
//!
//! The corpus grows by [`LexicalIndex::update`]; every update rebuilds the
//! term statistics from the whole corpus. The state sits behind a
//! `RwLock`, and an update holds the write lock for the append and the
//! rebuild, so concurrent updates are applied one after another.
//!
//! Scoring follows the Okapi formulation with `k1 = 1.5`, `b = 0.75`.
//! Terms whose IDF would be negative (present in more than half the corpus)
//! get `ε · mean(IDF)` with `ε = 0.25`.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use unicode_segmentation::UnicodeSegmentation;

use crate::models::Chunk;

const K1: f64 = 1.5;
const B: f64 = 0.75;
const EPSILON: f64 = 0.25;

/// Lower-cased UAX #29 words; CJK ideographs become one token each.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text.unicode_words() {
        if word.chars().any(is_cjk) {
            let mut run = String::new();
            for c in word.chars() {
                if is_cjk(c) {
                    if !run.is_empty() {
                        tokens.push(std::mem::take(&mut run).to_lowercase());
                    }
                    tokens.push(c.to_string());
                } else {
                    run.push(c);
                }
            }
            if !run.is_empty() {
                tokens.push(run.to_lowercase());
            }
        } else {
            tokens.push(word.to_lowercase());
        }
    }
    tokens
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{20000}'..='\u{2A6DF}')
}

/// Term statistics for one corpus snapshot.
pub struct Bm25 {
    doc_freqs: Vec<HashMap<String, usize>>,
    doc_len: Vec<usize>,
    avgdl: f64,
    idf: HashMap<String, f64>,
}

impl Bm25 {
    pub fn new(corpus: &[Vec<String>]) -> Self {
        let mut doc_freqs = Vec::with_capacity(corpus.len());
        let mut doc_len = Vec::with_capacity(corpus.len());
        let mut containing: HashMap<String, usize> = HashMap::new();

        for doc in corpus {
            let mut freqs: HashMap<String, usize> = HashMap::new();
            for token in doc {
                *freqs.entry(token.clone()).or_default() += 1;
            }
            for token in freqs.keys() {
                *containing.entry(token.clone()).or_default() += 1;
            }
            doc_len.push(doc.len());
            doc_freqs.push(freqs);
        }

        let total_len: usize = doc_len.iter().sum();
        let avgdl = if corpus.is_empty() {
            0.0
        } else {
            total_len as f64 / corpus.len() as f64
        };

        let n = corpus.len() as f64;
        let mut idf = HashMap::with_capacity(containing.len());
        let mut idf_sum = 0.0;
        let mut negative = Vec::new();
        for (token, freq) in containing {
            let freq = freq as f64;
            let value = (n - freq + 0.5).ln() - (freq + 0.5).ln();
            idf_sum += value;
            if value < 0.0 {
                negative.push(token.clone());
            }
            idf.insert(token, value);
        }
        if !idf.is_empty() {
            let floor = EPSILON * idf_sum / idf.len() as f64;
            for token in negative {
                idf.insert(token, floor);
            }
        }

        Self {
            doc_freqs,
            doc_len,
            avgdl,
            idf,
        }
    }

    /// Score of every corpus document against `query`, in corpus order.
    pub fn scores(&self, query: &[String]) -> Vec<f64> {
        let mut scores = vec![0.0; self.doc_freqs.len()];
        if self.avgdl <= 0.0 {
            return scores;
        }
        for term in query {
            let Some(idf) = self.idf.get(term) else {
                continue;
            };
            for (i, freqs) in self.doc_freqs.iter().enumerate() {
                let tf = freqs.get(term).copied().unwrap_or(0) as f64;
                if tf == 0.0 {
                    continue;
                }
                let norm = K1 * (1.0 - B + B * self.doc_len[i] as f64 / self.avgdl);
                scores[i] += idf * (tf * (K1 + 1.0)) / (tf + norm);
            }
        }
        scores
    }
}

#[derive(Default)]
struct State {
    chunks: Vec<Chunk>,
    tokens: Vec<Vec<String>>,
    model: Option<Bm25>,
}

impl State {
    fn rebuild(&mut self) {
        self.model = if self.tokens.is_empty() {
            None
        } else {
            Some(Bm25::new(&self.tokens))
        };
    }
}

#[derive(Default)]
pub struct LexicalIndex {
    state: RwLock<State>,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .chunks
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `chunks` (replacing any with the same id) and rebuild.
    pub fn update(&self, chunks: &[Chunk]) {
        if chunks.is_empty() {
            return;
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for chunk in chunks {
            let tokens = tokenize(&chunk.content);
            match state.chunks.iter().position(|c| c.id == chunk.id) {
                Some(i) => {
                    state.chunks[i] = chunk.clone();
                    state.tokens[i] = tokens;
                }
                None => {
                    state.chunks.push(chunk.clone());
                    state.tokens.push(tokens);
                }
            }
        }
        state.rebuild();
        tracing::debug!(corpus = state.chunks.len(), "lexical index rebuilt");
    }

    /// Drop every chunk of `document_id` and rebuild. Returns how many were removed.
    pub fn remove_document(&self, document_id: &str) -> usize {
        self.remove_where(|chunk| chunk.document_id() == Some(document_id))
    }

    /// Drop every chunk matching `predicate` and rebuild.
    pub fn remove_where(&self, predicate: impl Fn(&Chunk) -> bool) -> usize {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        let before = state.chunks.len();
        let (chunks, tokens): (Vec<Chunk>, Vec<Vec<String>>) = std::mem::take(&mut state.chunks)
            .into_iter()
            .zip(std::mem::take(&mut state.tokens))
            .filter(|(chunk, _)| !predicate(chunk))
            .unzip();
        state.chunks = chunks;
        state.tokens = tokens;

        let removed = before - state.chunks.len();
        if removed > 0 {
            state.rebuild();
        }
        removed
    }

    /// Top `top_k` chunks by descending BM25 score. Chunks sharing no
    /// term with the query are never returned.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<Chunk> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let Some(model) = state.model.as_ref() else {
            return Vec::new();
        };
        let scores = model.scores(&tokenize(query));
        let mut ranked: Vec<(usize, f64)> = scores
            .into_iter()
            .enumerate()
            .filter(|(_, score)| *score > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
            .into_iter()
            .take(top_k)
            .map(|(i, _)| state.chunks[i].clone())
            .collect()
    }
}
