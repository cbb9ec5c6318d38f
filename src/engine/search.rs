//! Hybrid Search Executor (HSE) — lexical, vector, and fused retrieval
//! (§4.5).
//!
//! SQLite has no native full outer join between an fts5 virtual table and a
//! vec0 virtual table, so Shape C runs the lexical and vector queries
//! independently and fuses the two ranked lists in Rust, the way
//! `HybridSearchEngine` does it in the corpus's own hybrid-search example:
//! fetch both candidate sets, rank each, then combine by row identifier.

use std::collections::HashMap;

use crate::engine::error::EngineError;
use crate::engine::storage::StorageEngine;
use crate::engine::value::{vector_to_query_text, Value};

const RRF_K: f64 = 60.0;
const DEFAULT_LIMIT: usize = 10;

/// The shape a caller's query takes. Shape A and B degenerate naturally out
/// of the fusion codepath (an absent side just contributes nothing), but
/// keeping them distinct lets the dispatcher's `searchText`/`searchVector`
/// aliases build a `Query` without fabricating the other side.
#[derive(Debug, Clone)]
pub enum Query {
    Lexical { text: String },
    Vector { embedding: Vec<f32> },
    Hybrid {
        text: String,
        embedding: Option<Vec<f32>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionMethod {
    Rrf,
    Weighted,
}

#[derive(Debug, Clone, Copy)]
pub struct FusionWeights {
    pub lexical: f64,
    pub vector: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            lexical: 0.5,
            vector: 0.5,
        }
    }
}

/// Lets a host resolve a text query to an embedding for Shape C when it
/// supplies text but not a vector (§6 `enableEmbedding`). The engine never
/// calls an embedding model itself; this is a seam the dispatcher fills in
/// with its LLM client, if one is configured.
pub trait QueryEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError>;
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub collection: String,
    pub query: Query,
    pub limit: usize,
    pub fusion: FusionMethod,
    pub weights: FusionWeights,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            collection: "default".to_string(),
            query: Query::Lexical {
                text: String::new(),
            },
            limit: DEFAULT_LIMIT,
            fusion: FusionMethod::Rrf,
            weights: FusionWeights::default(),
        }
    }
}

/// The per-row host envelope (§4.5 "Result shape"): `score` is the fused
/// score across whichever shape ran; `ftsScore`/`vecScore` are the
/// per-component contributions so a caller can see how a result was found,
/// not just where it landed.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    pub id: String,
    pub title: Option<String>,
    pub content: String,
    pub metadata: serde_json::Value,
    #[serde(rename = "score")]
    pub fusion_score: f64,
    pub fts_score: f64,
    pub vec_score: f64,
}

/// `totalResults` is the length of `results`; `searchTime` is wall-clock
/// milliseconds for the whole HSE operation including query construction
/// (§4.5).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<ResultRow>,
    pub shape: &'static str,
    pub total_results: usize,
    pub search_time: u128,
}

struct LexicalHit {
    rowid: i64,
    bm25: f64, // raw fts5 bm25() value: lower is better, always <= 0
}

struct VectorHit {
    rowid: i64,
    distance: f64, // lower is better
}

/// Tokenizes a query by splitting on one-or-more whitespace; more than one
/// token is joined with ` OR ` so fts5's default AND-of-tokens MATCH syntax
/// instead matches any token, otherwise the single token passes through
/// unchanged (§4.5 Shape A).
fn tokenize_for_match(text: &str) -> String {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() > 1 {
        tokens.join(" OR ")
    } else {
        text.to_string()
    }
}

struct BaseRow {
    id: String,
    title: Option<String>,
    content: String,
    metadata: serde_json::Value,
}

pub struct HybridSearchExecutor;

impl HybridSearchExecutor {
    /// Runs whichever of Shapes A/B/C the request implies and wraps the
    /// result with `totalResults`/`searchTime` (§4.5), timed across query
    /// construction and execution. Errors propagate to the caller
    /// un-downgraded; the "any execution error becomes an empty result"
    /// policy of §7 is the dispatcher's responsibility, not HSE's, so that
    /// HSE itself stays a plain, testable `Result`.
    pub fn search(
        se: &StorageEngine,
        request: &SearchRequest,
        embedder: Option<&dyn QueryEmbedder>,
    ) -> Result<SearchResponse, EngineError> {
        let started = std::time::Instant::now();
        // A limit of 0 always yields an empty list (§8), with no SQL issued.
        if request.limit == 0 {
            return Ok(SearchResponse {
                results: Vec::new(),
                shape: "none",
                total_results: 0,
                search_time: started.elapsed().as_millis(),
            });
        }
        let (rows, shape) = Self::execute(se, request, embedder)?;
        Ok(SearchResponse {
            total_results: rows.len(),
            results: rows,
            shape,
            search_time: started.elapsed().as_millis(),
        })
    }

    fn execute(
        se: &StorageEngine,
        request: &SearchRequest,
        embedder: Option<&dyn QueryEmbedder>,
    ) -> Result<(Vec<ResultRow>, &'static str), EngineError> {
        // A limit of 0 is handled by `search` before `execute` is reached.
        let limit = request.limit;

        match &request.query {
            Query::Lexical { text } => {
                if text.trim().is_empty() {
                    return Err(EngineError::BadRequest(
                        "lexical search requires non-empty query text".into(),
                    ));
                }
                let lexical = Self::run_lexical(se, &request.collection, text, limit)?;
                let rows = Self::hydrate(se, &request.collection, lexical, Vec::new(), request, false)?;
                Ok((rows, "lexical"))
            }
            Query::Vector { embedding } => {
                Self::require_vector_support(se)?;
                let vector = Self::run_vector(se, &request.collection, embedding, limit)?;
                let rows = Self::hydrate(se, &request.collection, Vec::new(), vector, request, true)?;
                Ok((rows, "vector"))
            }
            Query::Hybrid { text, embedding } => {
                if text.trim().is_empty() {
                    return Err(EngineError::BadRequest(
                        "hybrid search requires non-empty query text".into(),
                    ));
                }
                // §4.5 `enableEmbedding`: a caller supplying text but no
                // vector relies on the configured embedder to resolve one.
                // Unlike a genuine Shape B/C failure, losing that resolution
                // is not fatal — it degrades to Shape A with a warning,
                // the same as if the caller had never asked for embedding.
                // A caller who already supplied a vector is making a real
                // Shape C request, so an unavailable vector-index facility
                // there is a hard `BadRequest`, not a silent downgrade.
                let resolved_embedding = match embedding {
                    Some(v) => {
                        Self::require_vector_support(se)?;
                        Some(v.clone())
                    }
                    None => Self::resolve_embedding_or_warn(se, embedder, text),
                };

                let Some(resolved_embedding) = resolved_embedding else {
                    let lexical = Self::run_lexical(se, &request.collection, text, limit)?;
                    let rows =
                        Self::hydrate(se, &request.collection, lexical, Vec::new(), request, false)?;
                    return Ok((rows, "lexical"));
                };

                let lexical = Self::run_lexical(se, &request.collection, text, limit)?;
                let vector = Self::run_vector(se, &request.collection, &resolved_embedding, limit)?;
                let rows = Self::hydrate(se, &request.collection, lexical, vector, request, true)?;
                Ok((rows, "hybrid"))
            }
        }
    }

    /// Resolves a query embedding for Shape C's `enableEmbedding` path
    /// (§4.5). Returns `None` — logging a warning, never an error — when
    /// there is no vector-index facility, no embedder configured, or the
    /// embedder call itself fails; the caller falls back to Shape A.
    fn resolve_embedding_or_warn(
        se: &StorageEngine,
        embedder: Option<&dyn QueryEmbedder>,
        text: &str,
    ) -> Option<Vec<f32>> {
        if !se.vector_available() {
            tracing::warn!("enableEmbedding requested but the vector-index facility is unavailable; falling back to lexical-only search");
            return None;
        }
        let Some(embedder) = embedder else {
            tracing::warn!("enableEmbedding requested but no query embedder is configured; falling back to lexical-only search");
            return None;
        };
        match embedder.embed(text) {
            Ok(vector) => Some(vector),
            Err(e) => {
                tracing::warn!(error = %e, "query embedding call failed; falling back to lexical-only search");
                None
            }
        }
    }

    fn require_vector_support(se: &StorageEngine) -> Result<(), EngineError> {
        if se.vector_available() {
            Ok(())
        } else {
            Err(EngineError::BadRequest(
                "vector search requested but the vector-index facility is unavailable".into(),
            ))
        }
    }

    fn run_lexical(
        se: &StorageEngine,
        collection: &str,
        text: &str,
        limit: usize,
    ) -> Result<Vec<LexicalHit>, EngineError> {
        let match_expr = tokenize_for_match(text);
        let result = se.select(
            "SELECT d.rowid AS rowid, bm25(fts_default) AS score \
             FROM fts_default AS f \
             JOIN docs_default AS d ON d.rowid = f.rowid \
             WHERE fts_default MATCH ? AND d.collection = ? \
             ORDER BY score LIMIT ?",
            &[
                Value::text(match_expr),
                Value::text(collection),
                Value::Integer(limit as i64),
            ],
        )?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| {
                let rowid = row.get("rowid")?.as_i64()?;
                let bm25 = row.get("score")?.as_f64().unwrap_or(0.0);
                Some(LexicalHit { rowid, bm25 })
            })
            .collect())
    }

    fn run_vector(
        se: &StorageEngine,
        collection: &str,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>, EngineError> {
        let table = format!("vec_{collection}_dense");
        let result = se.select(
            &format!(
                "SELECT rowid AS rowid, distance AS distance FROM {table} \
                 WHERE embedding MATCH ? AND k = ? ORDER BY distance"
            ),
            &[
                Value::text(vector_to_query_text(embedding)),
                Value::Integer(limit as i64),
            ],
        )?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| {
                let rowid = row.get("rowid")?.as_i64()?;
                let distance = row.get("distance")?.as_f64().unwrap_or(1.0);
                Some(VectorHit { rowid, distance })
            })
            .collect())
    }

    fn base_row(se: &StorageEngine, rowid: i64) -> Result<Option<BaseRow>, EngineError> {
        let result = se.select(
            "SELECT id, title, content, metadata FROM docs_default WHERE rowid = ?",
            &[Value::Integer(rowid)],
        )?;
        Ok(result.rows.first().map(|row| BaseRow {
            id: row
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            title: row.get("title").and_then(|v| v.as_str()).map(str::to_string),
            content: row
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            metadata: row
                .get("metadata")
                .and_then(|v| v.as_str())
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or(serde_json::json!({})),
        }))
    }

    /// Merges lexical and vector candidate lists by rowid, computes 1-indexed
    /// ranks within each side, fuses a score per the request's fusion method,
    /// sorts descending by that score, and hydrates base-table content for
    /// the top `request.limit` rows.
    ///
    /// `has_vector_component` distinguishes Shape A (lexical-only) from
    /// Shapes B/C: a row with no vector hit reports `vecScore = 0` in Shape
    /// A (spec §4.5 Shape A hardcodes `0 AS vec_score`) but `vecScore = 1`
    /// in Shape C, matching that shape's `COALESCE(v.vec_score, 1)`. Shape B
    /// never has a row without a vector hit, so its default is never
    /// observed either way.
    fn hydrate(
        se: &StorageEngine,
        _collection: &str,
        lexical: Vec<LexicalHit>,
        vector: Vec<VectorHit>,
        request: &SearchRequest,
        has_vector_component: bool,
    ) -> Result<Vec<ResultRow>, EngineError> {
        let mut fts_score: HashMap<i64, f64> = HashMap::new();
        let mut fts_rank: HashMap<i64, usize> = HashMap::new();
        for (index, hit) in lexical.iter().enumerate() {
            fts_score.insert(hit.rowid, hit.bm25); // raw fts5 value, <= 0 (§4.5, §8 scenario 1)
            fts_rank.insert(hit.rowid, index + 1);
        }

        let mut vec_score: HashMap<i64, f64> = HashMap::new();
        let mut vec_rank: HashMap<i64, usize> = HashMap::new();
        for (index, hit) in vector.iter().enumerate() {
            vec_score.insert(hit.rowid, hit.distance);
            vec_rank.insert(hit.rowid, index + 1);
        }

        let mut rowids: Vec<i64> = fts_score.keys().chain(vec_score.keys()).copied().collect();
        rowids.sort_unstable();
        rowids.dedup();

        let mut scored: Vec<(i64, f64)> = rowids
            .iter()
            .map(|rowid| {
                let score = match request.fusion {
                    FusionMethod::Rrf => {
                        let lex = fts_rank
                            .get(rowid)
                            .map(|r| 1.0 / (RRF_K + *r as f64))
                            .unwrap_or(0.0);
                        let vec = vec_rank
                            .get(rowid)
                            .map(|r| 1.0 / (RRF_K + *r as f64))
                            .unwrap_or(0.0);
                        lex + vec
                    }
                    FusionMethod::Weighted => {
                        // spec's `? * COALESCE(-f.fts_score, 0)`: negate only for the
                        // fusion contribution so higher is better; the reported
                        // `ftsScore` itself stays the raw negative bm25 value.
                        let lex = -fts_score.get(rowid).copied().unwrap_or(0.0);
                        let vec = vec_score
                            .get(rowid)
                            .map(|d| 1.0 / (1.0 + d))
                            .unwrap_or(0.0);
                        request.weights.lexical * lex + request.weights.vector * vec
                    }
                };
                (*rowid, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        // A limit of 0 is handled by `search` before `hydrate` is reached.
        scored.truncate(request.limit);

        let missing_vec_score = if has_vector_component { 1.0 } else { 0.0 };
        let mut results = Vec::with_capacity(scored.len());
        for (rowid, fusion_score) in scored {
            let Some(base) = Self::base_row(se, rowid)? else {
                continue;
            };
            results.push(ResultRow {
                id: base.id,
                title: base.title,
                content: base.content,
                metadata: base.metadata,
                fts_score: fts_score.get(&rowid).copied().unwrap_or(0.0),
                vec_score: vec_score.get(&rowid).copied().unwrap_or(missing_vec_score),
                fusion_score,
            });
        }
        Ok(results)
    }
}
