//! Lexical (keyword) search over fact content, built at query time —
//! same trade-off the teacher makes in its own `search` method: an
//! in-memory `tantivy` index rebuilt from scratch per call keeps the
//! feature self-contained at the cost of redoing the work every time.
//! Acceptable at the corpus sizes this engine targets; a persisted
//! index is future work if that stops being true.

use std::collections::HashMap;

use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, FuzzyTermQuery, Occur, QueryParser};
use tantivy::schema::{Field, Schema, Value as _, STORED, STRING, TEXT};
use tantivy::{doc, Index, Term};

use crate::error::Result;
use crate::types::Fact;

fn build_index(facts: &[Fact]) -> Result<(Index, Field, Field)> {
    let mut schema_builder = Schema::builder();
    let id_field = schema_builder.add_text_field("id", STRING | STORED);
    let content_field = schema_builder.add_text_field("content", TEXT);
    let schema = schema_builder.build();
    let index = Index::create_in_ram(schema);
    let mut writer = index.writer(50_000_000)?;

    for fact in facts {
        let tags = fact.tags.iter().cloned().collect::<Vec<_>>().join(" ");
        let content = format!("{} {}", fact.content, tags);
        writer.add_document(doc!(
            id_field => fact.id.0.clone(),
            content_field => content,
        ))?;
    }

    writer.commit()?;
    Ok((index, id_field, content_field))
}

fn fuzzy_query(query: &str, content_field: Field) -> BooleanQuery {
    let terms: Vec<(Occur, Box<dyn tantivy::query::Query>)> = query
        .split_whitespace()
        .filter(|token| !token.is_empty())
        .map(|token| {
            let term = Term::from_field_text(content_field, token);
            (
                Occur::Should,
                Box::new(FuzzyTermQuery::new(term, 1, true)) as Box<dyn tantivy::query::Query>,
            )
        })
        .collect();
    BooleanQuery::new(terms)
}

/// Rank `facts` against `query`, falling back to a one-edit fuzzy match
/// per term if the exact query returns nothing (typo tolerance for
/// short queries, e.g. `"rst"` still finding `"rust"`).
pub fn search(facts: &[Fact], query: &str, limit: usize) -> Result<Vec<Fact>> {
    if query.trim().is_empty() || limit == 0 || facts.is_empty() {
        return Ok(Vec::new());
    }

    let (index, id_field, content_field) = build_index(facts)?;
    let reader = index.reader()?;
    let searcher = reader.searcher();

    let parser = QueryParser::for_index(&index, vec![content_field]);
    let parsed = parser.parse_query(query)?;
    let mut top_docs = searcher.search(&parsed, &TopDocs::with_limit(limit))?;

    if top_docs.is_empty() {
        let fuzzy = fuzzy_query(query, content_field);
        top_docs = searcher.search(&fuzzy, &TopDocs::with_limit(limit))?;
    }

    let facts_by_id: HashMap<String, Fact> =
        facts.iter().map(|f| (f.id.0.clone(), f.clone())).collect();
    let mut results = Vec::new();
    for (_score, addr) in top_docs {
        let retrieved = searcher.doc::<tantivy::schema::TantivyDocument>(addr)?;
        if let Some(id) = retrieved.get_first(id_field).and_then(|v| v.as_str()) {
            if let Some(fact) = facts_by_id.get(id) {
                results.push(fact.clone());
            }
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::FactId;
    use crate::types::{Confidence, FactType};
    use chrono::Utc;

    fn fact(content: &str) -> Fact {
        Fact {
            id: FactId::new(),
            project: "demo".into(),
            content: content.into(),
            fact_type: FactType::Knowledge,
            tags: Default::default(),
            confidence: Confidence::Stated,
            source: None,
            created_at: Utc::now(),
            valid_from: Utc::now(),
            valid_until: None,
            context: None,
        }
    }

    #[test]
    fn exact_term_matches() {
        let facts = vec![fact("rust has ownership"), fact("python has duck typing")];
        let results = search(&facts, "ownership", 5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "rust has ownership");
    }

    #[test]
    fn empty_query_returns_nothing() {
        let facts = vec![fact("rust has ownership")];
        let results = search(&facts, "   ", 5).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn fuzzy_fallback_finds_typo() {
        let facts = vec![fact("rust has ownership")];
        let results = search(&facts, "onwership", 5).unwrap();
        assert_eq!(results.len(), 1);
    }
}
