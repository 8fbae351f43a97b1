//! Keyword search over record descriptions and tags.
//!
//! A tantivy index held in RAM; it is rebuilt from the Record Store on start.
//! Text is split on every non-alphanumeric Unicode character and lower-cased,
//! so Hangul, CJK and Latin text tokenise alike. Queries are analysed the
//! same way and become a disjunction of term queries: description matches
//! count once, tag token matches get `tag_boost`, and a query token equal to
//! a whole tag gets `exact_tag_boost`. BM25 supplies the term-frequency part.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, BoostQuery, Occur, Query, TermQuery};
use tantivy::schema::{
    FAST, Field, INDEXED, IndexRecordOption, STORED, STRING, Schema, TextFieldIndexing,
    TextOptions, Value,
};
use tantivy::tokenizer::{LowerCaser, RemoveLongFilter, SimpleTokenizer, TextAnalyzer};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, TantivyError, Term};
use thiserror::Error;

use crate::config::TextConfig;
use crate::types::{LocationId, LocationRecord};

const ANALYZER_NAME: &str = "geotag_text";

/// Tantivy refuses writer arenas below this size.
const MIN_WRITER_MEMORY: usize = 15_000_000;

/// Tokens longer than this many bytes are dropped.
const MAX_TOKEN_BYTES: usize = 40;

/// The analyzer applied to indexed text and to queries.
///
/// Splits on every non-alphanumeric character, drops overlong tokens and
/// lower-cases the rest.
pub fn text_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(MAX_TOKEN_BYTES))
        .filter(LowerCaser)
        .build()
}

#[derive(Error, Debug)]
pub enum TextIndexError {
    #[error("Tantivy error: {0}")]
    Tantivy(#[from] TantivyError),

    #[error("Document for location {0} has no location_id field")]
    MissingIdentity(String),
}

#[derive(Debug, Clone, Copy)]
struct TextFields {
    location_id: Field,
    revision: Field,
    description: Field,
    tags: Field,
    tag_exact: Field,
}

pub struct TextIndex {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    analyzer: TextAnalyzer,
    fields: TextFields,
    tag_boost: f32,
    exact_tag_boost: f32,
    /// Committed revision of every indexed identity.
    committed: RwLock<HashMap<LocationId, u64>>,
}

impl std::fmt::Debug for TextIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextIndex")
            .field("documents", &self.len())
            .field("tag_boost", &self.tag_boost)
            .field("exact_tag_boost", &self.exact_tag_boost)
            .finish()
    }
}

impl TextIndex {
    pub fn new(config: &TextConfig) -> Result<Self, TextIndexError> {
        let mut schema_builder = Schema::builder();

        let text_options = TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(ANALYZER_NAME)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        );

        let fields = TextFields {
            location_id: schema_builder.add_u64_field("location_id", INDEXED | STORED | FAST),
            revision: schema_builder.add_u64_field("revision", STORED),
            description: schema_builder.add_text_field("description", text_options.clone()),
            tags: schema_builder.add_text_field("tags", text_options),
            tag_exact: schema_builder.add_text_field("tag_exact", STRING),
        };

        let index = Index::create_in_ram(schema_builder.build());

        let analyzer = text_analyzer();
        index.tokenizers().register(ANALYZER_NAME, analyzer.clone());

        let writer: IndexWriter = index
            .writer_with_num_threads(1, config.writer_memory_bytes.max(MIN_WRITER_MEMORY))?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            index,
            reader,
            writer: Mutex::new(writer),
            analyzer,
            fields,
            tag_boost: config.tag_boost,
            exact_tag_boost: config.exact_tag_boost,
            committed: RwLock::new(HashMap::new()),
        })
    }

    /// Indexes or replaces one record.
    pub fn index(&self, record: &LocationRecord) -> Result<(), TextIndexError> {
        self.index_batch(std::slice::from_ref(record))
    }

    /// Indexes or replaces records with a single commit.
    pub fn index_batch(&self, records: &[LocationRecord]) -> Result<(), TextIndexError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut writer = self.writer.lock();
        for record in records {
            writer.delete_term(self.id_term(record.id));
            writer.add_document(self.document_for(record))?;
        }
        if let Err(e) = self.commit(&mut writer) {
            Self::rollback(&mut writer);
            return Err(e);
        }

        let mut committed = self.committed.write();
        for record in records {
            committed.insert(record.id, record.revision);
        }
        tracing::debug!("text index: committed {} documents", records.len());
        Ok(())
    }

    /// Removes `id`. Returns whether it was indexed.
    pub fn remove(&self, id: LocationId) -> Result<bool, TextIndexError> {
        let mut writer = self.writer.lock();
        if !self.committed.read().contains_key(&id) {
            return Ok(false);
        }
        writer.delete_term(self.id_term(id));
        if let Err(e) = self.commit(&mut writer) {
            Self::rollback(&mut writer);
            return Err(e);
        }
        self.committed.write().remove(&id);
        Ok(true)
    }

    /// Matching identities, most relevant first. Ties go to the lower identity.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<(LocationId, f32)>, TextIndexError> {
        let tokens = self.analyze(query);
        let limit = limit.min(self.len());
        if tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::with_capacity(tokens.len() * 3 + 1);
        for token in &tokens {
            clauses.push((
                Occur::Should,
                Box::new(TermQuery::new(
                    Term::from_field_text(self.fields.description, token),
                    IndexRecordOption::WithFreqs,
                )),
            ));
            clauses.push((
                Occur::Should,
                Box::new(BoostQuery::new(
                    Box::new(TermQuery::new(
                        Term::from_field_text(self.fields.tags, token),
                        IndexRecordOption::WithFreqs,
                    )),
                    self.tag_boost,
                )),
            ));
            clauses.push((Occur::Should, self.exact_tag_query(token)));
        }
        // A multi-word query may spell out a whole tag
        let whole = query.trim().to_lowercase();
        if tokens.len() > 1 && !whole.is_empty() {
            clauses.push((Occur::Should, self.exact_tag_query(&whole)));
        }

        let query = BooleanQuery::new(clauses);
        let searcher = self.reader.searcher();
        let available = searcher.num_docs() as usize;
        // Equal scores come back in doc order, which says nothing about identity.
        // Widen the window until the cut no longer splits a run of tied scores.
        let mut window = limit;
        let top_docs = loop {
            let top_docs = searcher.search(&query, &TopDocs::with_limit(window))?;
            let cut_is_tied = top_docs.len() == window
                && window < available
                && top_docs.last().map(|(score, _)| *score)
                    == top_docs.get(limit - 1).map(|(score, _)| *score);
            if !cut_is_tied {
                break top_docs;
            }
            window = window.saturating_mul(2).min(available);
        };

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let document: TantivyDocument = searcher.doc(address)?;
            let raw = document
                .get_first(self.fields.location_id)
                .and_then(|v| v.as_u64())
                .ok_or_else(|| TextIndexError::MissingIdentity(format!("{address:?}")))?;
            if let Some(id) = LocationId::new(raw) {
                hits.push((id, score));
            }
        }

        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Whether `id` is indexed at `revision`.
    pub fn matches(&self, id: LocationId, revision: u64) -> bool {
        self.committed.read().get(&id) == Some(&revision)
    }

    pub fn contains(&self, id: LocationId) -> bool {
        self.committed.read().contains_key(&id)
    }

    pub fn ids(&self) -> Vec<LocationId> {
        let mut ids: Vec<_> = self.committed.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.committed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lower-cased tokens of `text`, as the index sees them.
    pub fn analyze(&self, text: &str) -> Vec<String> {
        let mut analyzer = self.analyzer.clone();
        let mut stream = analyzer.token_stream(text);
        let mut tokens: Vec<String> = Vec::new();
        while stream.advance() {
            let token = &stream.token().text;
            if !tokens.contains(token) {
                tokens.push(token.clone());
            }
        }
        tokens
    }

    fn exact_tag_query(&self, tag: &str) -> Box<dyn Query> {
        Box::new(BoostQuery::new(
            Box::new(TermQuery::new(
                Term::from_field_text(self.fields.tag_exact, tag),
                IndexRecordOption::Basic,
            )),
            self.exact_tag_boost,
        ))
    }

    fn id_term(&self, id: LocationId) -> Term {
        Term::from_field_u64(self.fields.location_id, id.get())
    }

    fn document_for(&self, record: &LocationRecord) -> TantivyDocument {
        let mut document = TantivyDocument::default();
        document.add_u64(self.fields.location_id, record.id.get());
        document.add_u64(self.fields.revision, record.revision);
        document.add_text(self.fields.description, &record.description);
        document.add_text(self.fields.tags, record.tags.join(" "));
        for tag in &record.tags {
            document.add_text(self.fields.tag_exact, tag);
        }
        document
    }

    fn commit(&self, writer: &mut IndexWriter) -> Result<(), TextIndexError> {
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    fn rollback(writer: &mut IndexWriter) {
        if let Err(e) = writer.rollback() {
            tracing::warn!("text index: rollback after failed commit also failed: {e}");
        }
    }

    #[cfg(test)]
    fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }
}
