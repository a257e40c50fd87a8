//! JSON serialization of grammars, tokenizer metadata and compiled
//! artifacts.
//!
//! All serialized objects carry a `__VERSION__` tag; deserialization fails
//! with a structured error when the tag does not match the implementation's
//! version (`"v2"`), when the JSON is malformed or when a required field is
//! missing. Two serializations of equal objects are byte-equal: hash-map
//! contents are emitted in sorted order and the arena is flattened in id
//! order.
use std::sync::Arc;

use ahash::AHashMap;
use jaggedarray::jagged_array::JaggedArray;
use jaggedarray::jagged_array::JaggedArrayViewTrait;
use serde::{Deserialize, Serialize};

use crate::compiler::{AdaptiveTokenMask, CompiledGrammar, PositionKey};
use crate::grammar::{Grammar, Rule, TagDispatchFsm};
use crate::tokenizer_info::{TokenizerInfo, TokenizerInfoMetadata};

/// The serialization format version this implementation reads and writes.
pub const SERIALIZATION_VERSION: &str = "v2";

/// The error type for serialization and deserialization failures.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    /// The artifact was produced by a different serialization version.
    #[error("Serialization version mismatch: expected \"v2\", got \"{0}\"")]
    VersionMismatch(String),
    /// The JSON is invalid or a required field is missing or inconsistent.
    #[error("Malformed serialized data: {0}")]
    Malformed(String),
}

#[derive(Serialize, Deserialize)]
struct ExprDataSerde {
    data_: Vec<i32>,
    indptr_: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct GrammarSerde {
    rules_: Vec<(String, i32, i32)>,
    grammar_expr_data_: ExprDataSerde,
    root_rule_id_: i32,
    root_tag_dispatch_fsm: Option<TagDispatchFsm>,
    tag_dispatch_end_node_to_rule_id: Vec<(u32, i32)>,
    allow_empty_rule_ids: Vec<i32>,
    #[serde(rename = "__VERSION__")]
    version: String,
}

fn grammar_to_serde(grammar: &Grammar) -> GrammarSerde {
    let mut data_ = Vec::new();
    let mut indptr_ = Vec::with_capacity(grammar.num_exprs() + 1);
    indptr_.push(0);
    for expr_id in 0..grammar.num_exprs() {
        data_.extend_from_slice(grammar.expr_payload(expr_id as i32));
        indptr_.push(data_.len());
    }
    let (root_tag_dispatch_fsm, tag_dispatch_end_node_to_rule_id) =
        match grammar.root_tag_dispatch_expr() {
            Some(dispatch) => {
                let fsm = grammar.fsm(dispatch).clone();
                let spec = match grammar.expr(dispatch) {
                    crate::grammar::ExprView::TagDispatch(payload) => {
                        crate::grammar::TagDispatchSpec::decode(payload)
                    }
                    _ => unreachable!("root_tag_dispatch_expr returns dispatch expressions"),
                };
                let mut end_nodes: Vec<(u32, i32)> = fsm
                    .trigger_end_nodes()
                    .into_iter()
                    .map(|(node, pair)| (node, spec.pairs[pair as usize].1 .0))
                    .collect();
                end_nodes.sort_unstable();
                (Some(fsm), end_nodes)
            }
            None => (None, Vec::new()),
        };
    GrammarSerde {
        rules_: grammar
            .rules
            .iter()
            .map(|r| (r.name().to_string(), r.body_expr_id(), r.lookahead_expr_id()))
            .collect(),
        grammar_expr_data_: ExprDataSerde { data_, indptr_ },
        root_rule_id_: grammar.root_rule_id().0,
        root_tag_dispatch_fsm,
        tag_dispatch_end_node_to_rule_id,
        allow_empty_rule_ids: grammar.allow_empty_rule_ids().to_vec(),
        version: SERIALIZATION_VERSION.to_string(),
    }
}

fn grammar_from_serde(serde_grammar: GrammarSerde) -> Result<Grammar, SerializationError> {
    check_version(&serde_grammar.version)?;
    let ExprDataSerde { data_, indptr_ } = serde_grammar.grammar_expr_data_;
    if indptr_.first() != Some(&0) || indptr_.last() != Some(&data_.len()) {
        return Err(SerializationError::Malformed(
            "grammar_expr_data_ index pointers are inconsistent".to_string(),
        ));
    }
    let mut expr_data = JaggedArray::<i32, Vec<usize>, 2>::new();
    for window in indptr_.windows(2) {
        let (start, end) = (window[0], window[1]);
        if start > end || end > data_.len() {
            return Err(SerializationError::Malformed(
                "grammar_expr_data_ index pointers are not monotonic".to_string(),
            ));
        }
        expr_data.new_row::<0>();
        expr_data.extend_last_row_from_slice(&data_[start..end]);
    }
    let num_exprs = indptr_.len().saturating_sub(1) as i32;
    let mut rules = Vec::with_capacity(serde_grammar.rules_.len());
    for (name, body_expr_id, lookahead_expr_id) in serde_grammar.rules_ {
        if body_expr_id < 0 || body_expr_id >= num_exprs {
            return Err(SerializationError::Malformed(format!(
                "rule \"{}\" references expression {} out of {}",
                name, body_expr_id, num_exprs
            )));
        }
        rules.push(Rule::from_parts(name, body_expr_id, lookahead_expr_id));
    }
    if serde_grammar.root_rule_id_ < 0 || serde_grammar.root_rule_id_ as usize >= rules.len() {
        return Err(SerializationError::Malformed(format!(
            "root rule id {} is out of range",
            serde_grammar.root_rule_id_
        )));
    }
    let mut grammar = Grammar::from_serialized_parts(
        rules,
        expr_data,
        serde_grammar.root_rule_id_,
        serde_grammar.allow_empty_rule_ids,
    );
    // Scanning automata are deterministic functions of the dispatch
    // expressions; rebuilding reproduces the serialized ones.
    grammar.rebuild_tag_dispatch_fsms();
    Ok(grammar)
}

/// Serializes a grammar to its v2 JSON form.
pub(crate) fn serialize_grammar(grammar: &Grammar) -> String {
    serde_json::to_string(&grammar_to_serde(grammar)).expect("grammar serialization cannot fail")
}

/// Deserializes a grammar from its v2 JSON form.
pub(crate) fn deserialize_grammar(json: &str) -> Result<Grammar, SerializationError> {
    let serde_grammar: GrammarSerde = parse_with_version_check(json)?;
    grammar_from_serde(serde_grammar)
}

#[derive(Serialize, Deserialize)]
struct TokenizerInfoSerde {
    vocab_type: i32,
    vocab_size: usize,
    add_prefix_space: bool,
    stop_token_ids: Vec<i32>,
    special_token_ids: Vec<i32>,
    #[serde(rename = "__VERSION__")]
    version: String,
}

/// Serializes tokenizer metadata to its v2 JSON form. The decoded
/// vocabulary is not embedded.
pub(crate) fn serialize_tokenizer_info(info: &TokenizerInfo) -> String {
    let metadata = info.metadata();
    let serde_info = TokenizerInfoSerde {
        vocab_type: metadata.vocab_type,
        vocab_size: metadata.vocab_size,
        add_prefix_space: metadata.add_prefix_space,
        stop_token_ids: metadata.stop_token_ids,
        special_token_ids: metadata.special_token_ids,
        version: SERIALIZATION_VERSION.to_string(),
    };
    serde_json::to_string(&serde_info).expect("tokenizer serialization cannot fail")
}

/// Deserializes tokenizer metadata and rebuilds the [`TokenizerInfo`] from
/// the supplied encoded vocabulary.
pub(crate) fn deserialize_tokenizer_info<T: AsRef<[u8]>>(
    json: &str,
    encoded_vocab: &[T],
) -> Result<TokenizerInfo, SerializationError> {
    let serde_info: TokenizerInfoSerde = parse_with_version_check(json)?;
    check_version(&serde_info.version)?;
    let metadata = TokenizerInfoMetadata {
        vocab_type: serde_info.vocab_type,
        vocab_size: serde_info.vocab_size,
        add_prefix_space: serde_info.add_prefix_space,
        stop_token_ids: serde_info.stop_token_ids,
        special_token_ids: serde_info.special_token_ids,
    };
    TokenizerInfo::from_vocab_and_parsed_metadata(encoded_vocab, &metadata)
}

#[derive(Serialize, Deserialize)]
struct CacheEntrySerde {
    position: PositionKey,
    mask: AdaptiveTokenMask,
}

#[derive(Serialize, Deserialize)]
struct CompiledGrammarSerde {
    grammar_: GrammarSerde,
    tokenizer_metadata_: TokenizerInfoMetadata,
    adaptive_token_mask_cache: Vec<CacheEntrySerde>,
    #[serde(rename = "__VERSION__")]
    version: String,
}

/// Serializes a compiled grammar (grammar + mask cache + tokenizer
/// metadata) to its v2 JSON form.
pub(crate) fn serialize_compiled_grammar(compiled: &CompiledGrammar) -> String {
    let serde_compiled = CompiledGrammarSerde {
        grammar_: grammar_to_serde(compiled.grammar()),
        tokenizer_metadata_: compiled.tokenizer_info().metadata(),
        adaptive_token_mask_cache: compiled
            .cache_entries_sorted()
            .into_iter()
            .map(|(position, mask)| CacheEntrySerde { position, mask: mask.clone() })
            .collect(),
        version: SERIALIZATION_VERSION.to_string(),
    };
    serde_json::to_string(&serde_compiled).expect("compiled grammar serialization cannot fail")
}

/// Deserializes a compiled grammar. The tokenizer info is supplied by the
/// caller and validated against the embedded metadata.
pub(crate) fn deserialize_compiled_grammar(
    json: &str,
    tokenizer_info: Arc<TokenizerInfo>,
) -> Result<CompiledGrammar, SerializationError> {
    let serde_compiled: CompiledGrammarSerde = parse_with_version_check(json)?;
    check_version(&serde_compiled.version)?;
    let metadata = tokenizer_info.metadata();
    if metadata.vocab_size != serde_compiled.tokenizer_metadata_.vocab_size
        || metadata.vocab_type != serde_compiled.tokenizer_metadata_.vocab_type
    {
        return Err(SerializationError::Malformed(
            "the supplied tokenizer does not match the artifact's tokenizer metadata".to_string(),
        ));
    }
    let grammar = grammar_from_serde(serde_compiled.grammar_)?;
    let mut cache: AHashMap<PositionKey, AdaptiveTokenMask> = AHashMap::default();
    for entry in serde_compiled.adaptive_token_mask_cache {
        cache.insert(entry.position, entry.mask);
    }
    Ok(CompiledGrammar::from_parts(grammar, tokenizer_info, cache))
}

fn check_version(version: &str) -> Result<(), SerializationError> {
    if version != SERIALIZATION_VERSION {
        return Err(SerializationError::VersionMismatch(version.to_string()));
    }
    Ok(())
}

/// Parses a serialized object, reporting a version mismatch in preference
/// to a generic parse error when the `__VERSION__` field is readable.
fn parse_with_version_check<T: for<'de> Deserialize<'de>>(
    json: &str,
) -> Result<T, SerializationError> {
    match serde_json::from_str::<T>(json) {
        Ok(value) => Ok(value),
        Err(error) => {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(json) {
                if let Some(version) = value.get("__VERSION__").and_then(|v| v.as_str()) {
                    check_version(version)?;
                }
            }
            Err(SerializationError::Malformed(error.to_string()))
        }
    }
}
