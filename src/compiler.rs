//! The grammar compiler: precomputes the adaptive per-position token-mask
//! cache that makes bitmask filling nearly free at decode time.
//!
//! For every position of the normalized grammar (element boundaries, byte
//! offsets inside literals and tag-dispatch scan states) the compiler
//! classifies every vocabulary token as always accepted, always rejected or
//! uncertain, by feeding the token's decoded bytes through a context-free
//! configuration rooted at that position. The per-position result stores the
//! smaller of the accepted/rejected id lists plus the uncertain list, which
//! the matcher verifies at runtime.
//!
//! Cache construction is parallelized over positions on a bounded thread
//! pool; position order is fixed, so equal inputs compile to byte-equal
//! serialized artifacts.
use std::sync::{Arc, Mutex, OnceLock};

use ahash::AHashMap;
use fixedbitset_stack::FixedBitSet;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::grammar::{ExprId, ExprView, Grammar, GrammarError, RuleId};
use crate::json_schema::JsonSchemaOptions;
use crate::matcher::{Pda, Stack, StackFrame};
use crate::structural_tag::StructuralTag;
use crate::tokenizer_info::TokenizerInfo;
use crate::utils::ByteSet;

/// A point in the normalized grammar used as a mask-cache key: a sequence
/// expression, an element index (or tag-dispatch automaton state) and a byte
/// offset inside a literal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub(crate) struct PositionKey {
    pub expr: i32,
    pub element: u32,
    pub sub: u32,
}

/// Which id list an [`AdaptiveTokenMask`] stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MaskStoreType {
    /// `indices` holds the definitely-accepted token ids.
    Accepted,
    /// `indices` holds the definitely-rejected token ids.
    Rejected,
}

/// The per-position token classification. The representation is chosen per
/// position so that the stored list is minimized; uncertain ids are always
/// stored and always verified at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct AdaptiveTokenMask {
    pub store_type: MaskStoreType,
    pub indices: Vec<u32>,
    pub uncertain: Vec<u32>,
}

/// An immutable compiled grammar: the normalized grammar, the tokenizer
/// info and the adaptive token-mask cache. May be shared by many matchers
/// across threads without synchronization.
#[derive(Debug, Clone)]
pub struct CompiledGrammar {
    grammar: Grammar,
    tokenizer_info: Arc<TokenizerInfo>,
    adaptive_token_mask_cache: AHashMap<PositionKey, AdaptiveTokenMask>,
    /// Every token id that is neither special nor a stop token.
    all_normal_tokens: FixedBitSet,
}

impl CompiledGrammar {
    /// The normalized grammar.
    #[inline]
    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    /// The tokenizer info this grammar was compiled against.
    #[inline]
    pub fn tokenizer_info(&self) -> &TokenizerInfo {
        &self.tokenizer_info
    }

    #[inline]
    pub(crate) fn mask_entry(&self, position: &PositionKey) -> Option<&AdaptiveTokenMask> {
        self.adaptive_token_mask_cache.get(position)
    }

    #[inline]
    pub(crate) fn all_normal_tokens(&self) -> &FixedBitSet {
        &self.all_normal_tokens
    }

    pub(crate) fn cache_entries_sorted(&self) -> Vec<(PositionKey, &AdaptiveTokenMask)> {
        let mut entries: Vec<(PositionKey, &AdaptiveTokenMask)> =
            self.adaptive_token_mask_cache.iter().map(|(k, v)| (*k, v)).collect();
        entries.sort_by_key(|(k, _)| *k);
        entries
    }

    pub(crate) fn from_parts(
        grammar: Grammar,
        tokenizer_info: Arc<TokenizerInfo>,
        adaptive_token_mask_cache: AHashMap<PositionKey, AdaptiveTokenMask>,
    ) -> CompiledGrammar {
        let all_normal_tokens = compute_normal_tokens(&tokenizer_info);
        CompiledGrammar { grammar, tokenizer_info, adaptive_token_mask_cache, all_normal_tokens }
    }

    /// Serializes the compiled grammar to its v2 JSON representation.
    pub fn serialize_json(&self) -> String {
        crate::serialize::serialize_compiled_grammar(self)
    }

    /// Deserializes a compiled grammar from its v2 JSON representation. The
    /// tokenizer info is supplied separately.
    pub fn deserialize_json(
        json: &str,
        tokenizer_info: Arc<TokenizerInfo>,
    ) -> Result<CompiledGrammar, crate::serialize::SerializationError> {
        crate::serialize::deserialize_compiled_grammar(json, tokenizer_info)
    }
}

fn compute_normal_tokens(info: &TokenizerInfo) -> FixedBitSet {
    let mut set = FixedBitSet::with_capacity(info.vocab_size());
    set.insert_range(..);
    for &special in info.special_token_ids() {
        if (special as usize) < info.vocab_size() {
            set.set(special as usize, false);
        }
    }
    for &stop in info.stop_token_ids() {
        if (stop as usize) < info.vocab_size() {
            set.set(stop as usize, false);
        }
    }
    set
}

/// Options for [`GrammarCompiler`].
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// The maximum number of threads used to build the mask cache.
    pub max_threads: usize,
    /// Whether compiled artifacts are cached per (grammar, parameters) key.
    pub cache_enabled: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions { max_threads: 8, cache_enabled: true }
    }
}

/// Compiles grammars against one tokenizer, with an internal artifact cache.
///
/// Concurrent compilations of the same grammar build it once: the second
/// caller waits for the first build and reuses the artifact.
pub struct GrammarCompiler {
    tokenizer_info: Arc<TokenizerInfo>,
    options: CompilerOptions,
    cache: Mutex<AHashMap<u64, Arc<OnceLock<Arc<CompiledGrammar>>>>>,
}

impl GrammarCompiler {
    /// Creates a compiler for the given tokenizer.
    pub fn new(tokenizer_info: Arc<TokenizerInfo>, options: &CompilerOptions) -> GrammarCompiler {
        GrammarCompiler {
            tokenizer_info,
            options: options.clone(),
            cache: Mutex::new(AHashMap::default()),
        }
    }

    /// The tokenizer info this compiler builds against.
    pub fn tokenizer_info(&self) -> &TokenizerInfo {
        &self.tokenizer_info
    }

    /// Compiles a grammar object.
    pub fn compile_grammar(&self, grammar: &Grammar) -> Arc<CompiledGrammar> {
        // Normalization is idempotent; running it here guarantees the
        // canonical form for grammars assembled outside the front ends.
        let normalized = crate::normalizer::normalize(grammar);
        self.get_or_build(normalized)
    }

    /// Parses EBNF text (root rule `root`) and compiles it.
    pub fn compile_ebnf(&self, ebnf: &str) -> Result<Arc<CompiledGrammar>, GrammarError> {
        let grammar = Grammar::from_ebnf(ebnf, "root")?;
        Ok(self.get_or_build(grammar))
    }

    /// Lowers a JSON schema and compiles the resulting grammar.
    pub fn compile_json_schema(
        &self,
        schema: &str,
        options: &JsonSchemaOptions,
    ) -> Result<Arc<CompiledGrammar>, GrammarError> {
        let grammar = Grammar::from_json_schema(schema, options)?;
        Ok(self.get_or_build(grammar))
    }

    /// Converts a regular expression and compiles the resulting grammar.
    pub fn compile_regex(&self, pattern: &str) -> Result<Arc<CompiledGrammar>, GrammarError> {
        let grammar = Grammar::from_regex(pattern)?;
        Ok(self.get_or_build(grammar))
    }

    /// Converts a structural tag and compiles the resulting grammar.
    pub fn compile_structural_tag(
        &self,
        tag: &StructuralTag,
    ) -> Result<Arc<CompiledGrammar>, GrammarError> {
        let grammar = Grammar::from_structural_tag(tag)?;
        Ok(self.get_or_build(grammar))
    }

    /// Compiles the builtin JSON grammar.
    pub fn compile_builtin_json_grammar(&self) -> Arc<CompiledGrammar> {
        self.get_or_build(Grammar::builtin_json_grammar())
    }

    /// Clears all cached compiled grammars.
    pub fn clear_cache(&self) {
        self.cache.lock().expect("compiler cache lock poisoned").clear();
    }

    fn get_or_build(&self, grammar: Grammar) -> Arc<CompiledGrammar> {
        if !self.options.cache_enabled {
            return Arc::new(self.build(grammar));
        }
        let key = self.fingerprint(&grammar);
        let cell = {
            let mut cache = self.cache.lock().expect("compiler cache lock poisoned");
            Arc::clone(cache.entry(key).or_insert_with(|| Arc::new(OnceLock::new())))
        };
        // At most one build runs per key; concurrent callers block in
        // get_or_init and reuse the artifact.
        Arc::clone(cell.get_or_init(|| Arc::new(self.build(grammar))))
    }

    fn fingerprint(&self, grammar: &Grammar) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = ahash::AHasher::default();
        grammar.serialize_json().hash(&mut hasher);
        self.tokenizer_info.fingerprint().hash(&mut hasher);
        hasher.finish()
    }

    fn build(&self, grammar: Grammar) -> CompiledGrammar {
        let cache = build_mask_cache(&grammar, &self.tokenizer_info, self.options.max_threads);
        CompiledGrammar::from_parts(grammar, Arc::clone(&self.tokenizer_info), cache)
    }
}

/// Enumerates every cacheable position of the grammar in a fixed order.
fn enumerate_positions(grammar: &Grammar) -> Vec<PositionKey> {
    let mut positions = Vec::new();
    for expr_id in 0..grammar.num_exprs() as i32 {
        match grammar.expr(ExprId(expr_id)) {
            ExprView::TagDispatch(_) => {
                let states = grammar.fsm(ExprId(expr_id)).num_states();
                for state in 0..states as u32 {
                    positions.push(PositionKey { expr: expr_id, element: state, sub: 0 });
                }
            }
            ExprView::Sequence(children) => {
                for (element, &child) in children.iter().enumerate() {
                    match grammar.expr(ExprId(child)) {
                        ExprView::ByteString(bytes) => {
                            for sub in 0..bytes.len() as u32 {
                                positions.push(PositionKey {
                                    expr: expr_id,
                                    element: element as u32,
                                    sub,
                                });
                            }
                        }
                        ExprView::CharClass { .. } | ExprView::CharClassStar { .. } => {
                            positions.push(PositionKey {
                                expr: expr_id,
                                element: element as u32,
                                sub: 0,
                            });
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    positions
}

/// Maps every branch sequence to the rule that owns it, for lookahead
/// refinement.
fn sequence_owners(grammar: &Grammar) -> AHashMap<i32, i32> {
    let mut owners = AHashMap::default();
    for rule_index in 0..grammar.num_rules() {
        let body = ExprId(grammar.rule(RuleId(rule_index as i32)).body_expr_id());
        match grammar.expr(body) {
            ExprView::Choice(children) => {
                for &child in children {
                    owners.insert(child, rule_index as i32);
                }
            }
            _ => {
                owners.insert(body.0, rule_index as i32);
            }
        }
    }
    owners
}

fn build_mask_cache(
    grammar: &Grammar,
    info: &TokenizerInfo,
    max_threads: usize,
) -> AHashMap<PositionKey, AdaptiveTokenMask> {
    let positions = enumerate_positions(grammar);
    let owners = sequence_owners(grammar);
    let build_one = |position: &PositionKey| build_position_mask(grammar, info, *position, &owners);
    let masks: Vec<AdaptiveTokenMask> = match rayon::ThreadPoolBuilder::new()
        .num_threads(max_threads.max(1))
        .build()
    {
        Ok(pool) => pool.install(|| positions.par_iter().map(build_one).collect()),
        Err(error) => {
            log::warn!("Falling back to single-threaded mask building: {}", error);
            positions.iter().map(build_one).collect()
        }
    };
    positions.into_iter().zip(masks).collect()
}

fn build_position_mask(
    grammar: &Grammar,
    info: &TokenizerInfo,
    position: PositionKey,
    owners: &AHashMap<i32, i32>,
) -> AdaptiveTokenMask {
    let pda = Pda::new(grammar);
    let mut start_configs: Vec<Stack> = Vec::new();
    let mut stack = Stack::new();
    stack.push(StackFrame::new(position.expr, position.element, position.sub));
    pda.close_one(stack, &mut start_configs);
    let start_configs = crate::matcher::dedup_configs(start_configs);

    let mut first_bytes = ByteSet::with_capacity(256);
    for config in &start_configs {
        pda.possible_next_bytes(config, &mut first_bytes);
    }

    let lookahead = owners
        .get(&position.expr)
        .map(|&rule| grammar.rule(RuleId(rule)).lookahead_expr_id())
        .filter(|&l| l >= 0);

    let vocab_size = info.vocab_size();
    let mut accepted: Vec<u32> = Vec::new();
    let mut rejected: Vec<u32> = Vec::new();
    let mut uncertain: Vec<u32> = Vec::new();
    for token_id in 0..vocab_size as u32 {
        if info.is_special_token_id(token_id)
            || info.stop_token_ids().contains(&(token_id as i32))
        {
            continue;
        }
        let bytes = info.token_bytes(token_id).unwrap_or(&[]);
        if bytes.is_empty() {
            accepted.push(token_id);
            continue;
        }
        if !first_bytes.contains(bytes[0] as usize) {
            rejected.push(token_id);
            continue;
        }
        let outcome = pda.simulate_token(&start_configs, bytes);
        if outcome.survived {
            accepted.push(token_id);
        } else if outcome.popped_remaining.is_empty() {
            rejected.push(token_id);
        } else {
            let compatible = match lookahead {
                None => true,
                Some(lookahead_expr) => outcome.popped_remaining.iter().any(|&remaining| {
                    lookahead_compatible(&pda, grammar, lookahead_expr, &bytes[bytes.len() - remaining..])
                }),
            };
            if compatible {
                uncertain.push(token_id);
            } else {
                rejected.push(token_id);
            }
        }
    }

    let store_type = if accepted.len() < rejected.len() {
        MaskStoreType::Accepted
    } else {
        MaskStoreType::Rejected
    };
    let indices = match store_type {
        MaskStoreType::Accepted => accepted,
        MaskStoreType::Rejected => rejected,
    };
    AdaptiveTokenMask { store_type, indices, uncertain }
}

/// Whether the bytes that trail a completed rule could still satisfy its
/// lookahead assertion.
fn lookahead_compatible(pda: &Pda<'_>, grammar: &Grammar, lookahead: i32, suffix: &[u8]) -> bool {
    if suffix.is_empty() {
        return true;
    }
    let mut start: Vec<Stack> = Vec::new();
    let branches: Vec<ExprId> = match grammar.expr(ExprId(lookahead)) {
        ExprView::Choice(children) => children.iter().map(|&c| ExprId(c)).collect(),
        _ => vec![ExprId(lookahead)],
    };
    for branch in branches {
        match grammar.expr(branch) {
            ExprView::EmptyStr => return true,
            ExprView::Sequence(_) => {
                let mut stack = Stack::new();
                stack.push(StackFrame::new(branch.0, 0, 0));
                pda.close_one(stack, &mut start);
            }
            _ => return true,
        }
    }
    let outcome = pda.simulate_token(&start, suffix);
    outcome.survived || !outcome.popped_remaining.is_empty()
}
