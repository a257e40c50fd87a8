//! The grammar intermediate representation: a rule table plus a flat
//! expression arena, together with the builder used by every front end and
//! the EBNF text printer.
//!
//! Expressions are stored in a contiguous jagged array of `i32` payloads with
//! one row per expression. The first payload element is the expression tag,
//! the rest is tag-specific. Rule and expression ids are plain indices into
//! their tables, which keeps the graph cache-friendly and serializable
//! without pointer chasing, and makes cyclic rule references trivial.
use std::fmt::{self, Debug, Display, Write as _};

use ahash::AHashMap;
use jaggedarray::jagged_array::JaggedArray;
use jaggedarray::jagged_array::JaggedArrayViewTrait;
use serde::{Deserialize, Serialize};

use crate::json_schema::JsonSchemaOptions;
use crate::structural_tag::{StructuralTag, StructuralTagError};

/// Sentinel for a rule without a lookahead assertion.
pub(crate) const NO_LOOKAHEAD: i32 = -1;

/// The wrapper struct that represents a rule id in the grammar.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RuleId(pub i32);

/// The wrapper struct that represents an expression id in the grammar.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ExprId(pub i32);

/// The tag of an expression in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr)]
#[repr(i32)]
pub(crate) enum ExprTag {
    ByteString = 0,
    CharClass = 1,
    CharClassStar = 2,
    EmptyStr = 3,
    RuleRef = 4,
    Sequence = 5,
    Choice = 6,
    TagDispatch = 7,
    RepeatRange = 8,
}

/// A decoded, borrowing view of one expression in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExprView<'a> {
    /// A literal byte sequence. Payload elements are bytes widened to `i32`.
    ByteString(&'a [i32]),
    /// A set of codepoints as sorted disjoint `[lo, hi]` ranges.
    CharClass { negated: bool, ranges: &'a [i32] },
    /// Zero or more codepoints of a class; explicit for fast-path handling.
    CharClassStar { negated: bool, ranges: &'a [i32] },
    /// The empty string.
    EmptyStr,
    /// Expansion of another rule.
    RuleRef(i32),
    /// Concatenation of child expressions.
    Sequence(&'a [i32]),
    /// Alternation of child expressions.
    Choice(&'a [i32]),
    /// A free-text section with trigger dispatch; decode with
    /// [`TagDispatchSpec::decode`].
    TagDispatch(&'a [i32]),
    /// Bounded repetition, lowered away during normalization. `max == -1`
    /// means unbounded.
    RepeatRange { expr: i32, min: i32, max: i32 },
}

/// The decoded payload of a `TagDispatch` expression. Trigger, stop and
/// exclude strings are stored as `ByteString` expressions in the arena and
/// referenced by id here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TagDispatchSpec {
    pub pairs: Vec<(ExprId, RuleId)>,
    pub stop_eos: bool,
    pub stop_strs: Vec<ExprId>,
    pub loop_after_dispatch: bool,
    pub excludes: Vec<ExprId>,
}

impl TagDispatchSpec {
    pub(crate) fn decode(payload: &[i32]) -> TagDispatchSpec {
        let mut pos = 0usize;
        let num_pairs = payload[pos] as usize;
        pos += 1;
        let mut pairs = Vec::with_capacity(num_pairs);
        for _ in 0..num_pairs {
            pairs.push((ExprId(payload[pos]), RuleId(payload[pos + 1])));
            pos += 2;
        }
        let stop_eos = payload[pos] != 0;
        pos += 1;
        let num_stops = payload[pos] as usize;
        pos += 1;
        let stop_strs = payload[pos..pos + num_stops].iter().map(|&x| ExprId(x)).collect();
        pos += num_stops;
        let loop_after_dispatch = payload[pos] != 0;
        pos += 1;
        let num_excludes = payload[pos] as usize;
        pos += 1;
        let excludes = payload[pos..pos + num_excludes].iter().map(|&x| ExprId(x)).collect();
        TagDispatchSpec { pairs, stop_eos, stop_strs, loop_after_dispatch, excludes }
    }

    fn encode(&self) -> Vec<i32> {
        let mut payload = Vec::with_capacity(self.pairs.len() * 2 + self.stop_strs.len() + self.excludes.len() + 5);
        payload.push(self.pairs.len() as i32);
        for &(trigger, rule) in &self.pairs {
            payload.push(trigger.0);
            payload.push(rule.0);
        }
        payload.push(self.stop_eos as i32);
        payload.push(self.stop_strs.len() as i32);
        payload.extend(self.stop_strs.iter().map(|e| e.0));
        payload.push(self.loop_after_dispatch as i32);
        payload.push(self.excludes.len() as i32);
        payload.extend(self.excludes.iter().map(|e| e.0));
        payload
    }
}

/// One rule of the grammar: a name, a body expression and an optional
/// lookahead expression (`-1` when absent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub(crate) name: String,
    pub(crate) body_expr_id: i32,
    pub(crate) lookahead_expr_id: i32,
}

impl Rule {
    /// The rule's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn body_expr_id(&self) -> i32 {
        self.body_expr_id
    }

    #[inline]
    pub(crate) fn lookahead_expr_id(&self) -> i32 {
        self.lookahead_expr_id
    }

    pub(crate) fn from_parts(name: String, body_expr_id: i32, lookahead_expr_id: i32) -> Rule {
        Rule { name, body_expr_id, lookahead_expr_id }
    }
}

/// The kind of string a tag-dispatch FSM node terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum FsmTerminal {
    None,
    /// Index into the dispatch's trigger pair list.
    Trigger(u32),
    /// Index into the dispatch's stop string list.
    Stop(u32),
    /// Index into the dispatch's exclude string list.
    Exclude(u32),
}

/// A deterministic trie with failure links over a tag dispatch's triggers,
/// stop strings and exclude strings. The matcher advances it byte by byte
/// while scanning free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TagDispatchFsm {
    /// Per-node sorted `(byte, child)` transitions.
    children: Vec<Vec<(u8, u32)>>,
    /// Failure link per node; node 0 is the scan start state.
    fail: Vec<u32>,
    /// Longest pattern ending at each node, resolved through failure links.
    terminal: Vec<FsmTerminal>,
}

impl TagDispatchFsm {
    pub(crate) fn build(patterns: &[(Vec<u8>, FsmTerminal)]) -> TagDispatchFsm {
        let mut children: Vec<Vec<(u8, u32)>> = vec![Vec::new()];
        let mut own_terminal: Vec<FsmTerminal> = vec![FsmTerminal::None];
        for (bytes, terminal) in patterns {
            let mut node = 0usize;
            for &byte in bytes {
                node = match children[node].iter().find(|(b, _)| *b == byte) {
                    Some(&(_, child)) => child as usize,
                    None => {
                        children.push(Vec::new());
                        own_terminal.push(FsmTerminal::None);
                        let child = (children.len() - 1) as u32;
                        children[node].push((byte, child));
                        children[node].sort_unstable_by_key(|(b, _)| *b);
                        child as usize
                    }
                };
            }
            // Exclude > Stop > Trigger when several patterns end on one node.
            let rank = |t: &FsmTerminal| match t {
                FsmTerminal::Exclude(_) => 3,
                FsmTerminal::Stop(_) => 2,
                FsmTerminal::Trigger(_) => 1,
                FsmTerminal::None => 0,
            };
            if rank(terminal) > rank(&own_terminal[node]) {
                own_terminal[node] = *terminal;
            }
        }
        // Breadth-first failure link computation.
        let mut fail = vec![0u32; children.len()];
        let mut terminal = own_terminal.clone();
        let mut queue: std::collections::VecDeque<u32> = std::collections::VecDeque::new();
        for &(_, child) in &children[0] {
            queue.push_back(child);
        }
        while let Some(node) = queue.pop_front() {
            let node_fail = fail[node as usize];
            if matches!(terminal[node as usize], FsmTerminal::None) {
                terminal[node as usize] = terminal[node_fail as usize];
            }
            let transitions = children[node as usize].clone();
            for (byte, child) in transitions {
                let mut state = node_fail;
                let fail_target = loop {
                    if let Some(&(_, next)) = children[state as usize].iter().find(|(b, _)| *b == byte) {
                        break next;
                    }
                    if state == 0 {
                        break 0;
                    }
                    state = fail[state as usize];
                };
                fail[child as usize] = if fail_target == child { 0 } else { fail_target };
                queue.push_back(child);
            }
        }
        TagDispatchFsm { children, fail, terminal }
    }

    /// Advances one byte from `state`, following failure links.
    pub(crate) fn step(&self, mut state: u32, byte: u8) -> u32 {
        loop {
            if let Some(&(_, child)) = self.children[state as usize].iter().find(|(b, _)| *b == byte) {
                return child;
            }
            if state == 0 {
                return 0;
            }
            state = self.fail[state as usize];
        }
    }

    /// The longest pattern match ending at `state`, if any.
    #[inline]
    pub(crate) fn terminal(&self, state: u32) -> FsmTerminal {
        self.terminal[state as usize]
    }

    pub(crate) fn num_states(&self) -> usize {
        self.children.len()
    }

    /// The `(node, trigger_pair_index)` pairs of nodes that complete a
    /// trigger.
    pub(crate) fn trigger_end_nodes(&self) -> Vec<(u32, u32)> {
        self.terminal
            .iter()
            .enumerate()
            .filter_map(|(node, terminal)| match terminal {
                FsmTerminal::Trigger(pair) => Some((node as u32, *pair)),
                _ => None,
            })
            .collect()
    }
}

/// The error type for grammar construction and the front-end converters.
#[derive(Debug, thiserror::Error)]
pub enum GrammarError {
    /// The EBNF text is malformed.
    #[error("EBNF parse error at line {line}, column {col}: {message}")]
    EbnfParse {
        /// 1-based source line.
        line: usize,
        /// 1-based source column.
        col: usize,
        /// Human-readable description.
        message: String,
    },
    /// The regular expression is malformed or uses an unsupported feature.
    #[error("Regex parse error at position {pos}: {message}")]
    RegexParse {
        /// 0-based byte offset into the pattern.
        pos: usize,
        /// Human-readable description.
        message: String,
    },
    /// The JSON schema is malformed or cannot be lowered.
    #[error("JSON schema error: {0}")]
    JsonSchema(String),
    /// The structural tag was rejected by the analyzer or converter.
    #[error("Structural tag error: {0}")]
    StructuralTag(#[from] StructuralTagError),
    /// The grammar violates a structural constraint.
    #[error("Invalid grammar: {0}")]
    Semantic(String),
}

type ExprArena = JaggedArray<i32, Vec<usize>, 2>;

/// This struct represents a context-free grammar in the intermediate
/// representation used by the whole crate: an ordered rule table plus a flat
/// expression arena.
///
/// Grammars are constructed from EBNF text, JSON schemas, regular
/// expressions or structural tags, and are normalized into a
/// choice-of-sequences form before compilation. `Display` prints the grammar
/// back as EBNF text; printing a grammar, reparsing it and printing again
/// yields byte-identical text.
#[derive(Clone)]
pub struct Grammar {
    pub(crate) rules: Vec<Rule>,
    pub(crate) expr_data: ExprArena,
    pub(crate) root_rule_id: i32,
    /// Rules whose language contains the empty string; computed by the
    /// normalizer, empty for unnormalized grammars.
    pub(crate) allow_empty_rule_ids: Vec<i32>,
    /// Scanning automata for every `TagDispatch` expression, keyed by the
    /// expression id. Rebuilt deterministically after deserialization.
    pub(crate) tag_dispatch_fsms: AHashMap<i32, TagDispatchFsm>,
}

impl Grammar {
    /// Constructs a grammar from EBNF text and normalizes it.
    ///
    /// # Errors
    ///
    /// Returns a [`GrammarError`] with line and column information when the
    /// text is malformed, a rule is undefined or defined twice, or the root
    /// rule is missing.
    pub fn from_ebnf(ebnf: &str, root_rule_name: &str) -> Result<Grammar, GrammarError> {
        let grammar = crate::ebnf::parse_ebnf(ebnf, root_rule_name)?;
        Ok(crate::normalizer::normalize(&grammar))
    }

    /// Constructs a grammar from EBNF text without running the normalizer
    /// pipeline. The result mirrors the source structure one-to-one. Intended
    /// for tests and debugging.
    pub fn from_ebnf_no_normalization(
        ebnf: &str,
        root_rule_name: &str,
    ) -> Result<Grammar, GrammarError> {
        crate::ebnf::parse_ebnf(ebnf, root_rule_name)
    }

    /// Constructs a grammar from a regular expression in the supported
    /// ECMA-262 subset.
    pub fn from_regex(pattern: &str) -> Result<Grammar, GrammarError> {
        let grammar = crate::regex::parse_regex(pattern)?;
        Ok(crate::normalizer::normalize(&grammar))
    }

    /// Constructs a grammar from a JSON schema string. The schema is lowered
    /// to EBNF text first; see [`JsonSchemaOptions`] for formatting control.
    pub fn from_json_schema(
        schema: &str,
        options: &JsonSchemaOptions,
    ) -> Result<Grammar, GrammarError> {
        let ebnf = crate::json_schema::json_schema_to_ebnf(schema, options)?;
        Grammar::from_ebnf(&ebnf, "root")
    }

    /// Constructs a grammar from a structural tag.
    pub fn from_structural_tag(tag: &StructuralTag) -> Result<Grammar, GrammarError> {
        let grammar = crate::structural_tag::structural_tag_to_grammar(tag)?;
        Ok(crate::normalizer::normalize(&grammar))
    }

    /// The grammar of standard JSON, compatible with the official JSON
    /// grammar specification. The top level is an object or an array.
    pub fn builtin_json_grammar() -> Grammar {
        Grammar::from_ebnf(crate::json_schema::BUILTIN_JSON_EBNF, "root")
            .expect("the builtin JSON grammar must parse")
    }

    /// Creates a grammar matching any of the given grammars.
    ///
    /// # Errors
    ///
    /// Returns an error when `grammars` is empty.
    pub fn union(grammars: &[Grammar]) -> Result<Grammar, GrammarError> {
        Self::combine(grammars, false)
    }

    /// Creates a grammar matching the concatenation of the given grammars.
    ///
    /// # Errors
    ///
    /// Returns an error when `grammars` is empty.
    pub fn concat(grammars: &[Grammar]) -> Result<Grammar, GrammarError> {
        Self::combine(grammars, true)
    }

    fn combine(grammars: &[Grammar], concat: bool) -> Result<Grammar, GrammarError> {
        if grammars.is_empty() {
            return Err(GrammarError::Semantic(
                "combining grammars requires at least one grammar".to_string(),
            ));
        }
        let mut builder = GrammarBuilder::new();
        let root = builder.add_rule("root");
        let mut parts = Vec::with_capacity(grammars.len());
        for grammar in grammars {
            let imported = builder.import(grammar);
            let r = builder.rule_ref(imported);
            parts.push(r);
        }
        let body = if concat {
            let seq = builder.sequence(&parts);
            builder.choice(&[seq])
        } else {
            let branches: Vec<ExprId> = parts
                .iter()
                .map(|&p| builder.sequence(&[p]))
                .collect();
            builder.choice(&branches)
        };
        builder.set_rule_body(root, body);
        let grammar = builder.finalize(root)?;
        Ok(crate::normalizer::normalize(&grammar))
    }

    /// Serializes the grammar to its v2 JSON representation.
    pub fn serialize_json(&self) -> String {
        crate::serialize::serialize_grammar(self)
    }

    /// Deserializes a grammar from its v2 JSON representation.
    ///
    /// # Errors
    ///
    /// Returns a [`SerializationError`](crate::serialize::SerializationError)
    /// when the JSON is malformed, a field is missing or the version tag does
    /// not match.
    pub fn deserialize_json(json: &str) -> Result<Grammar, crate::serialize::SerializationError> {
        crate::serialize::deserialize_grammar(json)
    }

    /// The id of the root rule.
    #[inline]
    pub fn root_rule_id(&self) -> RuleId {
        RuleId(self.root_rule_id)
    }

    /// The number of rules.
    #[inline]
    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    /// Returns a rule by id.
    ///
    /// # Panics
    ///
    /// Panics if the rule id is out of bounds.
    #[inline]
    pub fn rule(&self, rule_id: RuleId) -> &Rule {
        &self.rules[rule_id.0 as usize]
    }

    /// The ids of rules whose language contains the empty string. Empty for
    /// unnormalized grammars.
    #[inline]
    pub fn allow_empty_rule_ids(&self) -> &[i32] {
        &self.allow_empty_rule_ids
    }

    #[inline]
    pub(crate) fn num_exprs(&self) -> usize {
        self.expr_data.len()
    }

    #[inline]
    pub(crate) fn expr_payload(&self, expr_id: i32) -> &[i32] {
        self.expr_data.view([expr_id as usize]).as_slice()
    }

    pub(crate) fn expr(&self, expr_id: ExprId) -> ExprView<'_> {
        let row = self.expr_payload(expr_id.0);
        decode_expr(row)
    }

    pub(crate) fn byte_string_bytes(&self, expr_id: ExprId) -> Vec<u8> {
        match self.expr(expr_id) {
            ExprView::ByteString(bytes) => bytes.iter().map(|&b| b as u8).collect(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn fsm(&self, expr_id: ExprId) -> &TagDispatchFsm {
        &self.tag_dispatch_fsms[&expr_id.0]
    }

    /// The tag-dispatch expression id of the root rule's body, if the root
    /// rule is a tag dispatch.
    pub(crate) fn root_tag_dispatch_expr(&self) -> Option<ExprId> {
        let body = ExprId(self.rules[self.root_rule_id as usize].body_expr_id);
        match self.expr(body) {
            ExprView::TagDispatch(_) => Some(body),
            _ => None,
        }
    }

    /// Reassembles a grammar from deserialized parts. The caller rebuilds
    /// the dispatch automata afterwards.
    pub(crate) fn from_serialized_parts(
        rules: Vec<Rule>,
        expr_data: ExprArena,
        root_rule_id: i32,
        allow_empty_rule_ids: Vec<i32>,
    ) -> Grammar {
        Grammar {
            rules,
            expr_data,
            root_rule_id,
            allow_empty_rule_ids,
            tag_dispatch_fsms: AHashMap::default(),
        }
    }

    /// Rebuilds the scanning automata for all tag-dispatch expressions.
    /// Construction is deterministic, so rebuilding after deserialization
    /// reproduces the serialized automata exactly.
    pub(crate) fn rebuild_tag_dispatch_fsms(&mut self) {
        let mut fsms = AHashMap::default();
        for expr_id in 0..self.expr_data.len() {
            let row = self.expr_payload(expr_id as i32);
            if row[0] != ExprTag::TagDispatch as i32 {
                continue;
            }
            let spec = TagDispatchSpec::decode(&row[1..]);
            let mut patterns = Vec::new();
            for (pair_index, &(trigger, _)) in spec.pairs.iter().enumerate() {
                patterns.push((self.byte_string_bytes(trigger), FsmTerminal::Trigger(pair_index as u32)));
            }
            for (stop_index, &stop) in spec.stop_strs.iter().enumerate() {
                patterns.push((self.byte_string_bytes(stop), FsmTerminal::Stop(stop_index as u32)));
            }
            for (exclude_index, &exclude) in spec.excludes.iter().enumerate() {
                patterns.push((self.byte_string_bytes(exclude), FsmTerminal::Exclude(exclude_index as u32)));
            }
            fsms.insert(expr_id as i32, TagDispatchFsm::build(&patterns));
        }
        self.tag_dispatch_fsms = fsms;
    }

    fn fmt_expr(&self, expr_id: ExprId, out: &mut String) {
        match self.expr(expr_id) {
            ExprView::ByteString(bytes) => {
                out.push('"');
                let byte_vec: Vec<u8> = bytes.iter().map(|&b| b as u8).collect();
                escape_bytes_to(&byte_vec, false, out);
                out.push('"');
            }
            ExprView::CharClass { negated, ranges } => {
                fmt_char_class(negated, ranges, out);
            }
            ExprView::CharClassStar { negated, ranges } => {
                fmt_char_class(negated, ranges, out);
                out.push('*');
            }
            ExprView::EmptyStr => out.push_str("\"\""),
            ExprView::RuleRef(rule_id) => out.push_str(&self.rules[rule_id as usize].name),
            ExprView::Sequence(children) => {
                out.push('(');
                for (i, &child) in children.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    self.fmt_expr(ExprId(child), out);
                }
                out.push(')');
            }
            ExprView::Choice(children) => {
                out.push('(');
                for (i, &child) in children.iter().enumerate() {
                    if i > 0 {
                        out.push_str(" | ");
                    }
                    self.fmt_expr(ExprId(child), out);
                }
                out.push(')');
            }
            ExprView::TagDispatch(payload) => {
                let spec = TagDispatchSpec::decode(payload);
                out.push_str("TagDispatch(");
                let mut first = true;
                let mut sep = |out: &mut String, first: &mut bool| {
                    if !*first {
                        out.push_str(", ");
                    }
                    *first = false;
                };
                for &(trigger, rule) in &spec.pairs {
                    sep(out, &mut first);
                    out.push_str("(\"");
                    escape_bytes_to(&self.byte_string_bytes(trigger), false, out);
                    out.push_str("\", ");
                    out.push_str(&self.rules[rule.0 as usize].name);
                    out.push(')');
                }
                if !spec.stop_eos {
                    sep(out, &mut first);
                    out.push_str("stop_eos=false");
                }
                if !spec.stop_strs.is_empty() {
                    sep(out, &mut first);
                    out.push_str("stop_str=(");
                    for (i, &stop) in spec.stop_strs.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        out.push('"');
                        escape_bytes_to(&self.byte_string_bytes(stop), false, out);
                        out.push('"');
                    }
                    out.push(')');
                }
                if !spec.loop_after_dispatch {
                    sep(out, &mut first);
                    out.push_str("loop_after_dispatch=false");
                }
                if !spec.excludes.is_empty() {
                    sep(out, &mut first);
                    out.push_str("excludes=(");
                    for (i, &exclude) in spec.excludes.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        out.push('"');
                        escape_bytes_to(&self.byte_string_bytes(exclude), false, out);
                        out.push('"');
                    }
                    out.push(')');
                }
                out.push(')');
            }
            ExprView::RepeatRange { expr, min, max } => {
                self.fmt_expr(ExprId(expr), out);
                if max < 0 {
                    let _ = write!(out, "{{{},}}", min);
                } else if min == max {
                    let _ = write!(out, "{{{}}}", min);
                } else {
                    let _ = write!(out, "{{{},{}}}", min, max);
                }
            }
        }
    }
}

impl Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rule in &self.rules {
            let mut body = String::new();
            self.fmt_expr(ExprId(rule.body_expr_id), &mut body);
            write!(f, "{} ::= {}", rule.name, body)?;
            if rule.lookahead_expr_id != NO_LOOKAHEAD {
                let mut lookahead = String::new();
                self.fmt_expr(ExprId(rule.lookahead_expr_id), &mut lookahead);
                write!(f, " (={})", lookahead)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl Debug for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grammar")
            .field("root_rule", &self.rules[self.root_rule_id as usize].name)
            .field("rules", &format!("{}", self))
            .field(
                "allow_empty_rule_ids",
                &self.allow_empty_rule_ids,
            )
            .finish()
    }
}

pub(crate) fn decode_expr(row: &[i32]) -> ExprView<'_> {
    let tag = ExprTag::from_repr(row[0]).expect("corrupt expression tag");
    let payload = &row[1..];
    match tag {
        ExprTag::ByteString => ExprView::ByteString(payload),
        ExprTag::CharClass => ExprView::CharClass { negated: payload[0] != 0, ranges: &payload[1..] },
        ExprTag::CharClassStar => {
            ExprView::CharClassStar { negated: payload[0] != 0, ranges: &payload[1..] }
        }
        ExprTag::EmptyStr => ExprView::EmptyStr,
        ExprTag::RuleRef => ExprView::RuleRef(payload[0]),
        ExprTag::Sequence => ExprView::Sequence(payload),
        ExprTag::Choice => ExprView::Choice(payload),
        ExprTag::TagDispatch => ExprView::TagDispatch(payload),
        ExprTag::RepeatRange => {
            ExprView::RepeatRange { expr: payload[0], min: payload[1], max: payload[2] }
        }
    }
}

fn fmt_char_class(negated: bool, ranges: &[i32], out: &mut String) {
    out.push('[');
    if negated {
        out.push('^');
    }
    for pair in ranges.chunks_exact(2) {
        let (lo, hi) = (pair[0] as u32, pair[1] as u32);
        escape_codepoint_to(lo, true, out);
        if lo != hi {
            out.push('-');
            escape_codepoint_to(hi, true, out);
        }
    }
    out.push(']');
}

/// Escapes a byte string for EBNF output. Invalid UTF-8 bytes print as
/// `\xHH`; codepoints print per [`escape_codepoint_to`].
pub(crate) fn escape_bytes_to(bytes: &[u8], in_char_class: bool, out: &mut String) {
    let mut i = 0usize;
    while i < bytes.len() {
        let remaining = &bytes[i..];
        match std::str::from_utf8(remaining) {
            Ok(s) => {
                for ch in s.chars() {
                    escape_codepoint_to(ch as u32, in_char_class, out);
                }
                break;
            }
            Err(err) => {
                let valid = err.valid_up_to();
                let valid_str = std::str::from_utf8(&remaining[..valid]).unwrap_or("");
                for ch in valid_str.chars() {
                    escape_codepoint_to(ch as u32, in_char_class, out);
                }
                let _ = write!(out, "\\x{:02x}", remaining[valid]);
                i += valid + 1;
            }
        }
    }
}

/// Escapes a single codepoint for EBNF output.
pub(crate) fn escape_codepoint_to(codepoint: u32, in_char_class: bool, out: &mut String) {
    match codepoint {
        0x0A => out.push_str("\\n"),
        0x09 => out.push_str("\\t"),
        0x0D => out.push_str("\\r"),
        0x00 => out.push_str("\\0"),
        0x5C => out.push_str("\\\\"),
        0x22 => out.push_str("\\\""),
        0x27 => out.push_str("\\'"),
        0x3F => out.push_str("\\?"),
        0x2D if in_char_class => out.push_str("\\-"),
        0x5D if in_char_class => out.push_str("\\]"),
        0x5E if in_char_class => out.push_str("\\^"),
        0x20..=0x7E => out.push(codepoint as u8 as char),
        0x00..=0x7F => {
            let _ = write!(out, "\\x{:02x}", codepoint);
        }
        0x80..=0xFFFF => {
            let _ = write!(out, "\\u{:04x}", codepoint);
        }
        _ => {
            let _ = write!(out, "\\U{:08x}", codepoint);
        }
    }
}

/// Incrementally builds a [`Grammar`]: rules may be declared before their
/// bodies exist, so mutually recursive rules are straightforward.
pub(crate) struct GrammarBuilder {
    rules: Vec<Rule>,
    expr_data: ExprArena,
    rule_name_to_id: AHashMap<String, i32>,
}

impl GrammarBuilder {
    pub(crate) fn new() -> GrammarBuilder {
        GrammarBuilder {
            rules: Vec::new(),
            expr_data: ExprArena::new(),
            rule_name_to_id: AHashMap::default(),
        }
    }

    /// Declares a rule with an undefined body, returning its id. If the name
    /// is taken, returns the existing rule's id.
    pub(crate) fn add_rule(&mut self, name: &str) -> RuleId {
        if let Some(&id) = self.rule_name_to_id.get(name) {
            return RuleId(id);
        }
        let id = self.rules.len() as i32;
        self.rules.push(Rule {
            name: name.to_string(),
            body_expr_id: -1,
            lookahead_expr_id: NO_LOOKAHEAD,
        });
        self.rule_name_to_id.insert(name.to_string(), id);
        RuleId(id)
    }

    pub(crate) fn rule_id(&self, name: &str) -> Option<RuleId> {
        self.rule_name_to_id.get(name).copied().map(RuleId)
    }

    pub(crate) fn rule_has_body(&self, rule_id: RuleId) -> bool {
        self.rules[rule_id.0 as usize].body_expr_id >= 0
    }

    pub(crate) fn rule_name(&self, rule_id: RuleId) -> &str {
        &self.rules[rule_id.0 as usize].name
    }

    pub(crate) fn rule_body(&self, rule_id: RuleId) -> ExprId {
        ExprId(self.rules[rule_id.0 as usize].body_expr_id)
    }

    /// Picks an unused rule name of the form `{base}_{n}` with the smallest
    /// `n ≥ 1`. Used for helper rules synthesized from quantifiers and
    /// hoisted sub-expressions.
    pub(crate) fn fresh_numbered_name(&self, base: &str) -> String {
        let mut n = 1usize;
        loop {
            let candidate = format!("{}_{}", base, n);
            if !self.rule_name_to_id.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Picks an unused rule name, preferring `base` itself and falling back
    /// to `{base}_{n}`.
    pub(crate) fn fresh_name(&self, base: &str) -> String {
        if !self.rule_name_to_id.contains_key(base) {
            return base.to_string();
        }
        self.fresh_numbered_name(base)
    }

    pub(crate) fn set_rule_body(&mut self, rule_id: RuleId, body: ExprId) {
        self.rules[rule_id.0 as usize].body_expr_id = body.0;
    }

    pub(crate) fn set_rule_lookahead(&mut self, rule_id: RuleId, lookahead: ExprId) {
        self.rules[rule_id.0 as usize].lookahead_expr_id = lookahead.0;
    }

    fn add_expr(&mut self, tag: ExprTag, payload: &[i32]) -> ExprId {
        self.expr_data.new_row::<0>();
        self.expr_data.extend_last_row_from_slice(&[tag as i32]);
        self.expr_data.extend_last_row_from_slice(payload);
        ExprId((self.expr_data.len() - 1) as i32)
    }

    pub(crate) fn byte_string(&mut self, bytes: &[u8]) -> ExprId {
        let payload: Vec<i32> = bytes.iter().map(|&b| b as i32).collect();
        self.add_expr(ExprTag::ByteString, &payload)
    }

    pub(crate) fn empty_str(&mut self) -> ExprId {
        self.add_expr(ExprTag::EmptyStr, &[])
    }

    /// Adds a character class. Ranges are sorted and overlapping or adjacent
    /// ranges are merged so the stored form is canonical.
    pub(crate) fn char_class(&mut self, negated: bool, ranges: &[(u32, u32)]) -> ExprId {
        let payload = canonical_class_payload(negated, ranges);
        self.add_expr(ExprTag::CharClass, &payload)
    }

    pub(crate) fn char_class_star(&mut self, negated: bool, ranges: &[(u32, u32)]) -> ExprId {
        let payload = canonical_class_payload(negated, ranges);
        self.add_expr(ExprTag::CharClassStar, &payload)
    }

    pub(crate) fn rule_ref(&mut self, rule_id: RuleId) -> ExprId {
        self.add_expr(ExprTag::RuleRef, &[rule_id.0])
    }

    pub(crate) fn sequence(&mut self, children: &[ExprId]) -> ExprId {
        let payload: Vec<i32> = children.iter().map(|e| e.0).collect();
        self.add_expr(ExprTag::Sequence, &payload)
    }

    pub(crate) fn choice(&mut self, children: &[ExprId]) -> ExprId {
        let payload: Vec<i32> = children.iter().map(|e| e.0).collect();
        self.add_expr(ExprTag::Choice, &payload)
    }

    pub(crate) fn repeat_range(&mut self, child: ExprId, min: i32, max: i32) -> ExprId {
        self.add_expr(ExprTag::RepeatRange, &[child.0, min, max])
    }

    pub(crate) fn tag_dispatch(&mut self, spec: &TagDispatchSpec) -> ExprId {
        let payload = spec.encode();
        self.add_expr(ExprTag::TagDispatch, &payload)
    }

    pub(crate) fn expr_payload(&self, expr_id: ExprId) -> &[i32] {
        self.expr_data.view([expr_id.0 as usize]).as_slice()
    }

    pub(crate) fn expr(&self, expr_id: ExprId) -> ExprView<'_> {
        decode_expr(self.expr_payload(expr_id))
    }

    /// Copies another grammar into this builder, renaming colliding rule
    /// names, and returns the id of its root rule in this builder.
    pub(crate) fn import(&mut self, grammar: &Grammar) -> RuleId {
        let mut rule_map: Vec<i32> = Vec::with_capacity(grammar.rules.len());
        for rule in &grammar.rules {
            let name = self.fresh_name(&rule.name);
            let id = self.add_rule(&name);
            rule_map.push(id.0);
        }
        let mut expr_map: AHashMap<i32, i32> = AHashMap::default();
        for (old_id, rule) in grammar.rules.iter().enumerate() {
            let body = self.import_expr(grammar, rule.body_expr_id, &rule_map, &mut expr_map);
            self.set_rule_body(RuleId(rule_map[old_id]), body);
            if rule.lookahead_expr_id != NO_LOOKAHEAD {
                let lookahead =
                    self.import_expr(grammar, rule.lookahead_expr_id, &rule_map, &mut expr_map);
                self.set_rule_lookahead(RuleId(rule_map[old_id]), lookahead);
            }
        }
        RuleId(rule_map[grammar.root_rule_id as usize])
    }

    fn import_expr(
        &mut self,
        grammar: &Grammar,
        expr_id: i32,
        rule_map: &[i32],
        expr_map: &mut AHashMap<i32, i32>,
    ) -> ExprId {
        if let Some(&mapped) = expr_map.get(&expr_id) {
            return ExprId(mapped);
        }
        let new_id = match grammar.expr(ExprId(expr_id)) {
            ExprView::ByteString(bytes) => {
                let byte_vec: Vec<u8> = bytes.iter().map(|&b| b as u8).collect();
                self.byte_string(&byte_vec)
            }
            ExprView::CharClass { negated, ranges } => {
                let pairs: Vec<(u32, u32)> =
                    ranges.chunks_exact(2).map(|p| (p[0] as u32, p[1] as u32)).collect();
                self.char_class(negated, &pairs)
            }
            ExprView::CharClassStar { negated, ranges } => {
                let pairs: Vec<(u32, u32)> =
                    ranges.chunks_exact(2).map(|p| (p[0] as u32, p[1] as u32)).collect();
                self.char_class_star(negated, &pairs)
            }
            ExprView::EmptyStr => self.empty_str(),
            ExprView::RuleRef(rule_id) => self.rule_ref(RuleId(rule_map[rule_id as usize])),
            ExprView::Sequence(children) => {
                let children = children.to_vec();
                let mapped: Vec<ExprId> = children
                    .iter()
                    .map(|&c| self.import_expr(grammar, c, rule_map, expr_map))
                    .collect();
                self.sequence(&mapped)
            }
            ExprView::Choice(children) => {
                let children = children.to_vec();
                let mapped: Vec<ExprId> = children
                    .iter()
                    .map(|&c| self.import_expr(grammar, c, rule_map, expr_map))
                    .collect();
                self.choice(&mapped)
            }
            ExprView::TagDispatch(payload) => {
                let spec = TagDispatchSpec::decode(payload);
                let pairs: Vec<(ExprId, RuleId)> = spec
                    .pairs
                    .iter()
                    .map(|&(trigger, rule)| {
                        (
                            self.import_expr(grammar, trigger.0, rule_map, expr_map),
                            RuleId(rule_map[rule.0 as usize]),
                        )
                    })
                    .collect();
                let stop_strs: Vec<ExprId> = spec
                    .stop_strs
                    .iter()
                    .map(|&s| self.import_expr(grammar, s.0, rule_map, expr_map))
                    .collect();
                let excludes: Vec<ExprId> = spec
                    .excludes
                    .iter()
                    .map(|&e| self.import_expr(grammar, e.0, rule_map, expr_map))
                    .collect();
                self.tag_dispatch(&TagDispatchSpec {
                    pairs,
                    stop_eos: spec.stop_eos,
                    stop_strs,
                    loop_after_dispatch: spec.loop_after_dispatch,
                    excludes,
                })
            }
            ExprView::RepeatRange { expr, min, max } => {
                let child = self.import_expr(grammar, expr, rule_map, expr_map);
                self.repeat_range(child, min, max)
            }
        };
        expr_map.insert(expr_id, new_id.0);
        new_id
    }

    /// Finishes the build. Checks that every declared rule has a body and
    /// constructs the tag-dispatch automata.
    pub(crate) fn finalize(self, root: RuleId) -> Result<Grammar, GrammarError> {
        for rule in &self.rules {
            if rule.body_expr_id < 0 {
                return Err(GrammarError::Semantic(format!(
                    "rule \"{}\" has no body",
                    rule.name
                )));
            }
        }
        let mut grammar = Grammar {
            rules: self.rules,
            expr_data: self.expr_data,
            root_rule_id: root.0,
            allow_empty_rule_ids: Vec::new(),
            tag_dispatch_fsms: AHashMap::default(),
        };
        grammar.rebuild_tag_dispatch_fsms();
        Ok(grammar)
    }
}

fn canonical_class_payload(negated: bool, ranges: &[(u32, u32)]) -> Vec<i32> {
    let mut sorted: Vec<(u32, u32)> = ranges.to_vec();
    sorted.sort_unstable();
    let mut merged: Vec<(u32, u32)> = Vec::with_capacity(sorted.len());
    for (lo, hi) in sorted {
        match merged.last_mut() {
            Some((_, prev_hi)) if lo <= prev_hi.saturating_add(1) => {
                *prev_hi = (*prev_hi).max(hi);
            }
            _ => merged.push((lo, hi)),
        }
    }
    let mut payload = Vec::with_capacity(merged.len() * 2 + 1);
    payload.push(negated as i32);
    for (lo, hi) in merged {
        payload.push(lo as i32);
        payload.push(hi as i32);
    }
    payload
}
