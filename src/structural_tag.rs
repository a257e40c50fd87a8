//! Structural tags: a declarative schema for model outputs combining
//! constant strings, JSON schemas, regexes, free-text sections and nested
//! tag blocks, typically used to constrain function calling.
//!
//! The pipeline has two passes. The analyzer classifies every node as
//! bounded (its end is recognizable from the outside) or unbounded and
//! validates the combination rules; the converter then lowers the tree into
//! the grammar IR, synthesizing tag-dispatch rules for free-text sections
//! and propagating the enclosing terminator down to them.
//!
//! A small template engine expands `{{name[].path}}` placeholders in the
//! builtin per-model templates against a caller-supplied value map.
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::grammar::{
    ExprId, Grammar, GrammarBuilder, GrammarError, RuleId, TagDispatchSpec,
};

/// The error type for structural-tag analysis, conversion and template
/// expansion.
#[derive(Debug, thiserror::Error)]
pub enum StructuralTagError {
    /// The structural tag JSON or tree shape is invalid.
    #[error("Structural tag format error: {0}")]
    Format(String),
    /// The analyzer rejected the tree (boundedness or trigger rules).
    #[error("Structural tag error: {0}")]
    Analysis(String),
    /// Template expansion failed.
    #[error("Structural tag template error: {0}")]
    Template(String),
    /// An embedded grammar, schema or regex failed to convert.
    #[error("{0}")]
    Grammar(Box<GrammarError>),
}

/// One or several alternative end strings of a [`Format::Tag`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagEnd {
    /// A single end string.
    Single(String),
    /// A non-empty list of alternative end strings.
    Multiple(Vec<String>),
}

impl TagEnd {
    fn alternatives(&self) -> Result<Vec<&str>, StructuralTagError> {
        match self {
            TagEnd::Single(end) => Ok(vec![end.as_str()]),
            TagEnd::Multiple(ends) => {
                if ends.is_empty() {
                    return Err(StructuralTagError::Format(
                        "a tag end list must not be empty".to_string(),
                    ));
                }
                Ok(ends.iter().map(String::as_str).collect())
            }
        }
    }
}

/// The structural-tag format tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Format {
    /// Matches exactly `value`.
    ConstString {
        /// The literal text.
        value: String,
    },
    /// Matches any JSON value satisfying the schema.
    JsonSchema {
        /// The schema document (or a whole-value template placeholder).
        json_schema: Value,
    },
    /// Matches the regular expression.
    Regex {
        /// The pattern, in the supported ECMA-262 subset.
        pattern: String,
    },
    /// Matches the provided EBNF grammar (its `root` rule).
    Grammar {
        /// The EBNF text.
        grammar: String,
    },
    /// Matches any character sequence not containing an excluded substring.
    AnyText {
        /// Substrings that must not occur in the text.
        #[serde(default)]
        excludes: Vec<String>,
    },
    /// XML-wrapped rendering of a JSON object schema as
    /// `<parameter=name>value</parameter>` blocks.
    QwenXmlParameter {
        /// The object schema describing the parameters.
        json_schema: Value,
    },
    /// Concatenation; only the last element may be unbounded.
    Sequence {
        /// The elements in order.
        elements: Vec<Format>,
    },
    /// Alternation; the elements must be all bounded or all unbounded.
    Or {
        /// The alternatives.
        elements: Vec<Format>,
    },
    /// `begin · content · end`.
    Tag {
        /// The opening text.
        begin: String,
        /// The content between begin and end.
        content: Box<Format>,
        /// The end string or alternative end strings.
        end: TagEnd,
    },
    /// Free text interleaved with dispatched tags.
    TriggeredTags {
        /// The trigger prefixes scanned for in free text.
        triggers: Vec<String>,
        /// The tags; every tag's begin must extend exactly one trigger.
        tags: Vec<Format>,
        /// Require at least one dispatched tag.
        #[serde(default)]
        at_least_one: bool,
        /// Stop scanning after the first dispatched tag completes.
        #[serde(default)]
        stop_after_first: bool,
        /// Substrings that must not occur in the free text.
        #[serde(default)]
        excludes: Vec<String>,
    },
    /// `(tag (separator tag)*)?` with the quantifiers controlled by the two
    /// booleans.
    TagsWithSeparator {
        /// The tags.
        tags: Vec<Format>,
        /// The separator between consecutive tags; may be empty.
        separator: String,
        /// Require at least one tag.
        #[serde(default)]
        at_least_one: bool,
        /// Emit exactly one tag.
        #[serde(default)]
        stop_after_first: bool,
    },
}

/// The top-level structural tag object, as carried in
/// `"response_format": {"type": "structural_tag", "format": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralTag {
    /// The discriminator; always `"structural_tag"`.
    #[serde(rename = "type", default = "structural_tag_type")]
    pub tag_type: String,
    /// The format tree.
    pub format: Format,
}

fn structural_tag_type() -> String {
    "structural_tag".to_string()
}

impl StructuralTag {
    /// Wraps a format tree in the top-level object.
    pub fn new(format: Format) -> StructuralTag {
        StructuralTag { tag_type: structural_tag_type(), format }
    }

    /// Parses a structural tag from its JSON representation.
    ///
    /// # Errors
    ///
    /// Returns a [`StructuralTagError::Format`] when the JSON is malformed
    /// or the `type` discriminator is wrong.
    pub fn from_json(json: &str) -> Result<StructuralTag, StructuralTagError> {
        let tag: StructuralTag = serde_json::from_str(json)
            .map_err(|e| StructuralTagError::Format(e.to_string()))?;
        if tag.tag_type != "structural_tag" {
            return Err(StructuralTagError::Format(format!(
                "expected type \"structural_tag\", got \"{}\"",
                tag.tag_type
            )));
        }
        Ok(tag)
    }

    /// Serializes the structural tag to JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("structural tag serialization cannot fail")
    }
}

// ---------- Analyzer ----------

/// Whether a format's end is recognizable from the outside.
fn is_bounded(format: &Format) -> Result<bool, StructuralTagError> {
    match format {
        Format::ConstString { .. }
        | Format::JsonSchema { .. }
        | Format::Regex { .. }
        | Format::Grammar { .. }
        | Format::QwenXmlParameter { .. } => Ok(true),
        Format::AnyText { .. } | Format::TriggeredTags { .. } | Format::TagsWithSeparator { .. } => {
            Ok(false)
        }
        Format::Sequence { elements } => {
            for (index, element) in elements.iter().enumerate() {
                let bounded = is_bounded(element)?;
                if !bounded && index + 1 != elements.len() {
                    return Err(StructuralTagError::Analysis(
                        "an unbounded element may only appear at the end of a sequence"
                            .to_string(),
                    ));
                }
            }
            match elements.last() {
                Some(last) => is_bounded(last),
                None => Ok(true),
            }
        }
        Format::Or { elements } => {
            let mut bounded = None;
            for element in elements {
                let element_bounded = is_bounded(element)?;
                match bounded {
                    None => bounded = Some(element_bounded),
                    Some(previous) if previous != element_bounded => {
                        return Err(StructuralTagError::Analysis(
                            "an or must not mix bounded and unbounded elements".to_string(),
                        ))
                    }
                    _ => {}
                }
            }
            Ok(bounded.unwrap_or(true))
        }
        Format::Tag { content, end, .. } => {
            let content_bounded = is_bounded(content)?;
            let ends = end.alternatives()?;
            if !content_bounded && ends.iter().all(|e| e.is_empty()) {
                return Err(StructuralTagError::Analysis(
                    "a tag with unbounded content needs a non-empty end alternative".to_string(),
                ));
            }
            Ok(true)
        }
    }
}

fn analyze(format: &Format) -> Result<(), StructuralTagError> {
    is_bounded(format)?;
    validate_triggers(format)
}

fn validate_triggers(format: &Format) -> Result<(), StructuralTagError> {
    match format {
        Format::TriggeredTags { triggers, tags, .. } => {
            if triggers.iter().any(String::is_empty) {
                return Err(StructuralTagError::Analysis(
                    "triggers must be non-empty strings".to_string(),
                ));
            }
            for tag in tags {
                let Format::Tag { begin, content, .. } = tag else {
                    return Err(StructuralTagError::Format(
                        "triggered_tags entries must be tag formats".to_string(),
                    ));
                };
                let matching =
                    triggers.iter().filter(|t| begin.as_bytes().starts_with(t.as_bytes())).count();
                if matching == 0 {
                    return Err(StructuralTagError::Analysis(format!(
                        "tag begin \"{}\" matches no trigger",
                        begin
                    )));
                }
                if matching > 1 {
                    return Err(StructuralTagError::Analysis(format!(
                        "tag begin \"{}\" matches more than one trigger",
                        begin
                    )));
                }
                validate_triggers(content)?;
            }
            Ok(())
        }
        Format::Sequence { elements } | Format::Or { elements } => {
            elements.iter().try_for_each(validate_triggers)
        }
        Format::Tag { content, .. } => validate_triggers(content),
        Format::TagsWithSeparator { tags, .. } => tags.iter().try_for_each(validate_triggers),
        _ => Ok(()),
    }
}

// ---------- Converter ----------

/// The terminator an unbounded section stops at.
#[derive(Debug, Clone)]
enum Terminator {
    /// End of generation.
    Eos,
    /// One of these strings, consumed by the section.
    Strings(Vec<Vec<u8>>),
}

/// Converts a structural tag into an unnormalized grammar.
pub(crate) fn structural_tag_to_grammar(tag: &StructuralTag) -> Result<Grammar, GrammarError> {
    analyze(&tag.format)?;
    let mut converter = Converter { builder: GrammarBuilder::new() };
    let root = converter.builder.add_rule("root");
    let (expr, _) = converter.convert(&tag.format, &Terminator::Eos)?;
    // Hoist a sole dispatch rule to the root so the root body is the
    // dispatch itself.
    let body = match converter.dispatch_body_of(expr) {
        Some(dispatch) => dispatch,
        None => converter.builder.choice(&[expr]),
    };
    converter.builder.set_rule_body(root, body);
    converter.builder.finalize(root)
}

struct Converter {
    builder: GrammarBuilder,
}

impl Converter {
    /// If `expr` is a reference to a rule whose body is a tag dispatch,
    /// returns that dispatch expression.
    fn dispatch_body_of(&self, expr: ExprId) -> Option<ExprId> {
        use crate::grammar::ExprView;
        let ExprView::RuleRef(rule) = self.builder.expr(expr) else {
            return None;
        };
        let rule = RuleId(rule);
        if !self.builder.rule_has_body(rule) {
            return None;
        }
        let body = self.builder.rule_body(rule);
        matches!(self.builder.expr(body), ExprView::TagDispatch(_)).then_some(body)
    }

    /// Converts one node. Returns the expression and whether it consumes the
    /// enclosing terminator itself (dispatch-based sections do).
    fn convert(
        &mut self,
        format: &Format,
        terminator: &Terminator,
    ) -> Result<(ExprId, bool), GrammarError> {
        match format {
            Format::ConstString { value } => {
                let expr = if value.is_empty() {
                    self.builder.empty_str()
                } else {
                    self.builder.byte_string(value.as_bytes())
                };
                Ok((expr, false))
            }
            Format::JsonSchema { json_schema } => {
                let schema_text = serde_json::to_string(json_schema)
                    .map_err(|e| GrammarError::JsonSchema(e.to_string()))?;
                let ebnf = crate::json_schema::json_schema_to_ebnf(
                    &schema_text,
                    &crate::json_schema::JsonSchemaOptions::default(),
                )?;
                let grammar = crate::ebnf::parse_ebnf(&ebnf, "root")?;
                let rule = self.builder.import(&grammar);
                Ok((self.builder.rule_ref(rule), false))
            }
            Format::Regex { pattern } => {
                let grammar = crate::regex::parse_regex(pattern)?;
                let rule = self.builder.import(&grammar);
                Ok((self.builder.rule_ref(rule), false))
            }
            Format::Grammar { grammar } => {
                let grammar = crate::ebnf::parse_ebnf(grammar, "root")?;
                let rule = self.builder.import(&grammar);
                Ok((self.builder.rule_ref(rule), false))
            }
            Format::AnyText { excludes } => {
                let expr = self.any_text(excludes, terminator);
                Ok((expr, true))
            }
            Format::QwenXmlParameter { json_schema } => {
                let expr = self.qwen_xml_parameters(json_schema)?;
                Ok((expr, false))
            }
            Format::Sequence { elements } => {
                let mut parts = Vec::with_capacity(elements.len());
                let mut consumed = false;
                for (index, element) in elements.iter().enumerate() {
                    let last = index + 1 == elements.len();
                    let ctx = if last { terminator.clone() } else { Terminator::Eos };
                    let (part, part_consumed) = self.convert(element, &ctx)?;
                    if last {
                        consumed = part_consumed;
                    }
                    parts.push(part);
                }
                Ok((self.builder.sequence(&parts), consumed))
            }
            Format::Or { elements } => {
                let mut branches = Vec::with_capacity(elements.len());
                let mut any_consumed = false;
                let mut results = Vec::with_capacity(elements.len());
                for element in elements {
                    let result = self.convert(element, terminator)?;
                    any_consumed |= result.1;
                    results.push(result);
                }
                for (branch, consumed) in results {
                    if any_consumed && !consumed {
                        // Make the branches uniform: append the terminator
                        // to branches that do not consume it themselves.
                        let end = self.terminator_expr(terminator);
                        match end {
                            Some(end) => branches.push(self.builder.sequence(&[branch, end])),
                            None => branches.push(branch),
                        }
                    } else {
                        branches.push(branch);
                    }
                }
                Ok((self.builder.choice(&branches), any_consumed))
            }
            Format::Tag { .. } => {
                let expr = self.full_tag_expr(format, 0)?;
                Ok((expr, false))
            }
            Format::TriggeredTags {
                triggers,
                tags,
                at_least_one,
                stop_after_first,
                excludes,
            } => {
                let expr = self.triggered_tags(
                    triggers,
                    tags,
                    *at_least_one,
                    *stop_after_first,
                    excludes,
                    terminator,
                )?;
                Ok((expr, true))
            }
            Format::TagsWithSeparator { tags, separator, at_least_one, stop_after_first } => {
                let expr =
                    self.tags_with_separator(tags, separator, *at_least_one, *stop_after_first)?;
                Ok((expr, false))
            }
        }
    }

    /// The expression consuming the terminator explicitly, or `None` at end
    /// of generation.
    fn terminator_expr(&mut self, terminator: &Terminator) -> Option<ExprId> {
        match terminator {
            Terminator::Eos => None,
            Terminator::Strings(ends) => {
                let branches: Vec<ExprId> = ends
                    .iter()
                    .map(|end| {
                        if end.is_empty() {
                            self.builder.empty_str()
                        } else {
                            self.builder.byte_string(end)
                        }
                    })
                    .collect();
                Some(if branches.len() == 1 {
                    branches[0]
                } else {
                    self.builder.choice(&branches)
                })
            }
        }
    }

    /// A free-text section: a dispatch rule with no triggers that runs until
    /// its terminator.
    fn any_text(&mut self, excludes: &[String], terminator: &Terminator) -> ExprId {
        let (stop_eos, stop_strs) = self.terminator_parts(terminator);
        let excludes: Vec<ExprId> =
            excludes.iter().map(|e| self.builder.byte_string(e.as_bytes())).collect();
        let name = self.builder.fresh_name("any_text");
        let rule = self.builder.add_rule(&name);
        let dispatch = self.builder.tag_dispatch(&TagDispatchSpec {
            pairs: Vec::new(),
            stop_eos,
            stop_strs,
            loop_after_dispatch: true,
            excludes,
        });
        self.builder.set_rule_body(rule, dispatch);
        self.builder.rule_ref(rule)
    }

    fn terminator_parts(&mut self, terminator: &Terminator) -> (bool, Vec<ExprId>) {
        match terminator {
            Terminator::Eos => (true, Vec::new()),
            Terminator::Strings(ends) => {
                let stops: Vec<ExprId> = ends
                    .iter()
                    .filter(|end| !end.is_empty())
                    .map(|end| self.builder.byte_string(end))
                    .collect();
                (false, stops)
            }
        }
    }

    /// One full tag expression: the begin remainder after `cut` bytes, the
    /// content and the end alternatives. Unbounded dispatch-based content
    /// consumes the end strings itself.
    fn full_tag_expr(&mut self, tag: &Format, cut: usize) -> Result<ExprId, GrammarError> {
        let Format::Tag { begin, content, end } = tag else {
            return Err(GrammarError::StructuralTag(StructuralTagError::Format(
                "expected a tag format".to_string(),
            )));
        };
        let remainder = &begin.as_bytes()[cut..];
        let ends: Vec<Vec<u8>> = end
            .alternatives()
            .map_err(GrammarError::StructuralTag)?
            .iter()
            .map(|e| e.as_bytes().to_vec())
            .collect();
        let content_bounded = is_bounded(content).map_err(GrammarError::StructuralTag)?;
        let mut parts = Vec::new();
        if !remainder.is_empty() {
            parts.push(self.builder.byte_string(remainder));
        }
        if content_bounded {
            let (content_expr, _) = self.convert(content, &Terminator::Eos)?;
            parts.push(content_expr);
            if let Some(end_expr) = self.terminator_expr(&Terminator::Strings(ends)) {
                parts.push(end_expr);
            }
        } else {
            let non_empty: Vec<Vec<u8>> = ends.iter().filter(|e| !e.is_empty()).cloned().collect();
            let (content_expr, consumed) =
                self.convert(content, &Terminator::Strings(non_empty.clone()))?;
            parts.push(content_expr);
            if !consumed {
                if let Some(end_expr) = self.terminator_expr(&Terminator::Strings(non_empty)) {
                    parts.push(end_expr);
                }
            }
        }
        Ok(self.builder.sequence(&parts))
    }

    fn triggered_tags(
        &mut self,
        triggers: &[String],
        tags: &[Format],
        at_least_one: bool,
        stop_after_first: bool,
        excludes: &[String],
        terminator: &Terminator,
    ) -> Result<ExprId, GrammarError> {
        // Group the tags by the unique trigger their begin extends.
        let mut groups: Vec<Vec<&Format>> = vec![Vec::new(); triggers.len()];
        for tag in tags {
            let Format::Tag { begin, .. } = tag else {
                return Err(GrammarError::StructuralTag(StructuralTagError::Format(
                    "triggered_tags entries must be tag formats".to_string(),
                )));
            };
            let index = triggers
                .iter()
                .position(|t| begin.as_bytes().starts_with(t.as_bytes()))
                .expect("validated by the analyzer");
            groups[index].push(tag);
        }
        let mut pairs: Vec<(ExprId, RuleId)> = Vec::new();
        for (trigger, group) in triggers.iter().zip(&groups) {
            if group.is_empty() {
                continue;
            }
            let mut branches = Vec::with_capacity(group.len());
            for tag in group {
                branches.push(self.full_tag_expr(tag, trigger.len())?);
            }
            let body = self.builder.choice(&branches);
            let name = self.builder.fresh_name("dispatch_case");
            let rule = self.builder.add_rule(&name);
            self.builder.set_rule_body(rule, body);
            let trigger_expr = self.builder.byte_string(trigger.as_bytes());
            pairs.push((trigger_expr, rule));
        }
        let (stop_eos, stop_strs) = self.terminator_parts(terminator);
        let exclude_exprs: Vec<ExprId> =
            excludes.iter().map(|e| self.builder.byte_string(e.as_bytes())).collect();
        let dispatch = self.builder.tag_dispatch(&TagDispatchSpec {
            pairs,
            stop_eos,
            stop_strs,
            loop_after_dispatch: !stop_after_first,
            excludes: exclude_exprs,
        });
        let name = self.builder.fresh_name("triggered_tags");
        let rule = self.builder.add_rule(&name);
        self.builder.set_rule_body(rule, dispatch);
        let dispatch_ref = self.builder.rule_ref(rule);
        if at_least_one {
            // A mandatory first dispatched tag precedes the scanning loop.
            let mut first_branches = Vec::with_capacity(tags.len());
            for tag in tags {
                first_branches.push(self.full_tag_expr(tag, 0)?);
            }
            let first = self.builder.choice(&first_branches);
            Ok(self.builder.sequence(&[first, dispatch_ref]))
        } else {
            Ok(dispatch_ref)
        }
    }

    fn tags_with_separator(
        &mut self,
        tags: &[Format],
        separator: &str,
        at_least_one: bool,
        stop_after_first: bool,
    ) -> Result<ExprId, GrammarError> {
        let mut branches = Vec::with_capacity(tags.len());
        for tag in tags {
            branches.push(self.full_tag_expr(tag, 0)?);
        }
        let tag_choice = self.builder.choice(&branches);
        if stop_after_first {
            if at_least_one {
                return Ok(tag_choice);
            }
            let empty = self.builder.empty_str();
            return Ok(self.builder.choice(&[empty, tag_choice]));
        }
        // loop ::= "" | (separator tag loop)
        let loop_name = self.builder.fresh_name("tag_sep_loop");
        let loop_rule = self.builder.add_rule(&loop_name);
        let recursion = self.builder.rule_ref(loop_rule);
        let step = if separator.is_empty() {
            self.builder.sequence(&[tag_choice, recursion])
        } else {
            let sep = self.builder.byte_string(separator.as_bytes());
            self.builder.sequence(&[sep, tag_choice, recursion])
        };
        let empty = self.builder.empty_str();
        let loop_body = self.builder.choice(&[empty, step]);
        self.builder.set_rule_body(loop_rule, loop_body);
        let repeated = self.builder.sequence(&[tag_choice, recursion]);
        if at_least_one {
            Ok(repeated)
        } else {
            let empty = self.builder.empty_str();
            Ok(self.builder.choice(&[empty, repeated]))
        }
    }

    /// Renders an object schema as ordered `<parameter=name>value</parameter>`
    /// blocks separated by newlines; string-typed parameters match raw text
    /// up to the closing tag, other types match their JSON grammar.
    fn qwen_xml_parameters(&mut self, schema: &Value) -> Result<ExprId, GrammarError> {
        let Some(object) = schema.as_object() else {
            return Err(GrammarError::StructuralTag(StructuralTagError::Format(
                "qwen_xml_parameter requires an object schema".to_string(),
            )));
        };
        let empty_map = serde_json::Map::new();
        let properties = object
            .get("properties")
            .and_then(Value::as_object)
            .unwrap_or(&empty_map);
        let required: AHashSet<&str> = object
            .get("required")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut blocks: Vec<(ExprId, bool)> = Vec::with_capacity(properties.len());
        for (name, prop_schema) in properties {
            let open = format!("<parameter={}>", name);
            let close = "</parameter>";
            let open_expr = self.builder.byte_string(open.as_bytes());
            let value_expr = if prop_schema.get("type").and_then(Value::as_str) == Some("string") {
                self.any_text(&[], &Terminator::Strings(vec![close.as_bytes().to_vec()]))
            } else {
                let (value, _) = self.convert(
                    &Format::JsonSchema { json_schema: prop_schema.clone() },
                    &Terminator::Eos,
                )?;
                value
            };
            let block = if prop_schema.get("type").and_then(Value::as_str) == Some("string") {
                // The raw-text dispatch consumes the closing tag itself.
                self.builder.sequence(&[open_expr, value_expr])
            } else {
                let close_expr = self.builder.byte_string(close.as_bytes());
                self.builder.sequence(&[open_expr, value_expr, close_expr])
            };
            blocks.push((block, required.contains(name.as_str())));
        }
        Ok(self.ordered_blocks(&blocks, b"\n"))
    }

    /// Chains blocks in order with a separator, allowing optional blocks to
    /// be omitted. Mirrors the ordered-property scheme of the JSON Schema
    /// converter, but in IR form.
    fn ordered_blocks(&mut self, blocks: &[(ExprId, bool)], separator: &[u8]) -> ExprId {
        if blocks.is_empty() {
            return self.builder.empty_str();
        }
        // part_i: what may follow after block i.
        let part_rules: Vec<RuleId> = (0..blocks.len())
            .map(|_| {
                let name = self.builder.fresh_name("param_part");
                self.builder.add_rule(&name)
            })
            .collect();
        for index in 0..blocks.len() {
            let mut alternatives = Vec::new();
            let mut required_follows = false;
            for next in index + 1..blocks.len() {
                let sep = self.builder.byte_string(separator);
                let next_ref = self.builder.rule_ref(part_rules[next]);
                let alt = self.builder.sequence(&[sep, blocks[next].0, next_ref]);
                alternatives.push(alt);
                if blocks[next].1 {
                    required_follows = true;
                    break;
                }
            }
            if !required_follows {
                alternatives.push(self.builder.empty_str());
            }
            let body = self.builder.choice(&alternatives);
            self.builder.set_rule_body(part_rules[index], body);
        }
        let first_required = blocks.iter().position(|(_, required)| *required);
        let last_start = first_required.unwrap_or(blocks.len() - 1);
        let mut starts = Vec::new();
        for index in 0..=last_start {
            let part_ref = self.builder.rule_ref(part_rules[index]);
            starts.push(self.builder.sequence(&[blocks[index].0, part_ref]));
        }
        if first_required.is_none() {
            starts.push(self.builder.empty_str());
        }
        self.builder.choice(&starts)
    }
}

// ---------- Builtin templates & expansion ----------

fn tool_tag(begin: &str, end: &str) -> Format {
    Format::Tag {
        begin: begin.to_string(),
        content: Box::new(Format::JsonSchema {
            json_schema: Value::String("{{tools[].parameters}}".to_string()),
        }),
        end: TagEnd::Single(end.to_string()),
    }
}

/// Returns the builtin structural-tag template for a model style. The
/// template contains `{{tools[].name}}`-style placeholders; expand it with
/// [`expand_template`] before compiling.
///
/// Supported styles: `llama`, `qwen`, `qwen_coder`, `kimi`, `deepseek`,
/// `harmony`.
pub fn builtin_structural_tag_template(style: &str) -> Result<StructuralTag, StructuralTagError> {
    let format = match style {
        "llama" => Format::TriggeredTags {
            triggers: vec!["{\"name\": ".to_string()],
            tags: vec![tool_tag("{\"name\": \"{{tools[].name}}\", \"parameters\": ", "}")],
            at_least_one: false,
            stop_after_first: false,
            excludes: Vec::new(),
        },
        "qwen" => Format::TriggeredTags {
            triggers: vec!["<tool_call>".to_string()],
            tags: vec![tool_tag(
                "<tool_call>{\"name\": \"{{tools[].name}}\", \"arguments\": ",
                "}</tool_call>",
            )],
            at_least_one: false,
            stop_after_first: false,
            excludes: Vec::new(),
        },
        "qwen_coder" => Format::TriggeredTags {
            triggers: vec!["<function=".to_string()],
            tags: vec![Format::Tag {
                begin: "<function={{tools[].name}}>".to_string(),
                content: Box::new(Format::QwenXmlParameter {
                    json_schema: Value::String("{{tools[].parameters}}".to_string()),
                }),
                end: TagEnd::Single("</function>".to_string()),
            }],
            at_least_one: false,
            stop_after_first: false,
            excludes: Vec::new(),
        },
        "kimi" => Format::TriggeredTags {
            triggers: vec!["<|tool_call_begin|>".to_string()],
            tags: vec![tool_tag(
                "<|tool_call_begin|>{{tools[].name}}<|tool_call_argument_begin|>",
                "<|tool_call_end|>",
            )],
            at_least_one: false,
            stop_after_first: false,
            excludes: Vec::new(),
        },
        "deepseek" => Format::TriggeredTags {
            triggers: vec!["<｜tool▁calls▁begin｜><｜tool▁call▁begin｜>".to_string()],
            tags: vec![tool_tag(
                "<｜tool▁calls▁begin｜><｜tool▁call▁begin｜>{{tools[].name}}<｜tool▁sep｜>",
                "<｜tool▁call▁end｜>",
            )],
            at_least_one: false,
            stop_after_first: false,
            excludes: Vec::new(),
        },
        "harmony" => Format::TriggeredTags {
            triggers: vec!["<|start|>".to_string()],
            tags: vec![
                Format::Tag {
                    begin: "<|start|>assistant<|channel|>analysis<|message|>".to_string(),
                    content: Box::new(Format::AnyText { excludes: Vec::new() }),
                    end: TagEnd::Single("<|end|>".to_string()),
                },
                Format::Tag {
                    begin: "<|start|>assistant<|channel|>final<|message|>".to_string(),
                    content: Box::new(Format::AnyText { excludes: Vec::new() }),
                    end: TagEnd::Multiple(vec!["<|return|>".to_string(), "<|call|>".to_string()]),
                },
                tool_tag(
                    "<|start|>assistant<|channel|>commentary to={{tools[].name}}<|constrain|>json<|message|>",
                    "<|end|>",
                ),
                tool_tag(
                    "<|start|>assistant<|channel|>analysis to={{builtin_tools[].name}}<|message|>",
                    "<|end|>",
                ),
            ],
            at_least_one: false,
            stop_after_first: false,
            excludes: Vec::new(),
        },
        other => {
            return Err(StructuralTagError::Template(format!(
                "Unknown format type: {}, support types: [\"llama\", \"qwen\", \"qwen_coder\", \
                 \"kimi\", \"deepseek\", \"harmony\"]",
                other
            )))
        }
    };
    Ok(StructuralTag::new(format))
}

/// One parsed `{{...}}` placeholder.
#[derive(Debug, PartialEq)]
struct Placeholder {
    name: String,
    is_array: bool,
    path: Vec<String>,
}

fn find_placeholders(text: &str) -> Result<Vec<(usize, usize, Placeholder)>, StructuralTagError> {
    let mut result = Vec::new();
    let bytes = text.as_bytes();
    let mut index = 0;
    while index + 1 < bytes.len() {
        if &bytes[index..index + 2] != b"{{" {
            index += 1;
            continue;
        }
        let Some(end) = text[index + 2..].find("}}") else {
            return Err(StructuralTagError::Template(format!(
                "Unterminated placeholder in \"{}\"",
                text
            )));
        };
        let inner = &text[index + 2..index + 2 + end];
        let (name_part, path_part) = match inner.find('.') {
            Some(dot) => (&inner[..dot], &inner[dot + 1..]),
            None => (inner, ""),
        };
        let (name, is_array) = match name_part.strip_suffix("[]") {
            Some(name) => (name, true),
            None => (name_part, false),
        };
        if name.is_empty() {
            return Err(StructuralTagError::Template(format!(
                "Empty placeholder name in \"{}\"",
                text
            )));
        }
        let path: Vec<String> = if path_part.is_empty() {
            Vec::new()
        } else {
            path_part.split('.').map(str::to_string).collect()
        };
        result.push((
            index,
            index + 2 + end + 2,
            Placeholder { name: name.to_string(), is_array, path },
        ));
        index += 2 + end + 2;
    }
    Ok(result)
}

fn lookup_path<'v>(
    mut value: &'v Value,
    path: &[String],
    context: &str,
) -> Result<&'v Value, StructuralTagError> {
    for key in path {
        value = value.get(key).ok_or_else(|| {
            StructuralTagError::Template(format!(
                "Path component '{}' not found while expanding '{}'",
                key, context
            ))
        })?;
    }
    Ok(value)
}

/// Collects the distinct array placeholder names in a subtree.
fn array_names(format: &Format, names: &mut AHashSet<String>) -> Result<(), StructuralTagError> {
    let mut scan_text = |text: &str| -> Result<(), StructuralTagError> {
        let mut in_string: AHashSet<String> = AHashSet::default();
        for (_, _, placeholder) in find_placeholders(text)? {
            if placeholder.is_array {
                in_string.insert(placeholder.name.clone());
                names.insert(placeholder.name);
            }
        }
        if in_string.len() > 1 {
            return Err(StructuralTagError::Template(
                "Multiple different placeholder names found in the same string".to_string(),
            ));
        }
        Ok(())
    };
    match format {
        Format::ConstString { value } => scan_text(value),
        Format::JsonSchema { json_schema } | Format::QwenXmlParameter { json_schema } => {
            if let Value::String(text) = json_schema {
                scan_text(text)?;
            }
            Ok(())
        }
        Format::Regex { pattern } => scan_text(pattern),
        Format::Grammar { grammar } => scan_text(grammar),
        Format::AnyText { .. } => Ok(()),
        Format::Sequence { elements } | Format::Or { elements } => {
            elements.iter().try_for_each(|e| array_names(e, names))
        }
        Format::Tag { begin, content, end } => {
            scan_text(begin)?;
            for alternative in end.alternatives()? {
                scan_text(alternative)?;
            }
            array_names(content, names)
        }
        Format::TriggeredTags { tags, .. } | Format::TagsWithSeparator { tags, .. } => {
            tags.iter().try_for_each(|t| array_names(t, names))
        }
    }
}

/// Expands the `{{name[].path}}` / `{{name.path}}` placeholders of a
/// structural-tag template.
///
/// `values` maps each placeholder name to a list of objects (for `[]`
/// placeholders) or an object. Every list element of `tags`, `elements` et
/// al. whose subtree uses `{{name[]...}}` is replicated once per entry of
/// `values[name]`.
///
/// # Errors
///
/// Fails when a placeholder name is missing from `values`, when one string
/// mixes different array names, or when a subtree mingles several array
/// names.
pub fn expand_template(
    tag: &StructuralTag,
    values: &serde_json::Map<String, Value>,
) -> Result<StructuralTag, StructuralTagError> {
    Ok(StructuralTag::new(expand_format(&tag.format, values, None)?))
}

/// The per-element context of an array expansion.
struct ArrayContext<'a> {
    name: &'a str,
    entry: &'a Value,
}

fn expand_format(
    format: &Format,
    values: &serde_json::Map<String, Value>,
    context: Option<&ArrayContext<'_>>,
) -> Result<Format, StructuralTagError> {
    let expand_list = |list: &[Format]| -> Result<Vec<Format>, StructuralTagError> {
        let mut expanded = Vec::with_capacity(list.len());
        for element in list {
            let mut names = AHashSet::default();
            array_names(element, &mut names)?;
            names.retain(|name| context.map(|c| c.name != name).unwrap_or(true));
            if names.len() > 1 {
                return Err(StructuralTagError::Template(
                    "Mingled placeholder names found".to_string(),
                ));
            }
            match names.into_iter().next() {
                None => expanded.push(expand_format(element, values, context)?),
                Some(name) => {
                    let entries = values.get(&name).ok_or_else(|| {
                        StructuralTagError::Template(format!(
                            "Placeholder name '{}' not found in values",
                            name
                        ))
                    })?;
                    let Some(entries) = entries.as_array() else {
                        return Err(StructuralTagError::Template(format!(
                            "Placeholder '{}[]' requires a list of values",
                            name
                        )));
                    };
                    for entry in entries {
                        let entry_context = ArrayContext { name: &name, entry };
                        expanded.push(expand_format(element, values, Some(&entry_context))?);
                    }
                }
            }
        }
        Ok(expanded)
    };

    match format {
        Format::ConstString { value } => Ok(Format::ConstString {
            value: expand_text(value, values, context)?,
        }),
        Format::JsonSchema { json_schema } => Ok(Format::JsonSchema {
            json_schema: expand_value(json_schema, values, context)?,
        }),
        Format::QwenXmlParameter { json_schema } => Ok(Format::QwenXmlParameter {
            json_schema: expand_value(json_schema, values, context)?,
        }),
        Format::Regex { pattern } => Ok(Format::Regex {
            pattern: expand_text(pattern, values, context)?,
        }),
        Format::Grammar { grammar } => Ok(Format::Grammar {
            grammar: expand_text(grammar, values, context)?,
        }),
        Format::AnyText { excludes } => Ok(Format::AnyText { excludes: excludes.clone() }),
        Format::Sequence { elements } => Ok(Format::Sequence { elements: expand_list(elements)? }),
        Format::Or { elements } => Ok(Format::Or { elements: expand_list(elements)? }),
        Format::Tag { begin, content, end } => Ok(Format::Tag {
            begin: expand_text(begin, values, context)?,
            content: Box::new(expand_format(content, values, context)?),
            end: match end {
                TagEnd::Single(end) => TagEnd::Single(expand_text(end, values, context)?),
                TagEnd::Multiple(ends) => TagEnd::Multiple(
                    ends.iter()
                        .map(|e| expand_text(e, values, context))
                        .collect::<Result<_, _>>()?,
                ),
            },
        }),
        Format::TriggeredTags { triggers, tags, at_least_one, stop_after_first, excludes } => {
            Ok(Format::TriggeredTags {
                triggers: triggers.clone(),
                tags: expand_list(tags)?,
                at_least_one: *at_least_one,
                stop_after_first: *stop_after_first,
                excludes: excludes.clone(),
            })
        }
        Format::TagsWithSeparator { tags, separator, at_least_one, stop_after_first } => {
            Ok(Format::TagsWithSeparator {
                tags: expand_list(tags)?,
                separator: separator.clone(),
                at_least_one: *at_least_one,
                stop_after_first: *stop_after_first,
            })
        }
    }
}

fn resolve_placeholder<'v>(
    placeholder: &Placeholder,
    values: &'v serde_json::Map<String, Value>,
    context: Option<&ArrayContext<'v>>,
) -> Result<&'v Value, StructuralTagError> {
    if placeholder.is_array {
        let Some(context) = context.filter(|c| c.name == placeholder.name) else {
            return Err(StructuralTagError::Template(format!(
                "Array placeholder '{}[]' used outside of a list expansion",
                placeholder.name
            )));
        };
        return lookup_path(context.entry, &placeholder.path, &placeholder.name);
    }
    let base = values.get(&placeholder.name).ok_or_else(|| {
        StructuralTagError::Template(format!(
            "Placeholder name '{}' not found in values",
            placeholder.name
        ))
    })?;
    lookup_path(base, &placeholder.path, &placeholder.name)
}

fn expand_text(
    text: &str,
    values: &serde_json::Map<String, Value>,
    context: Option<&ArrayContext<'_>>,
) -> Result<String, StructuralTagError> {
    let placeholders = find_placeholders(text)?;
    if placeholders.is_empty() {
        return Ok(text.to_string());
    }
    let array_names: AHashSet<&str> = placeholders
        .iter()
        .filter(|(_, _, p)| p.is_array)
        .map(|(_, _, p)| p.name.as_str())
        .collect();
    if array_names.len() > 1 {
        return Err(StructuralTagError::Template(
            "Multiple different placeholder names found in the same string".to_string(),
        ));
    }
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end, placeholder) in placeholders {
        out.push_str(&text[cursor..start]);
        let value = resolve_placeholder(&placeholder, values, context)?;
        match value {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}

/// Expands a JSON value position: a string that is exactly one placeholder
/// is replaced by the referenced value itself.
fn expand_value(
    value: &Value,
    values: &serde_json::Map<String, Value>,
    context: Option<&ArrayContext<'_>>,
) -> Result<Value, StructuralTagError> {
    let Value::String(text) = value else {
        return Ok(value.clone());
    };
    let placeholders = find_placeholders(text)?;
    if placeholders.len() == 1 && placeholders[0].0 == 0 && placeholders[0].1 == text.len() {
        return Ok(resolve_placeholder(&placeholders[0].2, values, context)?.clone());
    }
    Ok(Value::String(expand_text(text, values, context)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_from_json() {
        let tag = StructuralTag::from_json(
            r#"{"type": "structural_tag", "format": {"type": "const_string", "value": "hi"}}"#,
        )
        .unwrap();
        assert_eq!(tag.format, Format::ConstString { value: "hi".to_string() });
    }

    #[test]
    fn test_mixed_or_rejected() {
        let format = Format::Or {
            elements: vec![
                Format::ConstString { value: "a".to_string() },
                Format::AnyText { excludes: Vec::new() },
            ],
        };
        assert!(matches!(
            analyze(&format),
            Err(StructuralTagError::Analysis(message)) if message.contains("mix")
        ));
    }

    #[test]
    fn test_unbounded_not_in_tail_rejected() {
        let format = Format::Sequence {
            elements: vec![
                Format::AnyText { excludes: Vec::new() },
                Format::ConstString { value: "x".to_string() },
            ],
        };
        assert!(analyze(&format).is_err());
    }

    #[test]
    fn test_trigger_matching() {
        let tag = Format::Tag {
            begin: "<x>".to_string(),
            content: Box::new(Format::ConstString { value: "v".to_string() }),
            end: TagEnd::Single("</x>".to_string()),
        };
        let format = Format::TriggeredTags {
            triggers: vec!["<y>".to_string()],
            tags: vec![tag],
            at_least_one: false,
            stop_after_first: false,
            excludes: Vec::new(),
        };
        assert!(matches!(
            analyze(&format),
            Err(StructuralTagError::Analysis(message)) if message.contains("matches no trigger")
        ));
    }

    #[test]
    fn test_placeholder_parsing() {
        let placeholders = find_placeholders("a {{tools[].name}} b {{cfg.mode}}").unwrap();
        assert_eq!(placeholders.len(), 2);
        assert_eq!(placeholders[0].2.name, "tools");
        assert!(placeholders[0].2.is_array);
        assert_eq!(placeholders[0].2.path, vec!["name".to_string()]);
        assert_eq!(placeholders[1].2.name, "cfg");
        assert!(!placeholders[1].2.is_array);
    }

    #[test]
    fn test_template_expansion() {
        let template = builtin_structural_tag_template("llama").unwrap();
        let values = json!({
            "tools": [
                {"name": "t1", "parameters": {"type": "object", "properties": {}}},
                {"name": "t2", "parameters": {"type": "object", "properties": {}}}
            ]
        });
        let expanded =
            expand_template(&template, values.as_object().unwrap()).unwrap();
        let Format::TriggeredTags { tags, .. } = &expanded.format else {
            panic!("expected triggered tags");
        };
        assert_eq!(tags.len(), 2);
        let Format::Tag { begin, .. } = &tags[0] else {
            panic!("expected a tag");
        };
        assert_eq!(begin, "{\"name\": \"t1\", \"parameters\": ");
    }

    #[test]
    fn test_missing_placeholder_value() {
        let template = builtin_structural_tag_template("qwen").unwrap();
        let values = serde_json::Map::new();
        let err = expand_template(&template, &values).unwrap_err();
        assert!(err.to_string().contains("not found in values"));
    }

    #[test]
    fn test_unknown_style() {
        assert!(builtin_structural_tag_template("gpt2").is_err());
    }
}
