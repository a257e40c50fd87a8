//! Lowering of JSON Schema documents to EBNF text.
//!
//! The converter emits an EBNF string that is then parsed by the regular
//! EBNF front end. Supported constructs: the primitive types, `enum` and
//! `const`, arrays with `items`/`prefixItems`, objects with
//! `properties`/`required`/`additionalProperties`, same-document `$ref` and
//! unions via `anyOf`/`oneOf`. Anything else conservatively degrades to
//! `basic_any`, the grammar of arbitrary JSON values.
//!
//! Properties and tuple items are matched in schema order; optional
//! properties may be omitted but never reordered. With `strict_mode`
//! (default) no unevaluated properties or items are admitted.
use ahash::{AHashMap, AHashSet};
use serde_json::Value;

use crate::grammar::{escape_bytes_to, GrammarError};

/// Formatting and strictness options for the JSON Schema converter,
/// following the conventions of Python's `json.dumps`.
#[derive(Debug, Clone)]
pub struct JsonSchemaOptions {
    /// Spaces of indentation per nesting level; `None` produces single-line
    /// output.
    pub indent: Option<usize>,
    /// The `(comma, colon)` separator pair. Defaults to `(", ", ": ")`
    /// without indent and `(",", ": ")` with indent.
    pub separators: Option<(String, String)>,
    /// Reject properties and items that the schema does not describe
    /// (equivalent to `unevaluatedProperties`/`unevaluatedItems` = false).
    pub strict_mode: bool,
}

impl Default for JsonSchemaOptions {
    fn default() -> Self {
        JsonSchemaOptions { indent: None, separators: None, strict_mode: true }
    }
}

/// The grammar of standard JSON with an object or array at the top level,
/// used by `compile_builtin_json_grammar`.
pub(crate) const BUILTIN_JSON_EBNF: &str = r#"root ::= (
    "{" [ \n\t]* members_and_embrace |
    "[" [ \n\t]* elements_or_embrace
)
value_non_str ::= (
    "{" [ \n\t]* members_and_embrace |
    "[" [ \n\t]* elements_or_embrace |
    "0" fraction exponent |
    [1-9] [0-9]* fraction exponent |
    "-" [0-9] fraction exponent |
    "-" [1-9] [0-9]* fraction exponent |
    "true" |
    "false" |
    "null"
) (= [ \n\t,}\]])
members_and_embrace ::= ("\"" characters_and_colon [ \n\t]* members_suffix | "}") (= [ \n\t,}\]])
members_suffix ::= (
    value_non_str [ \n\t]* member_suffix_suffix |
    "\"" characters_and_embrace |
    "\"" characters_and_comma [ \n\t]* "\"" characters_and_colon [ \n\t]* members_suffix
) (= [ \n\t,}\]])
member_suffix_suffix ::= (
    "}" |
    "," [ \n\t]* "\"" characters_and_colon [ \n\t]* members_suffix
) (= [ \n\t,}\]])
elements_or_embrace ::= (
    "{" [ \n\t]* members_and_embrace elements_rest [ \n\t]* "]" |
    "[" [ \n\t]* elements_or_embrace elements_rest [ \n\t]* "]" |
    "\"" characters_item elements_rest [ \n\t]* "]" |
    "0" fraction exponent elements_rest [ \n\t]* "]" |
    [1-9] [0-9]* fraction exponent elements_rest [ \n\t]* "]" |
    "-" "0" fraction exponent elements_rest [ \n\t]* "]" |
    "-" [1-9] [0-9]* fraction exponent elements_rest [ \n\t]* "]" |
    "true" elements_rest [ \n\t]* "]" |
    "false" elements_rest [ \n\t]* "]" |
    "null" elements_rest [ \n\t]* "]" |
    "]"
)
elements ::= (
    "{" [ \n\t]* members_and_embrace elements_rest |
    "[" [ \n\t]* elements_or_embrace elements_rest |
    "\"" characters_item elements_rest |
    "0" fraction exponent elements_rest |
    [1-9] [0-9]* fraction exponent elements_rest |
    "-" [0-9] fraction exponent elements_rest |
    "-" [1-9] [0-9]* fraction exponent elements_rest |
    "true" elements_rest |
    "false" elements_rest |
    "null" elements_rest
)
elements_rest ::= (
    "" |
    [ \n\t]* "," [ \n\t]* elements
)
characters_and_colon ::= (
    "\"" [ \n\t]* ":" |
    [^"\\\x00-\x1F] characters_and_colon |
    "\\" escape characters_and_colon
) (=[ \n\t]* [\"{[0-9tfn-])
characters_and_comma ::= (
    "\"" [ \n\t]* "," |
    [^"\\\x00-\x1F] characters_and_comma |
    "\\" escape characters_and_comma
) (=[ \n\t]* "\"")
characters_and_embrace ::= (
    "\"" [ \n\t]* "}" |
    [^"\\\x00-\x1F] characters_and_embrace |
    "\\" escape characters_and_embrace
) (=[ \n\t]* [},])
characters_item ::= (
    "\"" |
    [^"\\\x00-\x1F] characters_item |
    "\\" escape characters_item
) (= [ \n\t]* [,\]])
escape ::= ["\\/bfnrt] | "u" [A-Fa-f0-9] [A-Fa-f0-9] [A-Fa-f0-9] [A-Fa-f0-9]
fraction ::= "" | "." [0-9] [0-9]*
exponent ::= "" |  "e" sign [0-9] [0-9]* | "E" sign [0-9] [0-9]*
sign ::= "" | "+" | "-"
"#;

/// The helper rules shared by every schema-generated grammar.
const BASIC_RULES: &[(&str, &str)] = &[
    ("basic_escape", r#"["\\/bfnrt] | "u" [A-Fa-f0-9] [A-Fa-f0-9] [A-Fa-f0-9] [A-Fa-f0-9]"#),
    (
        "basic_string_sub",
        r#""\"" | [^"\\\x00-\x1f] basic_string_sub | "\\" basic_escape basic_string_sub"#,
    ),
    ("basic_string", r#""\"" basic_string_sub"#),
    ("basic_integer", r#"("0" | "-"? [1-9] [0-9]*)"#),
    ("basic_number", r#"("0" | "-"? [1-9] [0-9]*) ("." [0-9]+)? ([eE] [+-]? [0-9]+)?"#),
    ("basic_boolean", r#""true" | "false""#),
    ("basic_null", r#""null""#),
    (
        "basic_array",
        r#""[" ("" | [ \n\t]* basic_any ([ \n\t]* "," [ \n\t]* basic_any)*) [ \n\t]* "]""#,
    ),
    (
        "basic_object",
        r#""{" ("" | [ \n\t]* basic_string [ \n\t]* ":" [ \n\t]* basic_any ([ \n\t]* "," [ \n\t]* basic_string [ \n\t]* ":" [ \n\t]* basic_any)*) [ \n\t]* "}""#,
    ),
    (
        "basic_any",
        "basic_number | basic_string | basic_boolean | basic_null | basic_array | basic_object",
    ),
];

/// Lowers a JSON schema document to EBNF text with root rule `root`.
///
/// # Errors
///
/// Returns a [`GrammarError::JsonSchema`] when the schema is not valid JSON
/// or a `$ref` cannot be resolved.
pub fn json_schema_to_ebnf(
    schema: &str,
    options: &JsonSchemaOptions,
) -> Result<String, GrammarError> {
    let schema: Value = serde_json::from_str(schema)
        .map_err(|e| GrammarError::JsonSchema(format!("invalid JSON: {}", e)))?;
    let (comma, colon) = match &options.separators {
        Some((comma, colon)) => (comma.clone(), colon.clone()),
        None => match options.indent {
            Some(_) => (",".to_string(), ": ".to_string()),
            None => (", ".to_string(), ": ".to_string()),
        },
    };
    let mut emitter = Emitter {
        document: &schema,
        indent: options.indent,
        comma,
        colon,
        strict: options.strict_mode,
        rules: Vec::new(),
        rule_names: AHashSet::default(),
        ref_rules: AHashMap::default(),
    };
    for &(name, _) in BASIC_RULES {
        emitter.rule_names.insert(name.to_string());
    }
    emitter.rule_names.insert("root".to_string());
    let root_body = emitter.schema_expr(&schema, "root", 0)?;
    let mut out = String::new();
    for &(name, body) in BASIC_RULES {
        out.push_str(name);
        out.push_str(" ::= ");
        out.push_str(body);
        out.push('\n');
    }
    out.push_str("root ::= ");
    out.push_str(&root_body);
    out.push('\n');
    for (name, body) in emitter.rules {
        out.push_str(&name);
        out.push_str(" ::= ");
        out.push_str(&body);
        out.push('\n');
    }
    Ok(out)
}

struct Emitter<'a> {
    document: &'a Value,
    indent: Option<usize>,
    comma: String,
    colon: String,
    strict: bool,
    rules: Vec<(String, String)>,
    rule_names: AHashSet<String>,
    ref_rules: AHashMap<String, String>,
}

/// Quotes a text fragment as an EBNF terminal.
fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    escape_bytes_to(text.as_bytes(), false, &mut out);
    out.push('"');
    out
}

impl<'a> Emitter<'a> {
    fn fresh_rule_name(&mut self, hint: &str) -> String {
        let base: String = hint
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        let base = if base.is_empty() || base.as_bytes()[0].is_ascii_digit() {
            format!("r_{}", base)
        } else {
            base
        };
        let mut name = base.clone();
        let mut n = 1;
        while !self.rule_names.insert(name.clone()) {
            name = format!("{}_{}", base, n);
            n += 1;
        }
        name
    }

    fn add_rule(&mut self, name: String, body: String) {
        self.rules.push((name, body));
    }

    fn open_ws(&self, depth: usize) -> String {
        match self.indent {
            Some(n) => format!("\n{}", " ".repeat(n * (depth + 1))),
            None => String::new(),
        }
    }

    fn close_ws(&self, depth: usize) -> String {
        match self.indent {
            Some(n) => format!("\n{}", " ".repeat(n * depth)),
            None => String::new(),
        }
    }

    fn item_sep(&self, depth: usize) -> String {
        match self.indent {
            Some(n) => format!("{}\n{}", self.comma, " ".repeat(n * (depth + 1))),
            None => self.comma.clone(),
        }
    }

    /// Emits the EBNF expression matching `schema` at nesting depth `depth`.
    fn schema_expr(
        &mut self,
        schema: &Value,
        hint: &str,
        depth: usize,
    ) -> Result<String, GrammarError> {
        let object = match schema {
            Value::Bool(_) => return Ok("basic_any".to_string()),
            Value::Object(object) => object,
            _ => {
                return Err(GrammarError::JsonSchema(
                    "a schema must be an object or a boolean".to_string(),
                ))
            }
        };
        if let Some(reference) = object.get("$ref").and_then(Value::as_str) {
            return self.ref_expr(reference, depth);
        }
        if let Some(cases) = object
            .get("anyOf")
            .or_else(|| object.get("oneOf"))
            .and_then(Value::as_array)
        {
            let mut parts = Vec::with_capacity(cases.len());
            for (index, case) in cases.iter().enumerate() {
                parts.push(self.schema_expr(case, &format!("{}_case_{}", hint, index), depth)?);
            }
            return Ok(format!("({})", parts.join(" | ")));
        }
        if let Some(constant) = object.get("const") {
            return Ok(quote(&self.dump_json(constant, depth)));
        }
        if let Some(variants) = object.get("enum").and_then(Value::as_array) {
            let parts: Vec<String> =
                variants.iter().map(|v| quote(&self.dump_json(v, depth))).collect();
            if parts.is_empty() {
                return Err(GrammarError::JsonSchema("enum must not be empty".to_string()));
            }
            return Ok(format!("({})", parts.join(" | ")));
        }
        match object.get("type").and_then(Value::as_str) {
            Some("string") => Ok("basic_string".to_string()),
            Some("integer") => Ok("basic_integer".to_string()),
            Some("number") => Ok("basic_number".to_string()),
            Some("boolean") => Ok("basic_boolean".to_string()),
            Some("null") => Ok("basic_null".to_string()),
            Some("object") => self.object_expr(object, hint, depth),
            Some("array") => self.array_expr(object, hint, depth),
            // Unsupported or absent keywords degrade to any JSON value.
            _ => {
                if object.contains_key("properties") {
                    self.object_expr(object, hint, depth)
                } else if object.contains_key("items") || object.contains_key("prefixItems") {
                    self.array_expr(object, hint, depth)
                } else {
                    Ok("basic_any".to_string())
                }
            }
        }
    }

    fn ref_expr(&mut self, reference: &str, depth: usize) -> Result<String, GrammarError> {
        if let Some(name) = self.ref_rules.get(reference) {
            return Ok(name.clone());
        }
        let Some(pointer) = reference.strip_prefix('#') else {
            return Err(GrammarError::JsonSchema(format!(
                "only same-document references are supported, got \"{}\"",
                reference
            )));
        };
        let target = if pointer.is_empty() {
            Some(self.document)
        } else {
            self.document.pointer(pointer)
        };
        let Some(target) = target else {
            return Err(GrammarError::JsonSchema(format!(
                "cannot resolve reference \"{}\"",
                reference
            )));
        };
        let tail = reference.rsplit('/').next().unwrap_or("ref");
        let name = self.fresh_rule_name(tail);
        // Register before generating so recursive schemas terminate.
        self.ref_rules.insert(reference.to_string(), name.clone());
        let target = target.clone();
        let body = self.schema_expr(&target, &name.clone(), depth)?;
        self.add_rule(name.clone(), body);
        Ok(name)
    }

    fn object_expr(
        &mut self,
        object: &serde_json::Map<String, Value>,
        hint: &str,
        depth: usize,
    ) -> Result<String, GrammarError> {
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
        let additional = object.get("additionalProperties");
        let allow_additional = match additional {
            Some(Value::Bool(false)) => false,
            Some(Value::Bool(true)) => !self.strict,
            Some(_) => true,
            None => !self.strict,
        };
        let additional_value = match additional {
            Some(value @ Value::Object(_)) => {
                self.schema_expr(value, &format!("{}_addl", hint), depth + 1)?
            }
            _ => "basic_any".to_string(),
        };

        let props: Vec<(String, Value, bool)> = properties
            .iter()
            .map(|(name, schema)| (name.clone(), schema.clone(), required.contains(name.as_str())))
            .collect();

        // Key-value fragment per property: "\"name\"<colon>" value.
        let mut kv_exprs = Vec::with_capacity(props.len());
        for (index, (name, schema, _)) in props.iter().enumerate() {
            let value =
                self.schema_expr(schema, &format!("{}_prop_{}", hint, index), depth + 1)?;
            let key_text = format!("\"{}\"{}", json_escape(name), self.colon);
            kv_exprs.push(format!("{} {}", quote(&key_text), value));
        }

        // The rest rule accepts additional members up to the closing brace.
        let rest_rule = if allow_additional {
            let name = self.fresh_rule_name(&format!("{}_rest", hint));
            let body = format!(
                "{} basic_string {} {} {} | {}",
                quote(&self.item_sep(depth)),
                quote(&self.colon),
                additional_value,
                name,
                quote(&self.close_ws(depth)),
            );
            self.add_rule(name.clone(), body);
            Some(name)
        } else {
            None
        };

        // part_i: what may follow after property i has been emitted.
        let mut part_names: Vec<String> = Vec::with_capacity(props.len());
        for index in 0..props.len() {
            part_names.push(self.fresh_rule_name(&format!("{}_part_{}", hint, index)));
        }
        for index in 0..props.len() {
            let mut alternatives = Vec::new();
            let mut required_follows = false;
            for next in index + 1..props.len() {
                alternatives.push(format!(
                    "{} {} {}",
                    quote(&self.item_sep(depth)),
                    kv_exprs[next],
                    part_names[next]
                ));
                if props[next].2 {
                    required_follows = true;
                    break;
                }
            }
            if !required_follows {
                match &rest_rule {
                    Some(rest) => {
                        alternatives.push(format!(
                            "{} basic_string {} {} {}",
                            quote(&self.item_sep(depth)),
                            quote(&self.colon),
                            additional_value,
                            rest
                        ));
                        alternatives.push(quote(&self.close_ws(depth)));
                    }
                    None => alternatives.push(quote(&self.close_ws(depth))),
                }
            }
            self.add_rule(part_names[index].clone(), alternatives.join(" | "));
        }

        // The alternatives directly after the opening brace.
        let mut starts = Vec::new();
        let first_required = props.iter().position(|(_, _, required)| *required);
        let last_start = first_required.unwrap_or(props.len().saturating_sub(1));
        for index in 0..props.len() {
            if index > last_start {
                break;
            }
            starts.push(format!(
                "{} {} {}",
                quote(&self.open_ws(depth)),
                kv_exprs[index],
                part_names[index]
            ));
        }
        if first_required.is_none() {
            if let Some(rest) = &rest_rule {
                starts.push(format!(
                    "{} basic_string {} {} {}",
                    quote(&self.open_ws(depth)),
                    quote(&self.colon),
                    additional_value,
                    rest
                ));
            }
            starts.push("\"\"".to_string());
        }
        Ok(format!("\"{{\" ({}) \"}}\"", starts.join(" | ")))
    }

    fn array_expr(
        &mut self,
        object: &serde_json::Map<String, Value>,
        hint: &str,
        depth: usize,
    ) -> Result<String, GrammarError> {
        let prefix_items = object.get("prefixItems").and_then(Value::as_array);
        let items = object.get("items");
        match prefix_items {
            Some(prefix) if !prefix.is_empty() => {
                let mut elements = Vec::with_capacity(prefix.len());
                for (index, item) in prefix.iter().enumerate() {
                    let expr =
                        self.schema_expr(item, &format!("{}_item_{}", hint, index), depth + 1)?;
                    if index == 0 {
                        elements.push(format!("{} {}", quote(&self.open_ws(depth)), expr));
                    } else {
                        elements.push(format!("{} {}", quote(&self.item_sep(depth)), expr));
                    }
                }
                let tail = match items {
                    Some(Value::Bool(false)) => String::new(),
                    Some(schema) if !matches!(schema, Value::Bool(_)) => {
                        let expr = self.schema_expr(schema, &format!("{}_item", hint), depth + 1)?;
                        format!(" ({} {})*", quote(&self.item_sep(depth)), expr)
                    }
                    _ if self.strict => String::new(),
                    _ => format!(" ({} basic_any)*", quote(&self.item_sep(depth))),
                };
                Ok(format!(
                    "\"[\" {}{} {} \"]\"",
                    elements.join(" "),
                    tail,
                    quote(&self.close_ws(depth))
                ))
            }
            _ => {
                let element = match items {
                    Some(Value::Bool(false)) => return Ok("\"[]\"".to_string()),
                    Some(schema) if !matches!(schema, Value::Bool(_)) => {
                        self.schema_expr(schema, &format!("{}_item", hint), depth + 1)?
                    }
                    _ if self.strict => return Ok("\"[]\"".to_string()),
                    _ => "basic_any".to_string(),
                };
                Ok(format!(
                    "\"[\" (\"\" | {} {} ({} {})* {}) \"]\"",
                    quote(&self.open_ws(depth)),
                    element,
                    quote(&self.item_sep(depth)),
                    element,
                    quote(&self.close_ws(depth))
                ))
            }
        }
    }

    /// Formats a constant JSON value with the configured separators and
    /// indentation at the given depth.
    fn dump_json(&self, value: &Value, depth: usize) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(true) => "true".to_string(),
            Value::Bool(false) => "false".to_string(),
            Value::Number(number) => number.to_string(),
            Value::String(text) => format!("\"{}\"", json_escape(text)),
            Value::Array(items) => {
                if items.is_empty() {
                    return "[]".to_string();
                }
                let parts: Vec<String> =
                    items.iter().map(|item| self.dump_json(item, depth + 1)).collect();
                format!(
                    "[{}{}{}]",
                    self.open_ws(depth),
                    parts.join(&self.item_sep(depth)),
                    self.close_ws(depth)
                )
            }
            Value::Object(members) => {
                if members.is_empty() {
                    return "{}".to_string();
                }
                let parts: Vec<String> = members
                    .iter()
                    .map(|(key, value)| {
                        format!(
                            "\"{}\"{}{}",
                            json_escape(key),
                            self.colon,
                            self.dump_json(value, depth + 1)
                        )
                    })
                    .collect();
                format!(
                    "{{{}{}{}}}",
                    self.open_ws(depth),
                    parts.join(&self.item_sep(depth)),
                    self.close_ws(depth)
                )
            }
        }
    }
}

/// Escapes a string for inclusion inside a JSON string literal.
fn json_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Grammar;

    fn assert_schema_parses(schema: &str, options: &JsonSchemaOptions) -> Grammar {
        let ebnf = json_schema_to_ebnf(schema, options).unwrap();
        Grammar::from_ebnf(&ebnf, "root")
            .unwrap_or_else(|e| panic!("generated EBNF failed to parse: {}\n{}", e, ebnf))
    }

    #[test]
    fn test_primitive_types() {
        let ebnf =
            json_schema_to_ebnf(r#"{"type": "string"}"#, &JsonSchemaOptions::default()).unwrap();
        assert!(ebnf.contains("root ::= basic_string"));
        assert_schema_parses(r#"{"type": "integer"}"#, &JsonSchemaOptions::default());
    }

    #[test]
    fn test_object_with_required() {
        let schema = r#"{
            "type": "object",
            "properties": {"name": {"type": "string"}, "age": {"type": "integer"}},
            "required": ["name", "age"]
        }"#;
        let grammar = assert_schema_parses(schema, &JsonSchemaOptions::default());
        let text = grammar.to_string();
        assert!(text.contains("\\\"name\\\": "), "grammar was: {}", text);
    }

    #[test]
    fn test_enum_and_const() {
        let ebnf = json_schema_to_ebnf(
            r#"{"enum": ["a", 1, null]}"#,
            &JsonSchemaOptions::default(),
        )
        .unwrap();
        assert!(ebnf.contains(r#"("\"a\"" | "1" | "null")"#), "ebnf was: {}", ebnf);
        let ebnf = json_schema_to_ebnf(r#"{"const": true}"#, &JsonSchemaOptions::default()).unwrap();
        assert!(ebnf.contains(r#"root ::= "true""#));
    }

    #[test]
    fn test_ref_resolution() {
        let schema = r##"{
            "type": "object",
            "properties": {"child": {"$ref": "#/$defs/node"}},
            "required": ["child"],
            "$defs": {"node": {"type": "integer"}}
        }"##;
        let grammar = assert_schema_parses(schema, &JsonSchemaOptions::default());
        assert!(grammar.to_string().contains("node"));
    }

    #[test]
    fn test_unsupported_degrades_to_any() {
        let ebnf = json_schema_to_ebnf(
            r#"{"format": "date-time"}"#,
            &JsonSchemaOptions::default(),
        )
        .unwrap();
        assert!(ebnf.contains("root ::= basic_any"));
    }

    #[test]
    fn test_builtin_json_grammar_parses() {
        let grammar = Grammar::builtin_json_grammar();
        assert!(grammar.num_rules() > 5);
    }

    #[test]
    fn test_indent_formatting() {
        let schema = r#"{
            "type": "object",
            "properties": {"a": {"type": "integer"}},
            "required": ["a"]
        }"#;
        let options = JsonSchemaOptions { indent: Some(2), ..Default::default() };
        let ebnf = json_schema_to_ebnf(schema, &options).unwrap();
        assert!(ebnf.contains("\\n"), "expected newline terminals, got: {}", ebnf);
    }
}
