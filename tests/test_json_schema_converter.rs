//! JSON Schema conversion: the generated grammar must accept exactly the
//! instances that match the schema, formatted per the options.
mod common;

use grammask::{json_schema_to_ebnf, Grammar, JsonSchemaOptions};

fn schema_grammar(schema: &str, options: &JsonSchemaOptions) -> Grammar {
    Grammar::from_json_schema(schema, options).unwrap()
}

fn schema_accepts(schema: &str, options: &JsonSchemaOptions, instance: &str) -> bool {
    common::grammar_accepts(&schema_grammar(schema, options), instance)
}

#[test]
fn test_primitives() {
    let options = JsonSchemaOptions::default();
    assert!(schema_accepts(r#"{"type": "integer"}"#, &options, "42"));
    assert!(schema_accepts(r#"{"type": "integer"}"#, &options, "-7"));
    assert!(!schema_accepts(r#"{"type": "integer"}"#, &options, "4.5"));
    assert!(schema_accepts(r#"{"type": "number"}"#, &options, "4.5"));
    assert!(schema_accepts(r#"{"type": "number"}"#, &options, "-1e9"));
    assert!(schema_accepts(r#"{"type": "boolean"}"#, &options, "true"));
    assert!(schema_accepts(r#"{"type": "null"}"#, &options, "null"));
    assert!(schema_accepts(r#"{"type": "string"}"#, &options, "\"hi\""));
    assert!(!schema_accepts(r#"{"type": "string"}"#, &options, "hi"));
}

#[test]
fn test_object_required_properties() {
    let schema = r#"{
        "type": "object",
        "properties": {"name": {"type": "string"}, "age": {"type": "integer"}},
        "required": ["name", "age"]
    }"#;
    let options = JsonSchemaOptions::default();
    assert!(schema_accepts(schema, &options, "{\"name\": \"John\", \"age\": 30}"));
    // Properties appear in schema order; reordering is rejected.
    assert!(!schema_accepts(schema, &options, "{\"age\": 30, \"name\": \"John\"}"));
    // Missing required property.
    assert!(!schema_accepts(schema, &options, "{\"name\": \"John\"}"));
    // Exact separators: no space after the comma is rejected.
    assert!(!schema_accepts(schema, &options, "{\"name\": \"John\",\"age\": 30}"));
}

#[test]
fn test_object_optional_properties() {
    let schema = r#"{
        "type": "object",
        "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}, "c": {"type": "integer"}},
        "required": ["b"]
    }"#;
    let options = JsonSchemaOptions::default();
    assert!(schema_accepts(schema, &options, "{\"b\": 1}"));
    assert!(schema_accepts(schema, &options, "{\"a\": 0, \"b\": 1}"));
    assert!(schema_accepts(schema, &options, "{\"b\": 1, \"c\": 2}"));
    assert!(schema_accepts(schema, &options, "{\"a\": 0, \"b\": 1, \"c\": 2}"));
    assert!(!schema_accepts(schema, &options, "{}"));
    assert!(!schema_accepts(schema, &options, "{\"a\": 0}"));
}

#[test]
fn test_strict_mode_rejects_extras() {
    let schema = r#"{
        "type": "object",
        "properties": {"a": {"type": "integer"}},
        "required": ["a"]
    }"#;
    let strict = JsonSchemaOptions::default();
    assert!(!schema_accepts(schema, &strict, "{\"a\": 1, \"extra\": 2}"));
    let lenient = JsonSchemaOptions { strict_mode: false, ..Default::default() };
    assert!(schema_accepts(schema, &lenient, "{\"a\": 1, \"extra\": 2}"));
    assert!(schema_accepts(schema, &lenient, "{\"a\": 1}"));
}

#[test]
fn test_array_items() {
    let schema = r#"{"type": "array", "items": {"type": "integer"}}"#;
    let options = JsonSchemaOptions::default();
    assert!(schema_accepts(schema, &options, "[]"));
    assert!(schema_accepts(schema, &options, "[1]"));
    assert!(schema_accepts(schema, &options, "[1, 2, 3]"));
    assert!(!schema_accepts(schema, &options, "[1, \"x\"]"));
}

#[test]
fn test_prefix_items_tuple() {
    let schema = r#"{
        "type": "array",
        "prefixItems": [{"type": "integer"}, {"type": "string"}],
        "items": false
    }"#;
    let options = JsonSchemaOptions::default();
    assert!(schema_accepts(schema, &options, "[1, \"x\"]"));
    assert!(!schema_accepts(schema, &options, "[1]"));
    assert!(!schema_accepts(schema, &options, "[1, \"x\", 2]"));
}

#[test]
fn test_enum_and_const() {
    let options = JsonSchemaOptions::default();
    let schema = r#"{"enum": ["red", "green", 7]}"#;
    assert!(schema_accepts(schema, &options, "\"red\""));
    assert!(schema_accepts(schema, &options, "7"));
    assert!(!schema_accepts(schema, &options, "\"blue\""));
    let schema = r#"{"const": {"k": 1}}"#;
    assert!(schema_accepts(schema, &options, "{\"k\": 1}"));
    assert!(!schema_accepts(schema, &options, "{\"k\": 2}"));
}

#[test]
fn test_any_of_union() {
    let schema = r#"{"anyOf": [{"type": "integer"}, {"type": "string"}]}"#;
    let options = JsonSchemaOptions::default();
    assert!(schema_accepts(schema, &options, "3"));
    assert!(schema_accepts(schema, &options, "\"s\""));
    assert!(!schema_accepts(schema, &options, "true"));
}

#[test]
fn test_ref_recursion() {
    let schema = r##"{
        "$ref": "#/$defs/node",
        "$defs": {
            "node": {
                "type": "object",
                "properties": {"value": {"type": "integer"}, "next": {"$ref": "#/$defs/node"}},
                "required": ["value"]
            }
        }
    }"##;
    let options = JsonSchemaOptions::default();
    assert!(schema_accepts(schema, &options, "{\"value\": 1}"));
    assert!(schema_accepts(schema, &options, "{\"value\": 1, \"next\": {\"value\": 2}}"));
    assert!(!schema_accepts(schema, &options, "{\"next\": {\"value\": 2}}"));
}

#[test]
fn test_indent_formatting() {
    let schema = r#"{
        "type": "object",
        "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
        "required": ["a", "b"]
    }"#;
    let options = JsonSchemaOptions { indent: Some(2), ..Default::default() };
    assert!(schema_accepts(schema, &options, "{\n  \"a\": 1,\n  \"b\": 2\n}"));
    assert!(!schema_accepts(schema, &options, "{\"a\": 1, \"b\": 2}"));
}

#[test]
fn test_custom_separators() {
    let schema = r#"{
        "type": "object",
        "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
        "required": ["a", "b"]
    }"#;
    let options = JsonSchemaOptions {
        separators: Some((",".to_string(), ":".to_string())),
        ..Default::default()
    };
    assert!(schema_accepts(schema, &options, "{\"a\":1,\"b\":2}"));
    assert!(!schema_accepts(schema, &options, "{\"a\": 1, \"b\": 2}"));
}

#[test]
fn test_unsupported_keywords_fall_back() {
    let ebnf =
        json_schema_to_ebnf(r#"{"format": "uuid"}"#, &JsonSchemaOptions::default()).unwrap();
    assert!(ebnf.contains("root ::= basic_any"));
    // The fallback grammar accepts arbitrary JSON values.
    assert!(schema_accepts(r#"{"format": "uuid"}"#, &JsonSchemaOptions::default(), "[1, {}]"));
}

#[test]
fn test_malformed_schema_is_fatal() {
    assert!(Grammar::from_json_schema("{not json", &JsonSchemaOptions::default()).is_err());
}
