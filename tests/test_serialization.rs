//! JSON serialization round trips for grammars, tokenizer info and
//! compiled artifacts, plus version checking.
mod common;

use std::sync::Arc;

use grammask::{
    CompilerOptions, Grammar, GrammarCompiler, GrammarMatcher, MatcherOptions,
    SerializationError, TokenBitmask, TokenizerInfo, VocabType,
};

fn sample_grammar() -> Grammar {
    Grammar::from_ebnf("rule1 ::= ([^0-9] rule1) | \"\"\nroot_rule ::= rule1 \"a\"\n", "root_rule")
        .unwrap()
}

#[test]
fn test_grammar_serialization_shape() {
    let serialized = sample_grammar().serialize_json();
    assert!(serialized.starts_with("{\"rules_\":"));
    assert!(serialized.contains("\"grammar_expr_data_\":{\"data_\":["));
    assert!(serialized.contains("\"indptr_\":["));
    assert!(serialized.contains("\"root_rule_id_\":"));
    assert!(serialized.contains("\"root_tag_dispatch_fsm\":null"));
    assert!(serialized.contains("\"tag_dispatch_end_node_to_rule_id\":[]"));
    assert!(serialized.ends_with("\"__VERSION__\":\"v2\"}"));
}

#[test]
fn test_grammar_roundtrip() {
    let grammar = sample_grammar();
    let serialized = grammar.serialize_json();
    let recovered = Grammar::deserialize_json(&serialized).unwrap();
    assert_eq!(serialized, recovered.serialize_json());
    assert_eq!(grammar.to_string(), recovered.to_string());
}

#[test]
fn test_tag_dispatch_grammar_roundtrip() {
    let grammar = Grammar::from_ebnf(
        "root ::= TagDispatch((\"tag1\", rule1))\nrule1 ::= \"a\"\n",
        "root",
    )
    .unwrap();
    let serialized = grammar.serialize_json();
    assert!(serialized.contains("\"root_tag_dispatch_fsm\":{"));
    assert!(!serialized.contains("\"tag_dispatch_end_node_to_rule_id\":[]"));
    let recovered = Grammar::deserialize_json(&serialized).unwrap();
    assert_eq!(serialized, recovered.serialize_json());
    assert!(common::grammar_accepts(&recovered, "xxtag1a"));
}

#[test]
fn test_grammar_version_error() {
    let serialized = sample_grammar().serialize_json().replace("\"v2\"", "\"v1\"");
    let err = Grammar::deserialize_json(&serialized).unwrap_err();
    assert!(matches!(err, SerializationError::VersionMismatch(version) if version == "v1"));
}

#[test]
fn test_grammar_missing_field_error() {
    let err = Grammar::deserialize_json("{\"rules_\":[],\"__VERSION__\":\"v2\"}").unwrap_err();
    assert!(matches!(err, SerializationError::Malformed(_)));
}

#[test]
fn test_tokenizer_info_serialization_shape() {
    let info = TokenizerInfo::new(
        &["1", "212", "a", "A"],
        VocabType::BYTE_FALLBACK,
        Some(6),
        Some(&[0, 1]),
        true,
    )
    .unwrap();
    let serialized = info.serialize_json();
    assert_eq!(
        serialized,
        "{\"vocab_type\":1,\"vocab_size\":6,\"add_prefix_space\":true,\
         \"stop_token_ids\":[0,1],\"special_token_ids\":[4,5],\"__VERSION__\":\"v2\"}"
    );
}

#[test]
fn test_tokenizer_info_roundtrip() {
    let vocab = ["1", "212", "a", "A"];
    let info =
        TokenizerInfo::new(&vocab, VocabType::RAW, Some(6), Some(&[0]), false).unwrap();
    let serialized = info.serialize_json();
    let recovered = TokenizerInfo::deserialize_json(&serialized, &vocab).unwrap();
    assert_eq!(serialized, recovered.serialize_json());
    assert_eq!(info.decoded_vocab(), recovered.decoded_vocab());
    assert_eq!(info.stop_token_ids(), recovered.stop_token_ids());
}

#[test]
fn test_tokenizer_info_version_error() {
    let info = TokenizerInfo::new(&["a"], VocabType::RAW, None, Some(&[]), false).unwrap();
    let serialized = info.serialize_json().replace("\"v2\"", "\"v0\"");
    let err = TokenizerInfo::deserialize_json(&serialized, &["a"]).unwrap_err();
    assert!(matches!(err, SerializationError::VersionMismatch(_)));
}

#[test]
fn test_compiled_grammar_roundtrip() {
    let tokenizer = common::tokenizer(&["a", "b", "ab", "c"], &[3]);
    let compiler = GrammarCompiler::new(Arc::clone(&tokenizer), &CompilerOptions::default());
    let compiled = compiler.compile_ebnf("root ::= \"ab\" [a-c]\n").unwrap();
    let serialized = compiled.serialize_json();
    assert!(serialized.contains("\"adaptive_token_mask_cache\":["));
    let recovered =
        grammask::CompiledGrammar::deserialize_json(&serialized, Arc::clone(&tokenizer)).unwrap();
    assert_eq!(serialized, recovered.serialize_json());

    // The recovered artifact is functionally identical.
    let matcher_a = GrammarMatcher::new(compiled, &MatcherOptions::default());
    let matcher_b = GrammarMatcher::new(Arc::new(recovered), &MatcherOptions::default());
    let mut mask_a = TokenBitmask::new(1, tokenizer.vocab_size());
    let mut mask_b = TokenBitmask::new(1, tokenizer.vocab_size());
    matcher_a.fill_next_token_bitmask(&mut mask_a, 0).unwrap();
    matcher_b.fill_next_token_bitmask(&mut mask_b, 0).unwrap();
    assert_eq!(mask_a, mask_b);
}

#[test]
fn test_compiled_grammar_tokenizer_mismatch() {
    let tokenizer = common::tokenizer(&["a", "b"], &[]);
    let compiler = GrammarCompiler::new(tokenizer, &CompilerOptions::default());
    let compiled = compiler.compile_ebnf("root ::= \"a\"\n").unwrap();
    let serialized = compiled.serialize_json();
    let other = common::tokenizer(&["a", "b", "c", "d"], &[]);
    let err = grammask::CompiledGrammar::deserialize_json(&serialized, other).unwrap_err();
    assert!(matches!(err, SerializationError::Malformed(_)));
}

#[test]
fn test_compile_determinism() {
    // Two compilations of the same inputs produce byte-equal artifacts.
    let tokenizer = common::tokenizer(&["a", "b", "ab", "ba"], &[]);
    let compiler = GrammarCompiler::new(
        tokenizer,
        &CompilerOptions { cache_enabled: false, max_threads: 4 },
    );
    let first = compiler.compile_ebnf("root ::= (\"a\" | \"b\")* \"ab\"\n").unwrap();
    let second = compiler.compile_ebnf("root ::= (\"a\" | \"b\")* \"ab\"\n").unwrap();
    assert_eq!(first.serialize_json(), second.serialize_json());
}

#[test]
fn test_normalize_idempotence_via_serialization() {
    let grammar = Grammar::from_ebnf(
        "root ::= (\"a\" | [b-d]){1,3} rest\nrest ::= \"z\"? [x-y]*\n",
        "root",
    )
    .unwrap();
    let renormalized = grammask::normalizer::normalize(&grammar);
    assert_eq!(grammar.serialize_json(), renormalized.serialize_json());
}
