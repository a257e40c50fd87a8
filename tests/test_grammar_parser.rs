//! Tests for the EBNF parser and the grammar printer: structural fidelity,
//! quantifier lowering, printing round trips and exact error positions.
use grammask::{Grammar, GrammarError};

#[test]
fn test_bnf_simple() {
    let before = "root ::= b c\nb ::= \"b\"\nc ::= \"c\"\n";
    let expected = "root ::= ((b c))\nb ::= (\"b\")\nc ::= (\"c\")\n";
    let grammar = Grammar::from_ebnf_no_normalization(before, "root").unwrap();
    assert_eq!(grammar.to_string(), expected);
}

#[test]
fn test_bnf_comment() {
    let before = "# top comment\nroot ::= a b # inline comment\na ::= \"a\"\nb ::= \"b\"\n# bottom\n";
    let expected = "root ::= ((a b))\na ::= (\"a\")\nb ::= (\"b\")\n";
    let grammar = Grammar::from_ebnf_no_normalization(before, "root").unwrap();
    assert_eq!(grammar.to_string(), expected);
}

#[test]
fn test_ebnf_quantifiers() {
    let before = "root ::= b c | b root\nb ::= \"ab\"*\nc ::= [acep-z]+\nd ::= \"d\"?\n";
    let expected = "\
root ::= ((b c) | (b root))
b ::= (b_1)
c ::= (c_1)
d ::= (d_1)
b_1 ::= (\"\" | (\"ab\" b_1))
c_1 ::= (([acep-z] c_1) | [acep-z])
d_1 ::= (\"\" | \"d\")
";
    let grammar = Grammar::from_ebnf_no_normalization(before, "root").unwrap();
    assert_eq!(grammar.to_string(), expected);
}

#[test]
fn test_char_class_star_fast_path() {
    let before = "root ::= [b]* \"x\"\n";
    let expected = "root ::= (([b]* \"x\"))\n";
    let grammar = Grammar::from_ebnf_no_normalization(before, "root").unwrap();
    assert_eq!(grammar.to_string(), expected);
}

#[test]
fn test_char_escapes() {
    let before = r#"root ::= [a-z] "\u0234" [^a] "\?\"" "\xff""#;
    let grammar = Grammar::from_ebnf_no_normalization(before, "root").unwrap();
    assert_eq!(
        grammar.to_string(),
        "root ::= (([a-z] \"\\u0234\" [^a] \"\\?\\\"\" \"\\xff\"))\n"
    );
}

#[test]
fn test_space_and_multiline() {
    let before = "\n\nroot::=\"a\"  \"b\" (\"c\"\"d\"\n\"e\") |\n\n\"f\" | \"g\"\n";
    let grammar = Grammar::from_ebnf(before, "root").unwrap();
    assert_eq!(grammar.to_string(), "root ::= ((\"abcde\") | (\"f\") | (\"g\"))\n");
}

#[test]
fn test_empty_parentheses() {
    let grammar = Grammar::from_ebnf("root ::= \"a\" ( ) \"b\"\n", "root").unwrap();
    assert_eq!(grammar.to_string(), "root ::= ((\"ab\"))\n");
}

#[test]
fn test_repetition_range_lowering() {
    let before = "root ::= a d f g\na ::= [a]{1,2}\nd ::= \"d\" {0,}\nf ::= \"f\" {3}\ng ::= \"g\" {0}\n";
    let expected = "\
root ::= ((a d f g))
a ::= ((\"a\" a_1))
d ::= ((d_1))
f ::= ((\"fff\"))
g ::= (\"\")
a_1 ::= (\"\" | (\"a\"))
d_1 ::= (\"\" | (\"d\" d_1))
";
    let grammar = Grammar::from_ebnf_no_normalization(before, "root").unwrap();
    let grammar = grammask::normalizer::expand_repetitions(&grammar);
    let grammar = grammask::normalizer::structure_normalizer(&grammar);
    let grammar = grammask::normalizer::byte_string_fuser(&grammar);
    assert_eq!(grammar.to_string(), expected);
}

#[test]
fn test_lookahead_roundtrip() {
    let before = "root ::= ((b))\nb ::= ((\"abc\" [a-z])) (=(\"abc\"))\n";
    let grammar_1 = Grammar::from_ebnf(before, "root").unwrap();
    let text_1 = grammar_1.to_string();
    let grammar_2 = Grammar::from_ebnf(&text_1, "root").unwrap();
    assert_eq!(text_1, grammar_2.to_string());
    assert!(text_1.contains("(="));
}

#[test]
fn test_to_string_roundtrip() {
    let before = "\
root ::= ((b c) | (b root))
b ::= ((b_1 d))
c ::= ((c_1))
d ::= ((d_1))
b_1 ::= (\"\" | (\"b\" b_1))
c_1 ::= (([acep-z] c_1) | ([acep-z]))
d_1 ::= (\"\" | (\"d\"))
";
    let grammar_1 = Grammar::from_ebnf(before, "root").unwrap();
    let text_1 = grammar_1.to_string();
    let grammar_2 = Grammar::from_ebnf(&text_1, "root").unwrap();
    let text_2 = grammar_2.to_string();
    assert_eq!(text_1, text_2);
}

#[test]
fn test_tag_dispatch_roundtrip() {
    let before = "root ::= TagDispatch((\"tag1\", rule1), (\"tag2\", rule2))\nrule1 ::= \"a\"\nrule2 ::= \"b\"\n";
    let grammar = Grammar::from_ebnf(before, "root").unwrap();
    let text_1 = grammar.to_string();
    assert!(text_1.starts_with("root ::= TagDispatch((\"tag1\", rule1), (\"tag2\", rule2))\n"));
    let grammar_2 = Grammar::from_ebnf(&text_1, "root").unwrap();
    assert_eq!(text_1, grammar_2.to_string());
}

#[test]
fn test_tag_dispatch_options_roundtrip() {
    let before = "root ::= TagDispatch((\"t\", rule1), stop_eos=false, stop_str=(\"zz\"), loop_after_dispatch=false)\nrule1 ::= \"a\"\n";
    let grammar = Grammar::from_ebnf(before, "root").unwrap();
    let text = grammar.to_string();
    assert!(text.contains("stop_eos=false"));
    assert!(text.contains("stop_str=(\"zz\")"));
    assert!(text.contains("loop_after_dispatch=false"));
    let grammar_2 = Grammar::from_ebnf(&text, "root").unwrap();
    assert_eq!(text, grammar_2.to_string());
}

fn expect_error(text: &str, expected: &str) {
    let err = Grammar::from_ebnf(text, "root").unwrap_err();
    assert_eq!(err.to_string(), expected, "for grammar: {:?}", text);
    assert!(matches!(err, GrammarError::EbnfParse { .. }));
}

#[test]
fn test_errors() {
    expect_error(
        "root ::= a b",
        "EBNF parse error at line 1, column 11: Rule \"a\" is not defined",
    );
    expect_error(
        "root ::= \"a\" |",
        "EBNF parse error at line 1, column 15: Expect element",
    );
    expect_error(
        "root ::= \"a\" \"",
        "EBNF parse error at line 1, column 15: Expect \"",
    );
    expect_error("::= \"a\"", "EBNF parse error at line 1, column 1: Expect rule name");
    expect_error(
        "root ::= [a\n]",
        "EBNF parse error at line 1, column 12: Character class should not contain newline",
    );
    expect_error(
        r#"root ::= "\@""#,
        "EBNF parse error at line 1, column 11: Invalid escape sequence",
    );
    expect_error(
        r#"root ::= "\uFF""#,
        "EBNF parse error at line 1, column 11: Invalid escape sequence",
    );
    expect_error(
        "root ::= [Z-A]",
        "EBNF parse error at line 1, column 14: Invalid character class: lower bound is larger than upper bound",
    );
    expect_error("root := \"a\"", "EBNF parse error at line 1, column 6: Expect ::=");
    expect_error(
        "root ::= \"a\"\nroot ::= \"b\"",
        "EBNF parse error at line 2, column 9: Rule \"root\" is defined multiple times",
    );
    expect_error(
        "a ::= \"a\"",
        "EBNF parse error at line 1, column 10: The root rule with name \"root\" is not found.",
    );
    expect_error(
        "root ::= \"a\" (=\"a\") (=\"b\")",
        "EBNF parse error at line 1, column 21: Unexpected lookahead assertion",
    );
}

#[test]
fn test_consecutive_quantifier_errors() {
    expect_error(
        "root ::= \"a\"{1,3}{1,3}\n",
        "EBNF parse error at line 1, column 18: Expect element, but got character: {",
    );
    expect_error(
        "root ::= \"a\"++\n",
        "EBNF parse error at line 1, column 14: Expect element, but got character: +",
    );
    expect_error(
        "root ::= \"a\"??\n",
        "EBNF parse error at line 1, column 14: Expect element, but got character: ?",
    );
}

#[test]
fn test_tag_dispatch_errors() {
    assert!(Grammar::from_ebnf("root ::= TagDispatch((\"\", rule1))\nrule1 ::= \"a\"\n", "root").is_err());
    assert!(Grammar::from_ebnf("root ::= TagDispatch((\"t\", undefined))\n", "root").is_err());
    assert!(Grammar::from_ebnf("root ::= TagDispatch((\"t\", root))\n", "root").is_err());
    assert!(Grammar::from_ebnf("root ::= TagDispatch(\"t\", rule1)\nrule1 ::= \"a\"\n", "root").is_err());
    assert!(Grammar::from_ebnf(
        "root ::= rule1\nrule1 ::= TagDispatch((\"t\", rule2))\nrule2 ::= \"a\"\n",
        "root"
    )
    .is_err());
}

#[test]
fn test_custom_root_rule_name() {
    let grammar = Grammar::from_ebnf("start ::= \"x\"\n", "start").unwrap();
    assert_eq!(grammar.rule(grammar.root_rule_id()).name(), "start");
}
