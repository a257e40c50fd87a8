//! Regex conversion: supported subset semantics and rejection of
//! unsupported features.
mod common;

use grammask::Grammar;

fn regex_accepts(pattern: &str, input: &str) -> bool {
    let grammar = Grammar::from_regex(pattern).unwrap();
    common::grammar_accepts(&grammar, input)
}

#[test]
fn test_basic_literal() {
    assert!(regex_accepts("123", "123"));
    assert!(!regex_accepts("123", "1234"));
    assert!(!regex_accepts("123", "12"));
}

#[test]
fn test_unicode_literal() {
    assert!(regex_accepts("w\u{00e9}\u{4e2d}", "w\u{00e9}\u{4e2d}"));
    assert!(!regex_accepts("w\u{00e9}\u{4e2d}", "we\u{4e2d}"));
}

#[test]
fn test_escapes() {
    assert!(regex_accepts(r"\u{20BB7}\u0300\x1F\cJ", "\u{20BB7}\u{0300}\u{001F}\n"));
    assert!(regex_accepts(r"[\r\n]", "\n"));
    assert!(regex_accepts(r"\.\*\+", ".*+"));
}

#[test]
fn test_char_classes() {
    assert!(regex_accepts(r"[a-c]", "b"));
    assert!(!regex_accepts(r"[a-c]", "d"));
    assert!(regex_accepts(r"[^a-c]", "d"));
    assert!(!regex_accepts(r"[^a-c]", "b"));
    assert!(regex_accepts(r"\d\d", "42"));
    assert!(!regex_accepts(r"\d\d", "4a"));
    assert!(regex_accepts(r"\w+", "ab_1"));
    assert!(regex_accepts(r"\s", " "));
    assert!(regex_accepts(r"\D", "x"));
    assert!(!regex_accepts(r"\D", "5"));
}

#[test]
fn test_dot() {
    assert!(regex_accepts("a.c", "abc"));
    assert!(regex_accepts("a.c", "a\u{00e9}c"));
    assert!(!regex_accepts("a.c", "a\nc"));
}

#[test]
fn test_quantifiers_and_groups() {
    assert!(regex_accepts("a*b+c?", "b"));
    assert!(regex_accepts("a*b+c?", "aaabbc"));
    assert!(!regex_accepts("a*b+c?", "aaa"));
    assert!(regex_accepts("(ab)+", "ababab"));
    assert!(!regex_accepts("(ab)+", "aba"));
    assert!(regex_accepts("a|bc|d", "bc"));
}

#[test]
fn test_lazy_quantifiers_match_same_language() {
    assert!(regex_accepts("a+?b", "aab"));
    assert!(regex_accepts("a*?b", "b"));
}

#[test]
fn test_anchors_at_edges() {
    assert!(regex_accepts("^abc$", "abc"));
    assert!(Grammar::from_regex("a^b").is_err());
    assert!(Grammar::from_regex("a$b").is_err());
}

#[test]
fn test_ipv4() {
    let pattern = r"((25[0-5]|2[0-4]\d|[01]?\d\d?).)((25[0-5]|2[0-4]\d|[01]?\d\d?).)((25[0-5]|2[0-4]\d|[01]?\d\d?).)(25[0-5]|2[0-4]\d|[01]?\d\d?)";
    assert!(regex_accepts(pattern, "123.45.67.89"));
    assert!(regex_accepts(pattern, "255.0.1.254"));
    assert!(!regex_accepts(pattern, "123.45.67"));
    assert!(!regex_accepts(pattern, "256a45a67a89"));
}

#[test]
fn test_unsupported_features_are_fatal() {
    assert!(Grammar::from_regex(r"(a)\1").is_err());
    assert!(Grammar::from_regex(r"(?:ab)").is_err());
    assert!(Grammar::from_regex(r"(?=ab)").is_err());
    assert!(Grammar::from_regex(r"(?<name>ab)").is_err());
    assert!(Grammar::from_regex(r"\p{Letter}").is_err());
    assert!(Grammar::from_regex(r"a\b").is_err());
    assert!(Grammar::from_regex(r"a\B").is_err());
    assert!(Grammar::from_regex(r"a{2,5}").is_err());
}
