//! Tag-dispatch matcher behavior: free-text scanning, trigger dispatch,
//! stop strings and excludes.
mod common;

use grammask::Grammar;

#[test]
fn test_simple_dispatch() {
    let ebnf = "root ::= TagDispatch((\"tag1\", rule1), (\"tag2\", rule2))\nrule1 ::= \"abcd\"\nrule2 ::= \"efg\"\n";
    let grammar = Grammar::from_ebnf(ebnf, "root").unwrap();
    assert!(common::grammar_accepts(&grammar, "tag1abcd"));
    assert!(common::grammar_accepts(&grammar, "tag1abcdtag2efg"));
    assert!(common::grammar_accepts(&grammar, "tag1abcdqqqqtag2efg"));
    assert!(!common::grammar_accepts(&grammar, "tag1abc"));
    assert!(!common::grammar_accepts(&grammar, "tag1abce"));
}

#[test]
fn test_free_text_only() {
    let ebnf = "root ::= TagDispatch((\"tag1\", rule1))\nrule1 ::= \"a\"\n";
    let grammar = Grammar::from_ebnf(ebnf, "root").unwrap();
    assert!(common::grammar_accepts(&grammar, ""));
    assert!(common::grammar_accepts(&grammar, "no triggers here"));
    // A partial trigger prefix is still plain text at end of generation.
    assert!(common::grammar_accepts(&grammar, "tag"));
}

#[test]
fn test_dispatch_with_complex_rule() {
    let ebnf = "root ::= TagDispatch((\"tag1\", rule1), (\"tag2\", rule2))\nrule1 ::= \"abcd\" [p]*\nrule2 ::= \"efg\" [t]*\n";
    let grammar = Grammar::from_ebnf(ebnf, "root").unwrap();
    assert!(common::grammar_accepts(&grammar, "tag1abcd"));
    assert!(common::grammar_accepts(&grammar, "tag1abcdppppptag2efg"));
    assert!(common::grammar_accepts(&grammar, "tag2efgtttttag1abcd"));
}

#[test]
fn test_stop_string_ends_dispatch() {
    let ebnf = "root ::= TagDispatch((\"t\", rule1), stop_eos=false, stop_str=(\"zz\"))\nrule1 ::= \"a\"\n";
    let grammar = Grammar::from_ebnf(ebnf, "root").unwrap();
    assert!(common::grammar_accepts(&grammar, "zz"));
    assert!(common::grammar_accepts(&grammar, "free zz"));
    assert!(common::grammar_accepts(&grammar, "tazz"));
    // Without the stop string the section never completes.
    assert!(!common::grammar_accepts(&grammar, "free"));
}

#[test]
fn test_excludes_kill_free_text() {
    let ebnf = "root ::= TagDispatch((\"tag\", rule1), excludes=(\"bad\"))\nrule1 ::= \"x\"\n";
    let grammar = Grammar::from_ebnf(ebnf, "root").unwrap();
    assert!(common::grammar_accepts(&grammar, "good text"));
    assert!(common::grammar_accepts(&grammar, "tagx"));
    assert!(!common::grammar_accepts(&grammar, "some bad text"));
    assert!(!common::grammar_accepts(&grammar, "bad"));
}

#[test]
fn test_loop_after_dispatch_false() {
    let ebnf = "root ::= TagDispatch((\"t\", rule1), loop_after_dispatch=false)\nrule1 ::= \"ag\"\n";
    let grammar = Grammar::from_ebnf(ebnf, "root").unwrap();
    assert!(common::grammar_accepts(&grammar, "tag"));
    assert!(common::grammar_accepts(&grammar, "free tag"));
    // After the first dispatched tag completes, the section is over.
    assert!(!common::grammar_accepts(&grammar, "tagtag"));
    assert!(!common::grammar_accepts(&grammar, "tag more"));
}

#[test]
fn test_overlapping_trigger_scan() {
    // The scanner must keep partial trigger progress across restarts.
    let ebnf = "root ::= TagDispatch((\"aab\", rule1))\nrule1 ::= \"!\"\n";
    let grammar = Grammar::from_ebnf(ebnf, "root").unwrap();
    assert!(common::grammar_accepts(&grammar, "aaab!"));
    assert!(common::grammar_accepts(&grammar, "xxaab!"));
}

#[test]
fn test_jump_forward_empty_in_free_text() {
    let ebnf = "root ::= TagDispatch((\"tag\", rule1))\nrule1 ::= \"x\"\n";
    let grammar = Grammar::from_ebnf(ebnf, "root").unwrap();
    let matcher = common::matcher_for(&grammar);
    // Free text forces nothing.
    assert_eq!(matcher.find_jump_forward_string(), Vec::<u8>::new());
}
