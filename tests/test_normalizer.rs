//! Individual normalizer passes against pinned outputs, plus pipeline
//! idempotence.
use grammask::normalizer::{
    byte_string_fuser, dead_code_eliminator, normalize, rule_inliner, structure_normalizer,
};
use grammask::Grammar;

fn parse(text: &str) -> Grammar {
    Grammar::from_ebnf_no_normalization(text, "root").unwrap()
}

#[test]
fn test_flatten() {
    let before = "\
root ::= or_test sequence_test
or_test ::= ([a] | \"b\") | \"de\" | \"\" | or_test
sequence_test ::= [a] \"a\" (\"b\" (\"c\" | \"d\")) sequence_test \"\"
";
    let expected = "\
root ::= ((or_test sequence_test))
or_test ::= (\"\" | (\"a\") | (\"b\") | (\"de\") | (or_test))
sequence_test ::= ((\"aab\" sequence_test_choice sequence_test))
sequence_test_choice ::= ((\"c\") | (\"d\"))
";
    let grammar = byte_string_fuser(&structure_normalizer(&parse(before)));
    assert_eq!(grammar.to_string(), expected);
}

#[test]
fn test_nested_groups_collapse() {
    let before = "root ::= (\"a\" (\"b\" (\"c\" \"d\"))) | (\"e\" | (\"f\"))\n";
    let expected = "root ::= ((\"abcd\") | (\"e\") | (\"f\"))\n";
    let grammar = byte_string_fuser(&structure_normalizer(&parse(before)));
    assert_eq!(grammar.to_string(), expected);
}

#[test]
fn test_star_quantifier_forms() {
    let before = "root ::= b c rule1\nb ::= [b]*\nc ::= \"b\"*\nrule1 ::= [abc]* [def]*\n";
    let expected = "\
root ::= ((b c rule1))
b ::= (([b]*))
c ::= ((c_1))
rule1 ::= (([a-c]* [d-f]*))
c_1 ::= (\"\" | (\"b\" c_1))
";
    let grammar = byte_string_fuser(&structure_normalizer(&parse(before)));
    assert_eq!(grammar.to_string(), expected);
}

#[test]
fn test_rule_inliner() {
    let before = "root ::= rule1 | rule2\nrule1 ::= \"a\" | \"b\"\nrule2 ::= \"b\" | \"c\"\n";
    let expected = "\
root ::= ((\"a\") | (\"b\") | (\"b\") | (\"c\"))
rule1 ::= ((\"a\") | (\"b\"))
rule2 ::= ((\"b\") | (\"c\"))
";
    let grammar = rule_inliner(&parse(before));
    assert_eq!(grammar.to_string(), expected);
}

#[test]
fn test_rule_inliner_with_suffix() {
    let before = "root ::= rule1 \"a\" [a-z]* | rule2 \"b\" \"c\"\nrule1 ::= \"a\" [a-z]* | \"b\"\nrule2 ::= \"b\" | \"c\" [b-c]\n";
    let expected = "\
root ::= ((\"a\" [a-z]* \"a\" [a-z]*) | (\"ba\" [a-z]*) | (\"bbc\") | (\"c\" [b-c] \"bc\"))
rule1 ::= ((\"a\" [a-z]*) | (\"b\"))
rule2 ::= ((\"b\") | (\"c\" [b-c]))
";
    let grammar = rule_inliner(&byte_string_fuser(&structure_normalizer(&parse(before))));
    assert_eq!(grammar.to_string(), expected);
}

#[test]
fn test_dead_code_eliminator() {
    let before = "\
root ::= rule1 | rule2
unused1 ::= unused2 | \"x\"
unused2 ::= unused1 | \"y\"
rule1 ::= \"a\" rule2 | \"b\"
rule2 ::= \"c\" rule1 | \"d\"
";
    let expected = "\
root ::= ((rule1) | (rule2))
rule1 ::= ((\"a\" rule2) | (\"b\"))
rule2 ::= ((\"c\" rule1) | (\"d\"))
";
    let grammar = dead_code_eliminator(&structure_normalizer(&parse(before)));
    assert_eq!(grammar.to_string(), expected);
}

#[test]
fn test_allow_empty_analysis() {
    let grammar = normalize(&parse(
        "root ::= a b\na ::= \"x\" | \"\"\nb ::= [y]* c\nc ::= \"z\"\n",
    ));
    let names: Vec<String> = grammar
        .allow_empty_rule_ids()
        .iter()
        .map(|&id| grammar.rule(grammask::grammar::RuleId(id)).name().to_string())
        .collect();
    assert_eq!(names, vec!["a".to_string()]);
}

#[test]
fn test_pipeline_idempotence() {
    let inputs = [
        "root ::= (\"a\" | \"b\")* \"c\"{2,4} rest\nrest ::= [x-z]+ | \"\"\n",
        "root ::= TagDispatch((\"t1\", r1), (\"t2\", r2))\nr1 ::= \"a\" [b]* \nr2 ::= \"c\"?\n",
        "root ::= inner | \"q\"\ninner ::= \"x\" (\"y\" | \"z\" \"w\")\n",
    ];
    for input in inputs {
        let once = normalize(&parse(input));
        let twice = normalize(&once);
        assert_eq!(once.serialize_json(), twice.serialize_json(), "for input: {}", input);
    }
}
