//! Shared helpers for the integration tests.
#![allow(dead_code)]
use std::sync::Arc;

use grammask::{
    CompilerOptions, Grammar, GrammarCompiler, GrammarMatcher, MatcherOptions, TokenizerInfo,
    VocabType,
};

/// A tokenizer info over a plain string vocabulary.
pub fn tokenizer(vocab: &[&str], stop_token_ids: &[i32]) -> Arc<TokenizerInfo> {
    Arc::new(
        TokenizerInfo::new(vocab, VocabType::RAW, None, Some(stop_token_ids), false).unwrap(),
    )
}

/// A tokenizer info with no vocabulary, for byte-level matching tests.
pub fn empty_tokenizer() -> Arc<TokenizerInfo> {
    Arc::new(TokenizerInfo::new::<&str>(&[], VocabType::RAW, None, Some(&[]), false).unwrap())
}

/// A matcher over the given grammar that terminates without a stop token.
pub fn matcher_for(grammar: &Grammar) -> GrammarMatcher {
    let compiler = GrammarCompiler::new(
        empty_tokenizer(),
        &CompilerOptions { cache_enabled: false, ..Default::default() },
    );
    let compiled = compiler.compile_grammar(grammar);
    GrammarMatcher::new(
        compiled,
        &MatcherOptions { terminate_without_stop_token: true, ..Default::default() },
    )
}

/// Whether the grammar accepts `input` as a complete string.
pub fn grammar_accepts(grammar: &Grammar, input: &str) -> bool {
    let mut matcher = matcher_for(grammar);
    if !matcher.accept_string(input.as_bytes()).unwrap() {
        return false;
    }
    matcher.is_terminated()
}

/// Whether the EBNF grammar accepts `input` as a complete string.
pub fn ebnf_accepts(ebnf: &str, input: &str) -> bool {
    let grammar = Grammar::from_ebnf(ebnf, "root").unwrap();
    grammar_accepts(&grammar, input)
}
