use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use grammask::{
    CompilerOptions, GrammarCompiler, GrammarMatcher, MatcherOptions, TokenBitmask,
    TokenizerInfo, VocabType,
};

/// A synthetic vocabulary with JSON-ish structure tokens plus two-letter
/// word fragments, roughly a thousand entries.
fn build_tokenizer() -> Arc<TokenizerInfo> {
    let mut vocab: Vec<String> = Vec::new();
    for piece in [
        "{", "}", "[", "]", ":", ",", "\"", " ", "\n", "true", "false", "null", "\": ", "\", ",
    ] {
        vocab.push(piece.to_string());
    }
    for digit in 0..10 {
        vocab.push(digit.to_string());
    }
    for first in b'a'..=b'z' {
        for second in b'a'..=b'z' {
            vocab.push(format!("{}{}", first as char, second as char));
        }
    }
    Arc::new(TokenizerInfo::new(&vocab, VocabType::RAW, None, Some(&[]), false).unwrap())
}

fn bench_json(c: &mut Criterion) {
    let tokenizer = build_tokenizer();
    let compiler = GrammarCompiler::new(Arc::clone(&tokenizer), &CompilerOptions::default());
    let compiled = compiler.compile_builtin_json_grammar();

    c.bench_function("fill_next_token_bitmask/json", |b| {
        let matcher = GrammarMatcher::new(Arc::clone(&compiled), &MatcherOptions::default());
        let mut bitmask = TokenBitmask::new(1, tokenizer.vocab_size());
        b.iter(|| {
            matcher.fill_next_token_bitmask(&mut bitmask, 0).unwrap();
        });
    });

    c.bench_function("accept_string/json", |b| {
        b.iter(|| {
            let mut matcher = GrammarMatcher::new(
                Arc::clone(&compiled),
                &MatcherOptions { terminate_without_stop_token: true, ..Default::default() },
            );
            assert!(matcher
                .accept_string(b"{\"name\": \"John\", \"values\": [1, 2, 3], \"ok\": true}")
                .unwrap());
        });
    });

    c.bench_function("compile/json_schema", |b| {
        let schema = r#"{
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "integer"},
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["name", "age"]
        }"#;
        b.iter(|| {
            let compiler = GrammarCompiler::new(
                Arc::clone(&tokenizer),
                &CompilerOptions { cache_enabled: false, ..Default::default() },
            );
            compiler.compile_json_schema(schema, &Default::default()).unwrap();
        });
    });
}

criterion_group!(benches, bench_json);
criterion_main!(benches);
