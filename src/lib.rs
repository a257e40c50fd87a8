/*!
# Grammask

This crate provides a grammar-constrained decoding engine: it compiles a
formal grammar together with a tokenizer's decoded vocabulary into an
immutable artifact, then produces, at every decoding step, a packed **token
bitmask** with one bit per vocabulary entry marking the grammatically
admissible next tokens. The per-step cost is dominated by the vocabulary
size rather than by grammar interpretation, because admissibility is largely
precomputed into an adaptive per-position token-mask cache.

Grammars can be written in EBNF or derived from JSON Schemas, regular
expressions and structural tags (declarative schemas for function-calling
outputs). Here is a quick example of how this crate works:

```rust
use std::sync::Arc;
use grammask::{
    CompilerOptions, GrammarCompiler, GrammarMatcher, MatcherOptions, TokenBitmask,
    TokenizerInfo, VocabType,
};

let tokenizer = Arc::new(
    TokenizerInfo::new(&["a", "b", "c", "</s>"], VocabType::RAW, None, Some(&[3]), false)
        .unwrap(),
);
let compiler = GrammarCompiler::new(tokenizer, &CompilerOptions::default());
let compiled = compiler.compile_ebnf("root ::= \"ab\"\n").unwrap();
let mut matcher = GrammarMatcher::new(compiled, &MatcherOptions::default());
let mut bitmask = TokenBitmask::new(1, 4);

matcher.fill_next_token_bitmask(&mut bitmask, 0).unwrap();
assert!(bitmask.is_allowed(0, 0).unwrap()); // "a" may come next
assert!(!bitmask.is_allowed(0, 1).unwrap()); // "b" may not
assert!(matcher.accept_token(0).unwrap());

matcher.fill_next_token_bitmask(&mut bitmask, 0).unwrap();
assert!(bitmask.is_allowed(0, 1).unwrap());
assert!(matcher.accept_token(1).unwrap());

// The grammar is fully matched; only the stop token remains admissible.
matcher.fill_next_token_bitmask(&mut bitmask, 0).unwrap();
assert_eq!(bitmask.masked_token_ids(0).unwrap(), vec![0, 1, 2]);
assert!(matcher.accept_token(3).unwrap());
assert!(matcher.is_terminated());
```

# Overview

The pipeline has a compile phase and a decode phase:

- [`Grammar`] is the intermediate representation: front ends lower EBNF text
  ([`Grammar::from_ebnf`]), JSON Schemas ([`Grammar::from_json_schema`]),
  regexes ([`Grammar::from_regex`]) and structural tags
  ([`Grammar::from_structural_tag`]) into it, and a normalizer pipeline
  brings every rule into a canonical choice-of-sequences form.
- [`GrammarCompiler`] combines a grammar with a [`TokenizerInfo`] (the
  decoded vocabulary plus stop/special token metadata) into a
  [`CompiledGrammar`]. Compilation precomputes, for every grammar position,
  which tokens are always accepted, always rejected or need runtime
  verification. Artifacts are cached per grammar and may be shared across
  threads.
- [`GrammarMatcher`] is the per-request state: a non-deterministic pushdown
  automaton that accepts committed tokens, fills the next-token bitmask,
  rolls back within a bounded history, extracts jump-forward strings and
  handles tag-dispatch free-text scanning.

Masks are applied to logits with [`apply_token_bitmask_inplace`], which
overwrites masked positions with `-inf`:

```rust
use std::sync::Arc;
use grammask::{
    apply_token_bitmask_inplace, CompilerOptions, GrammarCompiler, GrammarMatcher,
    MatcherOptions, TokenBitmask, TokenizerInfo, VocabType,
};

let tokenizer = Arc::new(
    TokenizerInfo::new(&["x", "y"], VocabType::RAW, None, Some(&[]), false).unwrap(),
);
let compiler = GrammarCompiler::new(tokenizer, &CompilerOptions::default());
let compiled = compiler.compile_ebnf("root ::= \"x\"\n").unwrap();
let matcher = GrammarMatcher::new(compiled, &MatcherOptions::default());
let mut bitmask = TokenBitmask::new(1, 2);
matcher.fill_next_token_bitmask(&mut bitmask, 0).unwrap();
let mut logits = [0.5f32, 0.25];
apply_token_bitmask_inplace(&mut logits, &bitmask, 0).unwrap();
assert_eq!(logits, [0.5, f32::NEG_INFINITY]);
```

# EBNF syntax

Grammars use a W3C-style EBNF notation with one rule per line and `root` as
the default root rule:

```text
root  ::= greet name "!"          # concatenation and rule references
greet ::= "Hello, " | "Hi, "      # alternation
name  ::= [A-Z] [a-z]*            # character classes and quantifiers
```

Supported extensions: `#` line comments; escapes `\n \t \r \xHH \uXXXX
\UXXXXXXXX`; negated classes `[^...]`; quantifiers `*`, `+`, `?` and bounded
repetition `{m,n}`, `{m,}`, `{n}`; grouping `(...)`; a trailing lookahead
assertion `(=...)`; and the `TagDispatch(("trigger", rule), ...)` terminal,
which scans free text until a trigger prefix appears and then dispatches
into the mapped rule — the construct behind function-call constraining.

Printing a [`Grammar`] with `Display` serializes it back to EBNF text;
parsing and reprinting that text reproduces it byte for byte.

# Concurrency

[`CompiledGrammar`] and [`TokenizerInfo`] are immutable and freely shared.
A [`GrammarMatcher`] owns mutable state and belongs to one generation
stream. The compiler parallelizes mask-cache construction over an internal
bounded thread pool (`max_threads`, default 8) and deduplicates concurrent
compilations of the same grammar.

# Performance

The central space-time tradeoff is the adaptive mask representation: each
cached position stores the smaller of its accepted/rejected token id lists
plus a small uncertain list that the matcher verifies against the live stack
at runtime. Grammars with little ambiguity (JSON Schemas, regexes) verify a
handful of tokens per step; heavily ambiguous grammars fall back to more
verification work. Reuse one [`GrammarCompiler`] per tokenizer so repeated
compilations hit the artifact cache.
*/
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod bitmask;
pub mod compiler;
mod ebnf;
pub mod grammar;
pub mod json_schema;
pub mod matcher;
pub mod normalizer;
mod regex;
pub mod serialize;
pub mod structural_tag;
pub mod tokenizer_info;
mod utils;

pub use bitmask::{apply_token_bitmask_inplace, BitmaskError, TokenBitmask};
pub use compiler::{CompiledGrammar, CompilerOptions, GrammarCompiler};
pub use grammar::{Grammar, GrammarError};
pub use json_schema::{json_schema_to_ebnf, JsonSchemaOptions};
pub use matcher::{GrammarMatcher, MatcherError, MatcherOptions};
pub use serialize::SerializationError;
pub use structural_tag::{
    builtin_structural_tag_template, expand_template, StructuralTag, StructuralTagError,
};
pub use tokenizer_info::{TokenizerInfo, VocabType};
