//! Tokenizer info: vocabulary decoding, special/stop token handling and
//! metadata round trips.
use grammask::{TokenizerInfo, VocabType};

#[test]
fn test_raw_vocab() {
    let info = TokenizerInfo::new(&["a", "bc", "d"], VocabType::RAW, None, Some(&[2]), false)
        .unwrap();
    assert_eq!(info.vocab_size(), 3);
    assert_eq!(info.vocab_type(), VocabType::RAW);
    assert_eq!(info.token_bytes(0), Some(&b"a"[..]));
    assert_eq!(info.token_bytes(1), Some(&b"bc"[..]));
    assert_eq!(info.token_bytes(3), None);
    assert_eq!(info.stop_token_ids(), &[2]);
}

#[test]
fn test_byte_fallback_decoding() {
    let info = TokenizerInfo::new(
        &["<0x1B>", "\u{2581}apple", "plain", "<0xFF>"],
        VocabType::BYTE_FALLBACK,
        None,
        Some(&[]),
        true,
    )
    .unwrap();
    assert_eq!(info.token_bytes(0), Some(&[0x1Bu8][..]));
    assert_eq!(info.token_bytes(1), Some(&b" apple"[..]));
    assert_eq!(info.token_bytes(2), Some(&b"plain"[..]));
    assert_eq!(info.token_bytes(3), Some(&[0xFFu8][..]));
    assert!(info.add_prefix_space());
}

#[test]
fn test_byte_level_decoding() {
    // In GPT-2 byte-level vocabularies "Ġ" (U+0120) encodes a space and
    // "Ċ" (U+010A) a newline.
    let info = TokenizerInfo::new(
        &["\u{0120}the", "\u{010A}", "ab"],
        VocabType::BYTE_LEVEL,
        None,
        Some(&[]),
        false,
    )
    .unwrap();
    assert_eq!(info.token_bytes(0), Some(&b" the"[..]));
    assert_eq!(info.token_bytes(1), Some(&b"\n"[..]));
    assert_eq!(info.token_bytes(2), Some(&b"ab"[..]));
}

#[test]
fn test_special_token_detection() {
    let info = TokenizerInfo::new(
        &["<|endoftext|>", "<s>", "</s>", "[PAD]", "plain", "<not special!>"],
        VocabType::RAW,
        None,
        Some(&[0]),
        false,
    )
    .unwrap();
    assert_eq!(info.special_token_ids(), &[0, 1, 2, 3]);
}

#[test]
fn test_stop_token_detection() {
    let info =
        TokenizerInfo::new(&["a", "</s>", "b"], VocabType::RAW, None, None, false).unwrap();
    assert_eq!(info.stop_token_ids(), &[1]);
}

#[test]
fn test_padded_vocab() {
    let info = TokenizerInfo::new(&["a", "b"], VocabType::RAW, Some(5), Some(&[]), false)
        .unwrap();
    assert_eq!(info.vocab_size(), 5);
    assert_eq!(info.special_token_ids(), &[2, 3, 4]);
    assert_eq!(info.token_bytes(4), Some(&b""[..]));
}

#[test]
fn test_metadata_roundtrip() {
    let vocab = ["x", "y", "</s>"];
    let info = TokenizerInfo::new(&vocab, VocabType::RAW, None, None, true).unwrap();
    let metadata = info.dump_metadata();
    assert!(metadata.contains("\"vocab_type\":0"));
    let recovered = TokenizerInfo::from_vocab_and_metadata(&vocab, &metadata).unwrap();
    assert_eq!(recovered.vocab_size(), info.vocab_size());
    assert_eq!(recovered.add_prefix_space(), info.add_prefix_space());
    assert_eq!(recovered.stop_token_ids(), info.stop_token_ids());
    assert_eq!(recovered.decoded_vocab(), info.decoded_vocab());
}

#[test]
fn test_vocabulary_too_large() {
    assert!(TokenizerInfo::new(&["a"], VocabType::RAW, Some(0x2000000), Some(&[]), false)
        .is_err());
}
