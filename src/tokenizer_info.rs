//! Tokenizer metadata consumed by the grammar compiler: the decoded
//! vocabulary, stop and special token ids, and the vocabulary encoding type.
//!
//! The decoded vocabulary maps every token id to the byte string the token
//! contributes to the generated text. Tokenizers encode tokens in different
//! ways (`<0x1B>` in byte-fallback vocabularies, `Ġ` for a space in
//! byte-level BPE vocabularies); this module reverses those encodings once,
//! up front, so the rest of the crate only ever sees raw bytes.
use std::sync::OnceLock;

use ahash::AHashMap;
use fixedbitset_stack::FixedBitSet;
use serde::{Deserialize, Serialize};

/// The type of the vocabulary, which governs how encoded tokens are decoded
/// into bytes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::FromRepr,
)]
#[repr(i32)]
pub enum VocabType {
    /// Tokens are stored as the raw text they produce (e.g. tiktoken-style
    /// tokenizers).
    RAW = 0,
    /// Byte-fallback vocabularies: `<0xHH>` tokens stand for single bytes
    /// and `▁` stands for a space.
    BYTE_FALLBACK = 1,
    /// Byte-level BPE vocabularies: every byte is mapped to a printable
    /// Unicode character (the GPT-2 byte-to-unicode table).
    BYTE_LEVEL = 2,
}

/// The error type for [`TokenizerInfo`] creation.
#[derive(Debug, thiserror::Error)]
pub enum CreateTokenizerInfoError {
    /// The vocabulary size exceeds the maximum supported size.
    #[error("The vocabulary size is {0}, while the maximum supported is {1}.")]
    VocabularyTooLarge(usize, usize),
}

const MAX_VOCAB_SIZE: usize = 0x1000000;

/// Common textual forms of end-of-sequence tokens, used when stop token ids
/// are not supplied explicitly.
const KNOWN_STOP_TOKENS: &[&str] = &[
    "</s>",
    "<|endoftext|>",
    "<|end|>",
    "<eos>",
    "<|eos|>",
    "<end_of_turn>",
    "<|eot_id|>",
    "<|im_end|>",
    "<｜end▁of▁sentence｜>",
];

/// An immutable record of everything the compiler needs to know about a
/// tokenizer. Built once and shared by any number of compiled grammars.
///
/// `vocab_size` is the size of the model's logits row and may exceed the
/// number of encoded tokens (padded vocabularies); the padding ids are
/// treated as special tokens.
#[derive(Debug, Clone)]
pub struct TokenizerInfo {
    vocab_type: VocabType,
    vocab_size: usize,
    add_prefix_space: bool,
    decoded_vocab: Vec<Box<[u8]>>,
    stop_token_ids: Vec<i32>,
    special_token_ids: Vec<i32>,
    /// Token ids bucketed by the first byte of their decoded form. Tokens
    /// with an empty decoded form are kept separately.
    pub(crate) first_byte_to_token_ids: Vec<FixedBitSet>,
    pub(crate) empty_token_ids: Vec<u32>,
}

/// The serialized metadata of a tokenizer (everything except the decoded
/// vocabulary itself).
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TokenizerInfoMetadata {
    pub vocab_type: i32,
    pub vocab_size: usize,
    pub add_prefix_space: bool,
    pub stop_token_ids: Vec<i32>,
    pub special_token_ids: Vec<i32>,
}

impl TokenizerInfo {
    /// Creates a new [`TokenizerInfo`] from the encoded vocabulary.
    ///
    /// # Arguments
    ///
    /// * `encoded_vocab` - The tokenizer's vocabulary, ordered by token id,
    ///   in the encoded form the tokenizer stores (not yet decoded).
    /// * `vocab_type` - How the encoded tokens map to bytes.
    /// * `vocab_size` - The model's vocabulary size. Defaults to
    ///   `encoded_vocab.len()`; may be larger when the model pads its
    ///   lm_head.
    /// * `stop_token_ids` - The ids that terminate generation. Detected from
    ///   well-known end-of-sequence token spellings when `None`.
    /// * `add_prefix_space` - Whether the tokenizer prepends a space during
    ///   tokenization.
    pub fn new<T: AsRef<[u8]>>(
        encoded_vocab: &[T],
        vocab_type: VocabType,
        vocab_size: Option<usize>,
        stop_token_ids: Option<&[i32]>,
        add_prefix_space: bool,
    ) -> Result<TokenizerInfo, CreateTokenizerInfoError> {
        let vocab_size = vocab_size.unwrap_or(encoded_vocab.len());
        if vocab_size >= MAX_VOCAB_SIZE {
            return Err(CreateTokenizerInfoError::VocabularyTooLarge(
                vocab_size,
                MAX_VOCAB_SIZE,
            ));
        }
        let num_decoded = encoded_vocab.len().min(vocab_size);

        let mut decoded_vocab: Vec<Box<[u8]>> = Vec::with_capacity(vocab_size);
        let mut special_token_ids: Vec<i32> = Vec::new();
        for (token_id, encoded) in encoded_vocab.iter().take(num_decoded).enumerate() {
            let encoded = encoded.as_ref();
            if is_special_token(encoded, vocab_type) {
                special_token_ids.push(token_id as i32);
                decoded_vocab.push(Box::from(&[][..]));
                continue;
            }
            decoded_vocab.push(decode_token(encoded, vocab_type).into_boxed_slice());
        }
        // Padding ids beyond the encoded vocabulary are special.
        for token_id in num_decoded..vocab_size {
            special_token_ids.push(token_id as i32);
            decoded_vocab.push(Box::from(&[][..]));
        }

        let stop_token_ids: Vec<i32> = match stop_token_ids {
            Some(ids) => ids.to_vec(),
            None => {
                let detected: Vec<i32> = encoded_vocab
                    .iter()
                    .take(num_decoded)
                    .enumerate()
                    .filter(|(_, encoded)| {
                        std::str::from_utf8(encoded.as_ref())
                            .map(|s| KNOWN_STOP_TOKENS.contains(&s))
                            .unwrap_or(false)
                    })
                    .map(|(id, _)| id as i32)
                    .collect();
                if detected.is_empty() {
                    log::warn!(
                        "No stop token detected in the vocabulary. \
                         Pass stop_token_ids explicitly if generation should terminate."
                    );
                }
                detected
            }
        };

        let (first_byte_to_token_ids, empty_token_ids) =
            build_first_byte_index(&decoded_vocab, &special_token_ids, vocab_size);

        Ok(TokenizerInfo {
            vocab_type,
            vocab_size,
            add_prefix_space,
            decoded_vocab,
            stop_token_ids,
            special_token_ids,
            first_byte_to_token_ids,
            empty_token_ids,
        })
    }

    /// The type of the vocabulary.
    #[inline]
    pub fn vocab_type(&self) -> VocabType {
        self.vocab_type
    }

    /// The size of the vocabulary (the width of the token mask).
    #[inline]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Whether the tokenizer prepends a space in tokenization.
    #[inline]
    pub fn add_prefix_space(&self) -> bool {
        self.add_prefix_space
    }

    /// The decoded vocabulary, indexed by token id.
    #[inline]
    pub fn decoded_vocab(&self) -> &[Box<[u8]>] {
        &self.decoded_vocab
    }

    /// The decoded bytes of one token, or `None` when the id is out of
    /// range.
    #[inline]
    pub fn token_bytes(&self, token_id: u32) -> Option<&[u8]> {
        self.decoded_vocab.get(token_id as usize).map(|b| b.as_ref())
    }

    /// The stop token ids.
    #[inline]
    pub fn stop_token_ids(&self) -> &[i32] {
        &self.stop_token_ids
    }

    /// The special token ids. Special tokens are never admissible inside a
    /// grammar.
    #[inline]
    pub fn special_token_ids(&self) -> &[i32] {
        &self.special_token_ids
    }

    pub(crate) fn is_special_token_id(&self, token_id: u32) -> bool {
        self.special_token_ids.binary_search(&(token_id as i32)).is_ok()
    }

    /// Dumps the metadata (everything except the vocabulary) to a JSON
    /// string.
    pub fn dump_metadata(&self) -> String {
        serde_json::to_string(&self.metadata()).expect("metadata serialization cannot fail")
    }

    pub(crate) fn metadata(&self) -> TokenizerInfoMetadata {
        TokenizerInfoMetadata {
            vocab_type: self.vocab_type as i32,
            vocab_size: self.vocab_size,
            add_prefix_space: self.add_prefix_space,
            stop_token_ids: self.stop_token_ids.clone(),
            special_token_ids: self.special_token_ids.clone(),
        }
    }

    /// Reconstructs a [`TokenizerInfo`] from the encoded vocabulary and a
    /// metadata JSON string produced by [`TokenizerInfo::dump_metadata`].
    pub fn from_vocab_and_metadata<T: AsRef<[u8]>>(
        encoded_vocab: &[T],
        metadata: &str,
    ) -> Result<TokenizerInfo, crate::serialize::SerializationError> {
        let metadata: TokenizerInfoMetadata = serde_json::from_str(metadata)
            .map_err(|e| crate::serialize::SerializationError::Malformed(e.to_string()))?;
        Self::from_vocab_and_parsed_metadata(encoded_vocab, &metadata)
    }

    pub(crate) fn from_vocab_and_parsed_metadata<T: AsRef<[u8]>>(
        encoded_vocab: &[T],
        metadata: &TokenizerInfoMetadata,
    ) -> Result<TokenizerInfo, crate::serialize::SerializationError> {
        let vocab_type = VocabType::from_repr(metadata.vocab_type).ok_or_else(|| {
            crate::serialize::SerializationError::Malformed(format!(
                "unknown vocab_type {}",
                metadata.vocab_type
            ))
        })?;
        let mut info = Self::new(
            encoded_vocab,
            vocab_type,
            Some(metadata.vocab_size),
            Some(&metadata.stop_token_ids),
            metadata.add_prefix_space,
        )
        .map_err(|e| crate::serialize::SerializationError::Malformed(e.to_string()))?;
        info.special_token_ids = metadata.special_token_ids.clone();
        info.special_token_ids.sort_unstable();
        // The serialized special ids are authoritative; rebuild the
        // first-byte index against them.
        let (buckets, empty_token_ids) =
            build_first_byte_index(&info.decoded_vocab, &info.special_token_ids, info.vocab_size);
        info.first_byte_to_token_ids = buckets;
        info.empty_token_ids = empty_token_ids;
        Ok(info)
    }

    /// Serializes the tokenizer metadata to its v2 JSON representation. The
    /// decoded vocabulary is not included; supply it again on deserialize.
    pub fn serialize_json(&self) -> String {
        crate::serialize::serialize_tokenizer_info(self)
    }

    /// Deserializes a [`TokenizerInfo`] from its v2 JSON representation plus
    /// the encoded vocabulary.
    pub fn deserialize_json<T: AsRef<[u8]>>(
        json: &str,
        encoded_vocab: &[T],
    ) -> Result<TokenizerInfo, crate::serialize::SerializationError> {
        crate::serialize::deserialize_tokenizer_info(json, encoded_vocab)
    }

    /// A stable fingerprint of the tokenizer metadata, used as part of the
    /// compiler cache key.
    pub(crate) fn fingerprint(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = ahash::AHasher::default();
        (self.vocab_type as i32).hash(&mut hasher);
        self.vocab_size.hash(&mut hasher);
        self.add_prefix_space.hash(&mut hasher);
        self.stop_token_ids.hash(&mut hasher);
        self.special_token_ids.hash(&mut hasher);
        for token in &self.decoded_vocab {
            token.hash(&mut hasher);
        }
        hasher.finish()
    }
}

fn build_first_byte_index(
    decoded_vocab: &[Box<[u8]>],
    special_token_ids: &[i32],
    vocab_size: usize,
) -> (Vec<FixedBitSet>, Vec<u32>) {
    let mut buckets: Vec<FixedBitSet> =
        (0..256).map(|_| FixedBitSet::with_capacity(vocab_size)).collect();
    let mut empty_token_ids = Vec::new();
    let special: Vec<i32> = {
        let mut s = special_token_ids.to_vec();
        s.sort_unstable();
        s
    };
    for (token_id, token) in decoded_vocab.iter().enumerate() {
        if special.binary_search(&(token_id as i32)).is_ok() {
            continue;
        }
        match token.first() {
            Some(&first) => buckets[first as usize].insert(token_id),
            None => empty_token_ids.push(token_id as u32),
        }
    }
    (buckets, empty_token_ids)
}

/// Decides whether an encoded token is a special (control) token.
fn is_special_token(encoded: &[u8], vocab_type: VocabType) -> bool {
    let Ok(text) = std::str::from_utf8(encoded) else {
        return false;
    };
    if vocab_type == VocabType::BYTE_FALLBACK && is_byte_fallback_token(text) {
        return false;
    }
    // <|...|> wrappers and <name> control tokens.
    if text.len() > 2 && text.starts_with('<') && text.ends_with('>') {
        let inner = &text[1..text.len() - 1];
        if inner.starts_with('|') && inner.ends_with('|') {
            return true;
        }
        if inner.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '/') {
            return true;
        }
    }
    // [PAD]-style control tokens.
    if text.len() > 2 && text.starts_with('[') && text.ends_with(']') {
        let inner = &text[1..text.len() - 1];
        if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
            return true;
        }
    }
    false
}

fn is_byte_fallback_token(text: &str) -> bool {
    text.len() == 6
        && text.starts_with("<0x")
        && text.ends_with('>')
        && text[3..5].chars().all(|c| c.is_ascii_hexdigit())
}

/// Decodes one encoded token into the bytes it produces.
fn decode_token(encoded: &[u8], vocab_type: VocabType) -> Vec<u8> {
    match vocab_type {
        VocabType::RAW => encoded.to_vec(),
        VocabType::BYTE_FALLBACK => {
            if let Ok(text) = std::str::from_utf8(encoded) {
                if is_byte_fallback_token(text) {
                    if let Ok(byte) = u8::from_str_radix(&text[3..5], 16) {
                        return vec![byte];
                    }
                }
                // The sentencepiece space marker.
                return text.replace('\u{2581}', " ").into_bytes();
            }
            encoded.to_vec()
        }
        VocabType::BYTE_LEVEL => {
            let Ok(text) = std::str::from_utf8(encoded) else {
                return encoded.to_vec();
            };
            let map = byte_level_char_to_byte();
            let mut bytes = Vec::with_capacity(text.len());
            for ch in text.chars() {
                match map.get(&ch) {
                    Some(&byte) => bytes.push(byte),
                    None => {
                        // Not a byte-level encoded character; keep it as-is.
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                    }
                }
            }
            bytes
        }
    }
}

/// The inverse of the GPT-2 byte-to-unicode table.
fn byte_level_char_to_byte() -> &'static AHashMap<char, u8> {
    static MAP: OnceLock<AHashMap<char, u8>> = OnceLock::new();
    MAP.get_or_init(|| {
        let mut direct: Vec<u8> = Vec::new();
        direct.extend(b'!'..=b'~');
        direct.extend(0xA1u8..=0xACu8);
        direct.extend(0xAEu8..=0xFFu8);
        let mut map = AHashMap::default();
        for &byte in &direct {
            map.insert(char::from_u32(byte as u32).unwrap(), byte);
        }
        let mut offset = 0u32;
        for byte in 0u32..256 {
            if !direct.contains(&(byte as u8)) {
                map.insert(char::from_u32(256 + offset).unwrap(), byte as u8);
                offset += 1;
            }
        }
        map
    })
}
