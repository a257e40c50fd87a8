//! The packed token bitmask and the CPU kernel that applies it to logits.
//!
//! The bitmask is a row-major array of 32-bit words with one row per batch
//! element and `ceil(vocab_size / 32)` words per row. Bit `b` of word `w`
//! corresponds to token id `w * 32 + b`; a set bit means the token is
//! admissible, a clear bit means it must be masked out of the logits.
use displaydoc::Display;
use fixedbitset_stack::FixedBitSet;

/// Number of token ids packed into one bitmask word.
pub const BITS_PER_WORD: usize = 32;

/// Returns the number of 32-bit words needed to cover `vocab_size` tokens.
#[inline]
pub fn bitmask_word_count(vocab_size: usize) -> usize {
    vocab_size.div_ceil(BITS_PER_WORD)
}

/// Represents the error when a [`TokenBitmask`] operation fails.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitmaskError {
    /// The batch index is out of range for the bitmask.
    InvalidBatchIndex,
    /// The logits length does not match the bitmask's vocabulary size.
    InvalidLogitsLength,
    /// The bitmask shape does not match the expected vocabulary size.
    InvalidShape,
}

/// A packed admissibility mask over the token vocabulary, with one row per
/// batch element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenBitmask {
    data: Vec<i32>,
    batch_size: usize,
    vocab_size: usize,
}

impl TokenBitmask {
    /// Allocates a zeroed bitmask with shape `(batch_size, ceil(vocab_size / 32))`.
    pub fn new(batch_size: usize, vocab_size: usize) -> Self {
        TokenBitmask {
            data: vec![0; batch_size * bitmask_word_count(vocab_size)],
            batch_size,
            vocab_size,
        }
    }

    /// The `(rows, words_per_row)` shape of the mask.
    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.batch_size, bitmask_word_count(self.vocab_size))
    }

    /// The vocabulary size this mask covers.
    #[inline]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// The raw packed words, row-major.
    #[inline]
    pub fn as_slice(&self) -> &[i32] {
        &self.data
    }

    /// Borrows one batch row of packed words.
    pub fn row(&self, index: usize) -> Result<&[i32], BitmaskError> {
        if index >= self.batch_size {
            return Err(BitmaskError::InvalidBatchIndex);
        }
        let words = bitmask_word_count(self.vocab_size);
        Ok(&self.data[index * words..(index + 1) * words])
    }

    /// Mutably borrows one batch row of packed words.
    pub fn row_mut(&mut self, index: usize) -> Result<&mut [i32], BitmaskError> {
        if index >= self.batch_size {
            return Err(BitmaskError::InvalidBatchIndex);
        }
        let words = bitmask_word_count(self.vocab_size);
        Ok(&mut self.data[index * words..(index + 1) * words])
    }

    /// Overwrites one batch row from a bitset of admissible token ids.
    pub(crate) fn write_row_from_bitset(
        &mut self,
        index: usize,
        allowed: &FixedBitSet,
    ) -> Result<(), BitmaskError> {
        let vocab_size = self.vocab_size;
        let row = self.row_mut(index)?;
        row.fill(0);
        for token_id in allowed.ones() {
            if token_id < vocab_size {
                row[token_id / BITS_PER_WORD] |=
                    1i32.wrapping_shl((token_id % BITS_PER_WORD) as u32);
            }
        }
        Ok(())
    }

    /// Checks whether the bit for `token_id` is set in the given row.
    pub fn is_allowed(&self, index: usize, token_id: usize) -> Result<bool, BitmaskError> {
        if token_id >= self.vocab_size {
            return Err(BitmaskError::InvalidShape);
        }
        let row = self.row(index)?;
        Ok(row[token_id / BITS_PER_WORD] & 1i32.wrapping_shl((token_id % BITS_PER_WORD) as u32) != 0)
    }

    /// Collects the token ids whose bits are clear in the given row.
    /// Mainly for debugging and tests.
    pub fn masked_token_ids(&self, index: usize) -> Result<Vec<u32>, BitmaskError> {
        let row = self.row(index)?;
        let mut masked = Vec::new();
        for token_id in 0..self.vocab_size {
            if row[token_id / BITS_PER_WORD] & 1i32.wrapping_shl((token_id % BITS_PER_WORD) as u32)
                == 0
            {
                masked.push(token_id as u32);
            }
        }
        Ok(masked)
    }
}

/// Applies one row of the bitmask to a logits array in place, overwriting
/// every masked position with `f32::NEG_INFINITY`.
///
/// The logits length must equal the bitmask's vocabulary size.
pub fn apply_token_bitmask_inplace(
    logits: &mut [f32],
    bitmask: &TokenBitmask,
    index: usize,
) -> Result<(), BitmaskError> {
    if logits.len() != bitmask.vocab_size() {
        return Err(BitmaskError::InvalidLogitsLength);
    }
    let row = bitmask.row(index)?;
    for (word_index, &word) in row.iter().enumerate() {
        if word == -1i32 {
            continue;
        }
        let base = word_index * BITS_PER_WORD;
        let end = (base + BITS_PER_WORD).min(logits.len());
        for token_id in base..end {
            if word & 1i32.wrapping_shl((token_id - base) as u32) == 0 {
                logits[token_id] = f32::NEG_INFINITY;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape() {
        let mask = TokenBitmask::new(2, 33);
        assert_eq!(mask.shape(), (2, 2));
        assert_eq!(mask.as_slice().len(), 4);
    }

    #[test]
    fn test_apply() {
        let mut mask = TokenBitmask::new(1, 3);
        mask.row_mut(0).unwrap()[0] = 0b101;
        let mut logits = [0.5f32, 1.0, -0.5];
        apply_token_bitmask_inplace(&mut logits, &mask, 0).unwrap();
        assert_eq!(logits[0], 0.5);
        assert_eq!(logits[1], f32::NEG_INFINITY);
        assert_eq!(logits[2], -0.5);
    }

    #[test]
    fn test_masked_token_ids() {
        let mut mask = TokenBitmask::new(1, 5);
        mask.row_mut(0).unwrap()[0] = 0b10010;
        assert_eq!(mask.masked_token_ids(0).unwrap(), vec![0, 2, 3]);
    }

    #[test]
    fn test_length_mismatch() {
        let mask = TokenBitmask::new(1, 4);
        let mut logits = [0.0f32; 5];
        assert_eq!(
            apply_token_bitmask_inplace(&mut logits, &mask, 0),
            Err(BitmaskError::InvalidLogitsLength)
        );
    }
}
