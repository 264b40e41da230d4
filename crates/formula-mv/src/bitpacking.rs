use crate::error::{MvError, MvResult};

/// Fixed-width unsigned integers packed back to back into `u64` words (LSB first).
///
/// A width of zero is valid and stores nothing: every slot reads as `0`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitPackedBuffer {
    width: u8,
    len: usize,
    words: Vec<u64>,
}

/// Number of bits needed to represent every value in `0..=max_value`.
pub fn bits_required(max_value: u64) -> u8 {
    (64 - max_value.leading_zeros()) as u8
}

fn value_mask(width: u8) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

impl BitPackedBuffer {
    /// Zero-filled buffer holding `len` slots of `width` bits.
    pub fn zeroed(width: u8, len: usize) -> Self {
        debug_assert!(width <= 64);
        let total_bits = (width as usize) * len;
        Self {
            width,
            len,
            words: vec![0u64; (total_bits + 63) / 64],
        }
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the packed payload on disk.
    pub fn byte_len(&self) -> usize {
        packed_byte_len(self.width, self.len)
    }

    pub fn get(&self, index: usize) -> u64 {
        debug_assert!(index < self.len, "packed index out of bounds");
        if self.width == 0 {
            return 0;
        }
        let bit = index * self.width as usize;
        let word = bit / 64;
        let shift = bit % 64;
        let mut v = self.words[word] >> shift;
        if shift + self.width as usize > 64 {
            v |= self.words[word + 1] << (64 - shift);
        }
        v & value_mask(self.width)
    }

    pub fn set(&mut self, index: usize, value: u64) {
        debug_assert!(index < self.len, "packed index out of bounds");
        debug_assert!(
            value <= value_mask(self.width),
            "value {value} does not fit in {} bits",
            self.width
        );
        if self.width == 0 {
            return;
        }
        let mask = value_mask(self.width);
        let value = value & mask;
        let bit = index * self.width as usize;
        let word = bit / 64;
        let shift = bit % 64;

        self.words[word] = (self.words[word] & !(mask << shift)) | (value << shift);
        let spill = (shift + self.width as usize).saturating_sub(64);
        if spill > 0 {
            let high_mask = value_mask(spill as u8);
            let high = value >> (64 - shift);
            self.words[word + 1] = (self.words[word + 1] & !high_mask) | high;
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out: Vec<u8> = self.words.iter().flat_map(|w| w.to_le_bytes()).collect();
        out.truncate(self.byte_len());
        out
    }

    pub fn from_bytes(width: u8, len: usize, bytes: &[u8]) -> MvResult<Self> {
        if width > 64 {
            return Err(MvError::corrupt(format!("bit width {width} exceeds 64")));
        }
        let expected = packed_byte_len(width, len);
        if bytes.len() != expected {
            return Err(MvError::corrupt(format!(
                "packed column is {} bytes, expected {expected}",
                bytes.len()
            )));
        }
        let mut out = Self::zeroed(width, len);
        for (word, chunk) in out.words.iter_mut().zip(bytes.chunks(8)) {
            let mut buf = [0u8; 8];
            buf[..chunk.len()].copy_from_slice(chunk);
            *word = u64::from_le_bytes(buf);
        }
        Ok(out)
    }
}

pub fn packed_byte_len(width: u8, len: usize) -> usize {
    (width as usize * len + 7) / 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_required_matches_range() {
        assert_eq!(bits_required(0), 0);
        assert_eq!(bits_required(1), 1);
        assert_eq!(bits_required(2), 2);
        assert_eq!(bits_required(255), 8);
        assert_eq!(bits_required(256), 9);
        assert_eq!(bits_required(u64::MAX), 64);
    }

    #[test]
    fn values_straddling_word_boundaries() {
        for width in [1u8, 3, 7, 13, 31, 33, 63, 64] {
            let len = 200;
            let mask = value_mask(width);
            let mut buf = BitPackedBuffer::zeroed(width, len);
            for i in 0..len {
                buf.set(i, (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) & mask);
            }
            // Overwrite in place to make sure neighbours are untouched.
            buf.set(5, mask);
            buf.set(5, 1 & mask);
            for i in 0..len {
                let expected = if i == 5 {
                    1 & mask
                } else {
                    (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) & mask
                };
                assert_eq!(buf.get(i), expected, "width {width} index {i}");
            }
            let restored = BitPackedBuffer::from_bytes(width, len, &buf.to_bytes()).unwrap();
            assert_eq!(restored, buf);
        }
    }

    #[test]
    fn zero_width_stores_nothing() {
        let mut buf = BitPackedBuffer::zeroed(0, 10);
        buf.set(3, 0);
        assert_eq!(buf.get(3), 0);
        assert_eq!(buf.byte_len(), 0);
        assert!(buf.to_bytes().is_empty());
    }
}
