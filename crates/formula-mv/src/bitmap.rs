use crate::error::{MvError, MvResult};
use byteorder::{ByteOrder, LittleEndian};

/// Row-selection mask: bit `i` is set when row `i` of a block passes a filter.
///
/// Bits are stored little-endian within each `u64` word (bit 0 is the LSB of word 0). Bits past
/// `len` in the last word are always zero.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitVec {
    words: Vec<u64>,
    len: usize,
    ones: usize,
}

fn words_for(bits: usize) -> usize {
    (bits + 63) / 64
}

fn tail_mask(len: usize) -> u64 {
    match len % 64 {
        0 => u64::MAX,
        rem => (1u64 << rem) - 1,
    }
}

impl BitVec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(bits: usize, value: bool) -> Self {
        let fill = if value { u64::MAX } else { 0 };
        let mut words = vec![fill; words_for(bits)];
        if let Some(last) = words.last_mut() {
            *last &= tail_mask(bits);
        }
        Self {
            words,
            len: bits,
            ones: if value { bits } else { 0 },
        }
    }

    /// Build a mask by evaluating `pred` for every row in `0..len`.
    pub fn from_fn(len: usize, mut pred: impl FnMut(usize) -> bool) -> Self {
        let mut out = Self::with_len(len, false);
        for row in 0..len {
            if pred(row) {
                out.words[row / 64] |= 1u64 << (row % 64);
                out.ones += 1;
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, value: bool) {
        if self.len % 64 == 0 {
            self.words.push(0);
        }
        if value {
            self.words[self.len / 64] |= 1u64 << (self.len % 64);
            self.ones += 1;
        }
        self.len += 1;
    }

    pub fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.len, "BitVec index out of bounds");
        (self.words[index / 64] >> (index % 64)) & 1 == 1
    }

    pub fn set(&mut self, index: usize, value: bool) {
        debug_assert!(index < self.len, "BitVec index out of bounds");
        let word = &mut self.words[index / 64];
        let mask = 1u64 << (index % 64);
        let was_set = *word & mask != 0;
        if value && !was_set {
            *word |= mask;
            self.ones += 1;
        } else if !value && was_set {
            *word &= !mask;
            self.ones -= 1;
        }
    }

    pub fn count_ones(&self) -> usize {
        self.ones
    }

    pub fn all_true(&self) -> bool {
        self.ones == self.len
    }

    /// Indices of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(word_idx, &word)| {
            let mut remaining = word;
            std::iter::from_fn(move || {
                if remaining == 0 {
                    return None;
                }
                let bit = remaining.trailing_zeros() as usize;
                remaining &= remaining - 1;
                Some(word_idx * 64 + bit)
            })
        })
    }

    pub fn and_inplace(&mut self, other: &BitVec) {
        self.combine_inplace(other, |a, b| a & b);
    }

    pub fn or_inplace(&mut self, other: &BitVec) {
        self.combine_inplace(other, |a, b| a | b);
    }

    pub fn not_inplace(&mut self) {
        for w in &mut self.words {
            *w = !*w;
        }
        if let Some(last) = self.words.last_mut() {
            *last &= tail_mask(self.len);
        }
        self.ones = self.len - self.ones;
    }

    fn combine_inplace(&mut self, other: &BitVec, op: impl Fn(u64, u64) -> u64) {
        debug_assert_eq!(self.len, other.len, "BitVec length mismatch");
        let mut ones = 0usize;
        for (idx, w) in self.words.iter_mut().enumerate() {
            *w = op(*w, other.words.get(idx).copied().unwrap_or(0));
            ones += w.count_ones() as usize;
        }
        if let Some(last) = self.words.last_mut() {
            let masked = *last & tail_mask(self.len);
            ones -= (*last ^ masked).count_ones() as usize;
            *last = masked;
        }
        self.ones = ones;
    }

    /// Serialize as `len: u64` followed by the little-endian words.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; 8 + self.words.len() * 8];
        LittleEndian::write_u64(&mut out[..8], self.len as u64);
        LittleEndian::write_u64_into(&self.words, &mut out[8..]);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> MvResult<Self> {
        if bytes.len() < 8 {
            return Err(MvError::corrupt("bit vector header truncated"));
        }
        let len = usize::try_from(LittleEndian::read_u64(&bytes[..8]))
            .map_err(|_| MvError::corrupt("bit vector length overflows usize"))?;
        let body = &bytes[8..];
        if body.len() != words_for(len) * 8 {
            return Err(MvError::corrupt(format!(
                "bit vector body is {} bytes, expected {} for {len} bits",
                body.len(),
                words_for(len) * 8
            )));
        }
        let mut words = vec![0u64; words_for(len)];
        LittleEndian::read_u64_into(body, &mut words);
        if let Some(last) = words.last_mut() {
            *last &= tail_mask(len);
        }
        let ones = words.iter().map(|w| w.count_ones() as usize).sum();
        Ok(Self { words, len, ones })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_get_set_track_popcount() {
        let mut bits = BitVec::new();
        for i in 0..130 {
            bits.push(i % 3 == 0);
        }
        assert_eq!(bits.len(), 130);
        assert_eq!(bits.count_ones(), 44);
        assert!(bits.get(129));
        bits.set(129, false);
        bits.set(1, true);
        assert_eq!(bits.count_ones(), 44);
        assert!(!bits.get(129));
    }

    #[test]
    fn logical_ops_respect_tail() {
        let mut a = BitVec::from_fn(70, |i| i % 2 == 0);
        let b = BitVec::from_fn(70, |i| i < 10);
        let mut c = a.clone();
        a.and_inplace(&b);
        assert_eq!(a.iter_ones().collect::<Vec<_>>(), vec![0, 2, 4, 6, 8]);
        c.or_inplace(&b);
        assert_eq!(c.count_ones(), 35 + 5);
        c.not_inplace();
        assert_eq!(c.count_ones(), 70 - 40);
        assert!(BitVec::with_len(70, true).all_true());
    }

    #[test]
    fn bytes_roundtrip_and_reject_bad_length() {
        let bits = BitVec::from_fn(100, |i| i % 7 == 1);
        let bytes = bits.to_bytes();
        assert_eq!(BitVec::from_bytes(&bytes).unwrap(), bits);
        assert!(BitVec::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(BitVec::from_bytes(&[1, 2]).is_err());
    }
}
