//! Prefix-code ("Huffman") tables.
//!
//! A [`PrefixCode`] is a validated set of (code, length) pairs with associated values. It is
//! either built canonically from per-length code counts (as in JPEG `DHT` segments) or from an
//! explicit list of codes. A [`HuffmanTable`] turns it into a lookup table for decoding.

use crate::bits::BitSource;
use crate::error::{DecodingError, Result, bail};

/// The number of bits resolved by a single table lookup.
const LOOKUP_DEPTH: u32 = 11;
const PAYLOAD_SHIFT: u32 = 16;
const FLAG_HAS_DIFF: u32 = 0x100;
const LEN_MASK: u32 = 0xff;

/// A single code word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CodeSymbol {
    /// The number of bits of the code.
    pub len: u8,
    /// The code bits, right-aligned.
    pub code: u32,
}

impl CodeSymbol {
    /// Create a new code word.
    pub fn new(code: u32, len: u8) -> Self {
        Self { len, code }
    }

    /// Whether `self` is a prefix of `other`.
    fn is_prefix_of(&self, other: &CodeSymbol) -> bool {
        self.len <= other.len && (other.code >> (other.len - self.len)) == self.code
    }
}

/// A validated prefix code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixCode {
    symbols: Vec<CodeSymbol>,
    values: Vec<u16>,
}

impl PrefixCode {
    /// Build a canonical prefix code from the number of codes of each length (1 to 16 bits)
    /// and the values in code order.
    pub fn from_counts(counts: &[u8; 16], values: &[u16]) -> Result<Self> {
        let total: usize = counts.iter().map(|c| *c as usize).sum();

        if total == 0 {
            bail!(DecodingError::InvalidHuffmanTable("table contains no codes"));
        }

        if total != values.len() {
            bail!(DecodingError::InvalidHuffmanTable(
                "number of values does not match code counts"
            ));
        }

        let mut symbols = Vec::with_capacity(total);
        let mut code = 0_u32;

        for (i, count) in counts.iter().enumerate() {
            let len = i as u8 + 1;

            for _ in 0..*count {
                symbols.push(CodeSymbol::new(code, len));
                code += 1;
            }

            // All codes of this length must fit into `len` bits.
            if code > (1 << len) {
                bail!(DecodingError::InvalidHuffmanTable("code lengths are over-subscribed"));
            }

            code <<= 1;
        }

        Ok(Self {
            symbols,
            values: values.to_vec(),
        })
    }

    /// Build a prefix code from explicit (code, value) pairs.
    pub fn from_symbols(entries: &[(CodeSymbol, u16)]) -> Result<Self> {
        if entries.is_empty() {
            bail!(DecodingError::InvalidHuffmanTable("table contains no codes"));
        }

        let mut entries = entries.to_vec();
        entries.sort_by_key(|(s, _)| *s);

        for (i, (symbol, _)) in entries.iter().enumerate() {
            if symbol.len == 0 || symbol.len > 32 {
                bail!(DecodingError::InvalidHuffmanTable("invalid code length"));
            }

            if symbol.len < 32 && symbol.code >= (1 << symbol.len) {
                bail!(DecodingError::InvalidHuffmanTable("code does not fit its length"));
            }

            if entries[..i].iter().any(|(s, _)| s.is_prefix_of(symbol)) {
                bail!(DecodingError::InvalidHuffmanTable("code is not prefix-free"));
            }
        }

        Ok(Self {
            symbols: entries.iter().map(|(s, _)| *s).collect(),
            values: entries.iter().map(|(_, v)| *v).collect(),
        })
    }

    /// The code words.
    pub fn symbols(&self) -> &[CodeSymbol] {
        &self.symbols
    }

    /// The values, in the same order as the code words.
    pub fn values(&self) -> &[u16] {
        &self.values
    }

    /// The length of the longest code.
    pub fn max_len(&self) -> u8 {
        self.symbols.iter().map(|s| s.len).max().unwrap_or(0)
    }
}

/// A decoding table for a [`PrefixCode`].
///
/// In full-decode mode, each code value is the bit length of a signed difference that
/// directly follows the code in the stream, as in lossless JPEG.
#[derive(Debug, Clone)]
pub struct HuffmanTable {
    lut: Vec<u32>,
    // Sorted by (len, code), for codes that do not fit into the lookup table.
    sorted: Vec<(CodeSymbol, u16)>,
    max_len: u32,
    full_decode: bool,
    fix_dng_bug16: bool,
}

impl HuffmanTable {
    /// Create a new table.
    ///
    /// `fix_dng_bug16` makes a 16-bit difference consume 16 extra bits, as written by some
    /// DNG encoders.
    pub fn new(code: &PrefixCode, full_decode: bool, fix_dng_bug16: bool) -> Result<Self> {
        if full_decode && code.values.iter().any(|v| *v > 16) {
            bail!(DecodingError::InvalidHuffmanTable(
                "difference length is larger than 16 bits"
            ));
        }

        let mut lut = vec![0_u32; 1 << LOOKUP_DEPTH];

        for (symbol, value) in code.symbols.iter().zip(&code.values) {
            let len = symbol.len as u32;

            if len > LOOKUP_DEPTH {
                continue;
            }

            let value = *value as u32;
            let resolvable = full_decode && value != 16 && len + value <= LOOKUP_DEPTH;

            if resolvable {
                // Resolve the difference bits that follow the code as well.
                let total = len + value;

                for diff in 0..(1_u32 << value) {
                    let prefix = (symbol.code << value) | diff;
                    let extended = extend(diff, value);
                    let entry =
                        ((extended as u32) << PAYLOAD_SHIFT) | FLAG_HAS_DIFF | (total & LEN_MASK);
                    fill(&mut lut, prefix, total, entry);
                }
            } else {
                fill(&mut lut, symbol.code, len, (value << PAYLOAD_SHIFT) | len);
            }
        }

        let mut sorted: Vec<_> = code
            .symbols
            .iter()
            .copied()
            .zip(code.values.iter().copied())
            .collect();
        sorted.sort_by_key(|(s, _)| *s);

        Ok(Self {
            lut,
            sorted,
            max_len: code.max_len() as u32,
            full_decode,
            fix_dng_bug16,
        })
    }

    /// Decode the next code and return its value.
    pub fn decode_code_value(&self, bs: &mut impl BitSource) -> Result<u16> {
        let entry = self.lut[bs.peek_bits(LOOKUP_DEPTH)? as usize];
        let len = entry & LEN_MASK;

        if len != 0 && entry & FLAG_HAS_DIFF == 0 {
            bs.skip_bits(len)?;

            return Ok((entry >> PAYLOAD_SHIFT) as u16);
        }

        let (symbol_len, value) = self.decode_slow(bs)?;
        bs.skip_bits(symbol_len)?;

        Ok(value)
    }

    /// Decode the next difference. Only valid in full-decode mode.
    pub fn decode_difference(&self, bs: &mut impl BitSource) -> Result<i32> {
        debug_assert!(self.full_decode);

        let entry = self.lut[bs.peek_bits(LOOKUP_DEPTH)? as usize];

        if entry & FLAG_HAS_DIFF != 0 {
            bs.skip_bits(entry & LEN_MASK)?;

            return Ok((entry as i32) >> PAYLOAD_SHIFT);
        }

        let diff_len = self.decode_code_value(bs)? as u32;

        match diff_len {
            0 => Ok(0),
            16 => {
                if self.fix_dng_bug16 {
                    bs.skip_bits(16)?;
                }

                Ok(-32768)
            }
            _ => {
                let diff = bs.get_bits(diff_len)?;

                Ok(extend(diff, diff_len))
            }
        }
    }

    fn decode_slow(&self, bs: &mut impl BitSource) -> Result<(u32, u16)> {
        for len in 1..=self.max_len {
            let code = bs.peek_bits(len)?;
            let key = CodeSymbol::new(code, len as u8);

            if let Ok(idx) = self.sorted.binary_search_by_key(&key, |(s, _)| *s) {
                return Ok((len, self.sorted[idx].1));
            }
        }

        Err(DecodingError::InvalidHuffmanCode.into())
    }
}

fn fill(lut: &mut [u32], code: u32, len: u32, entry: u32) {
    let shift = LOOKUP_DEPTH - len;
    let start = (code << shift) as usize;

    for e in &mut lut[start..start + (1 << shift)] {
        *e = entry;
    }
}

/// Turn `len` raw difference bits into a signed value.
///
/// Differences with the top bit clear are negative.
#[inline]
pub fn extend(diff: u32, len: u32) -> i32 {
    if len == 0 {
        return 0;
    }

    if diff & (1 << (len - 1)) == 0 {
        diff as i32 - ((1_i32 << len) - 1)
    } else {
        diff as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::writer::BitWriter;
    use crate::bits::{BitPumpMsb, BitReader};
    use crate::error::{DecodeError, IoError};

    #[test]
    fn two_code_table() {
        let code = PrefixCode::from_symbols(&[
            (CodeSymbol::new(0b00, 2), 5),
            (CodeSymbol::new(0b01, 2), 9),
        ])
        .unwrap();
        let table = HuffmanTable::new(&code, false, false).unwrap();

        let data = [0b0100_0000];
        let mut reader = BitReader::with_bit_len(&data, 2);
        assert_eq!(table.decode_code_value(&mut reader).unwrap(), 9);

        let mut truncated = BitReader::with_bit_len(&data, 1);
        assert!(matches!(
            table.decode_code_value(&mut truncated),
            Err(DecodeError::Io(IoError::BitStreamOverrun))
        ));
    }

    #[test]
    fn canonical_codes() {
        let mut counts = [0; 16];
        counts[1] = 1;
        counts[2] = 2;
        let code = PrefixCode::from_counts(&counts, &[1, 2, 3]).unwrap();

        assert_eq!(
            code.symbols(),
            &[
                CodeSymbol::new(0b00, 2),
                CodeSymbol::new(0b010, 3),
                CodeSymbol::new(0b011, 3),
            ]
        );
    }

    #[test]
    fn over_subscribed() {
        let mut counts = [0; 16];
        counts[0] = 3;

        assert!(PrefixCode::from_counts(&counts, &[0, 1, 2]).is_err());
        assert!(PrefixCode::from_counts(&[0; 16], &[]).is_err());
    }

    #[test]
    fn not_prefix_free() {
        assert!(
            PrefixCode::from_symbols(&[
                (CodeSymbol::new(0b1, 1), 0),
                (CodeSymbol::new(0b10, 2), 1),
            ])
            .is_err()
        );
        assert!(PrefixCode::from_symbols(&[(CodeSymbol::new(4, 2), 0)]).is_err());
    }

    #[test]
    fn long_codes_and_invalid() {
        // One short code, and a chain of long codes.
        let mut entries = vec![(CodeSymbol::new(0, 1), 100)];
        for len in 2..=14_u8 {
            entries.push((CodeSymbol::new(((1 << (len - 1)) - 1) << 1, len), len as u16));
        }
        let code = PrefixCode::from_symbols(&entries).unwrap();
        let table = HuffmanTable::new(&code, false, false).unwrap();

        let mut w = BitWriter::new();
        w.write(0, 1);
        w.write(0b11111111111110, 14);
        w.write(0b111111111110, 12);
        w.write(0b11111111111111, 14);
        let data = w.finish();

        let mut bs = BitPumpMsb::new(&data);
        assert_eq!(table.decode_code_value(&mut bs).unwrap(), 100);
        assert_eq!(table.decode_code_value(&mut bs).unwrap(), 14);
        assert_eq!(table.decode_code_value(&mut bs).unwrap(), 12);
        assert!(matches!(
            table.decode_code_value(&mut bs),
            Err(DecodeError::Decoding(DecodingError::InvalidHuffmanCode))
        ));
    }

    #[test]
    fn differences() {
        // Lengths 0, 3, 16 and 12.
        let mut counts = [0; 16];
        counts[1] = 4;
        let code = PrefixCode::from_counts(&counts, &[0, 3, 16, 12]).unwrap();
        let table = HuffmanTable::new(&code, true, false).unwrap();
        let fixed = HuffmanTable::new(&code, true, true).unwrap();

        let mut w = BitWriter::new();
        w.write(0b00, 2);
        w.write(0b01, 2);
        w.write(0b010, 3);
        w.write(0b01, 2);
        w.write(0b110, 3);
        w.write(0b10, 2);
        w.write(0b11, 2);
        w.write(0b1000_0000_0001, 12);
        let data = w.finish();

        let mut bs = BitPumpMsb::new(&data);
        assert_eq!(table.decode_difference(&mut bs).unwrap(), 0);
        assert_eq!(table.decode_difference(&mut bs).unwrap(), -5);
        assert_eq!(table.decode_difference(&mut bs).unwrap(), 6);
        assert_eq!(table.decode_difference(&mut bs).unwrap(), -32768);
        assert_eq!(table.decode_difference(&mut bs).unwrap(), 2049);

        let mut w = BitWriter::new();
        w.write(0b10, 2);
        w.write(0xffff, 16);
        w.write(0b01, 2);
        w.write(0b111, 3);
        let data = w.finish();

        let mut bs = BitPumpMsb::new(&data);
        assert_eq!(fixed.decode_difference(&mut bs).unwrap(), -32768);
        assert_eq!(fixed.decode_difference(&mut bs).unwrap(), 7);
    }

    #[test]
    fn extend_values() {
        assert_eq!(extend(0, 0), 0);
        assert_eq!(extend(0, 1), -1);
        assert_eq!(extend(1, 1), 1);
        assert_eq!(extend(0b011, 3), -4);
        assert_eq!(extend(0b100, 3), 4);
    }

    #[test]
    fn rejects_long_differences() {
        let mut counts = [0; 16];
        counts[0] = 1;

        let code = PrefixCode::from_counts(&counts, &[17]).unwrap();
        assert!(HuffmanTable::new(&code, true, false).is_err());
        assert!(HuffmanTable::new(&code, false, false).is_ok());
    }
}
