//! Bit readers for the different bit packings used by raw codecs.
//!
//! [`BitStream`] is the fast reader used by the codecs. It keeps a 64-bit cache that is
//! refilled in whole chunks, whose size and bit order depend on the [`BitOrder`]. Reads past
//! the end of the input see zero bytes for up to [`MARGIN`] bytes, after which they fail.
//!
//! [`BitReader`] is an exact MSB-first reader that knows its length in bits.

use core::marker::PhantomData;

use crate::buffer::MARGIN;
use crate::error::{IoError, Result, bail};

/// A source of bits for prefix-code decoding.
pub trait BitSource {
    /// Look at the next `count` bits (at most 32), MSB-first.
    ///
    /// Bits past the end of the input read as zero. Implementations may still fail if the
    /// read is too far past the end.
    fn peek_bits(&mut self, count: u32) -> Result<u32>;

    /// Consume `count` bits. Fails if that would move past the end of the input.
    fn skip_bits(&mut self, count: u32) -> Result<()>;

    /// Read `count` bits.
    #[inline]
    fn get_bits(&mut self, count: u32) -> Result<u32> {
        let bits = self.peek_bits(count)?;
        self.skip_bits(count)?;

        Ok(bits)
    }
}

/// How bytes are turned into a sequence of bits.
pub trait BitOrder {
    /// Whether the first bit is the most significant bit of a chunk.
    const MSB_FIRST: bool;

    /// Decode the next chunk starting at `data[pos]`.
    ///
    /// Returns the chunk bits, the number of bits and the number of bytes consumed. `data` is
    /// already padded with zeros where needed.
    fn next_chunk(data: &[u8], pos: usize, state: &mut ChunkState) -> (u32, u32, usize);
}

/// State carried between chunk refills.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkState {
    /// Set once a JPEG marker has been reached.
    marker_reached: bool,
}

/// Big-endian 32-bit words, most significant bit first.
#[derive(Debug, Clone, Copy)]
pub struct Msb;

/// Little-endian 32-bit words, most significant bit first.
#[derive(Debug, Clone, Copy)]
pub struct Msb32;

/// Little-endian 16-bit words, most significant bit first.
#[derive(Debug, Clone, Copy)]
pub struct Msb16;

/// Little-endian 32-bit words, least significant bit first.
#[derive(Debug, Clone, Copy)]
pub struct Lsb;

/// Bytes with JPEG `0xFF 0x00` stuffing. A marker ends the data, and zeros are returned
/// afterwards.
#[derive(Debug, Clone, Copy)]
pub struct Jpeg;

impl BitOrder for Msb {
    const MSB_FIRST: bool = true;

    #[inline]
    fn next_chunk(data: &[u8], pos: usize, _: &mut ChunkState) -> (u32, u32, usize) {
        (u32::from_be_bytes(word(data, pos)), 32, 4)
    }
}

impl BitOrder for Msb32 {
    const MSB_FIRST: bool = true;

    #[inline]
    fn next_chunk(data: &[u8], pos: usize, _: &mut ChunkState) -> (u32, u32, usize) {
        (u32::from_le_bytes(word(data, pos)), 32, 4)
    }
}

impl BitOrder for Msb16 {
    const MSB_FIRST: bool = true;

    #[inline]
    fn next_chunk(data: &[u8], pos: usize, _: &mut ChunkState) -> (u32, u32, usize) {
        let [a, b, ..] = word(data, pos);

        (u16::from_le_bytes([a, b]) as u32, 16, 2)
    }
}

impl BitOrder for Lsb {
    const MSB_FIRST: bool = false;

    #[inline]
    fn next_chunk(data: &[u8], pos: usize, _: &mut ChunkState) -> (u32, u32, usize) {
        (u32::from_le_bytes(word(data, pos)), 32, 4)
    }
}

impl BitOrder for Jpeg {
    const MSB_FIRST: bool = true;

    fn next_chunk(data: &[u8], pos: usize, state: &mut ChunkState) -> (u32, u32, usize) {
        if state.marker_reached {
            return (0, 32, 0);
        }

        let byte = |i: usize| data.get(i).copied().unwrap_or(0);
        let mut value = 0;
        let mut read = 0;

        for _ in 0..4 {
            let b = byte(pos + read);

            if b == 0xff {
                if byte(pos + read + 1) == 0x00 {
                    read += 2;
                } else {
                    // Hit a marker. Everything from here on is padding.
                    state.marker_reached = true;
                    value <<= 8;
                    continue;
                }
            } else {
                read += 1;
            }

            value = (value << 8) | b as u32;
        }

        (value, 32, read)
    }
}

#[inline]
fn word(data: &[u8], pos: usize) -> [u8; 4] {
    core::array::from_fn(|i| data.get(pos + i).copied().unwrap_or(0))
}

/// A cached bit reader over a byte slice.
#[derive(Debug, Clone)]
pub struct BitStream<'a, O: BitOrder> {
    data: &'a [u8],
    pos: usize,
    cache: u64,
    fill_level: u32,
    state: ChunkState,
    order: PhantomData<O>,
}

/// An MSB-first reader over big-endian words.
pub type BitPumpMsb<'a> = BitStream<'a, Msb>;
/// An MSB-first reader over little-endian 32-bit words.
pub type BitPumpMsb32<'a> = BitStream<'a, Msb32>;
/// An MSB-first reader over little-endian 16-bit words.
pub type BitPumpMsb16<'a> = BitStream<'a, Msb16>;
/// An LSB-first reader over little-endian words.
pub type BitPumpLsb<'a> = BitStream<'a, Lsb>;
/// A reader over JPEG entropy-coded data.
pub type BitPumpJpeg<'a> = BitStream<'a, Jpeg>;

impl<'a, O: BitOrder> BitStream<'a, O> {
    /// Create a new bit stream.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            cache: 0,
            fill_level: 0,
            state: ChunkState::default(),
            order: PhantomData,
        }
    }

    /// Make sure that at least `count` (at most 32) bits are cached.
    #[inline]
    pub fn fill(&mut self, count: u32) -> Result<()> {
        debug_assert!(count <= 32);

        while self.fill_level < count {
            if self.pos >= self.data.len() + MARGIN {
                bail!(IoError::BitStreamOverrun);
            }

            let (chunk, bits, consumed) = O::next_chunk(self.data, self.pos, &mut self.state);

            if O::MSB_FIRST {
                self.cache = (self.cache << bits) | chunk as u64;
            } else {
                self.cache |= (chunk as u64) << self.fill_level;
            }

            self.fill_level += bits;
            self.pos += consumed;
        }

        Ok(())
    }

    /// Peek at already cached bits.
    #[inline]
    pub fn peek_bits_no_fill(&self, count: u32) -> u32 {
        debug_assert!(count <= self.fill_level && count <= 32);

        if count == 0 {
            return 0;
        }

        let mask = (1_u64 << count) - 1;

        if O::MSB_FIRST {
            ((self.cache >> (self.fill_level - count)) & mask) as u32
        } else {
            (self.cache & mask) as u32
        }
    }

    /// Drop already cached bits.
    #[inline]
    pub fn skip_bits_no_fill(&mut self, count: u32) {
        debug_assert!(count <= self.fill_level);

        self.fill_level -= count;

        if O::MSB_FIRST {
            self.cache &= if self.fill_level == 0 {
                0
            } else {
                (1_u64 << self.fill_level) - 1
            };
        } else {
            self.cache = if count == 64 { 0 } else { self.cache >> count };
        }
    }

    /// Read already cached bits.
    #[inline]
    pub fn get_bits_no_fill(&mut self, count: u32) -> u32 {
        let bits = self.peek_bits_no_fill(count);
        self.skip_bits_no_fill(count);

        bits
    }

    /// Skip `count` bits, which may be more than fit into the cache.
    pub fn skip_many(&mut self, mut count: u32) -> Result<()> {
        while count > 0 {
            let step = count.min(32);
            self.fill(step)?;
            self.skip_bits_no_fill(step);
            count -= step;
        }

        Ok(())
    }

    /// Skip to the next byte boundary of the input.
    pub fn align_to_byte(&mut self) {
        let extra = self.fill_level % 8;
        self.skip_bits_no_fill(extra);
    }

    /// The number of input bytes consumed so far, excluding whole bytes still in the cache.
    ///
    /// Not meaningful for [`Jpeg`], where stuffing bytes are dropped.
    pub fn byte_position(&self) -> usize {
        self.pos - (self.fill_level / 8) as usize
    }
}

impl<O: BitOrder> BitSource for BitStream<'_, O> {
    #[inline]
    fn peek_bits(&mut self, count: u32) -> Result<u32> {
        self.fill(count)?;

        Ok(self.peek_bits_no_fill(count))
    }

    #[inline]
    fn skip_bits(&mut self, count: u32) -> Result<()> {
        self.fill(count)?;
        self.skip_bits_no_fill(count);

        Ok(())
    }
}

/// An exact MSB-first bit reader.
///
/// Unlike [`BitStream`], this reader knows the length of its input in bits, and consuming a
/// single bit past it is an error.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_len: usize,
    cur_pos: usize,
}

impl<'a> BitReader<'a> {
    /// Create a new reader over all bits of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_bit_len(data, data.len() * 8)
    }

    /// Create a new reader over the first `bit_len` bits of `data`.
    pub fn with_bit_len(data: &'a [u8], bit_len: usize) -> Self {
        Self {
            data,
            bit_len: bit_len.min(data.len() * 8),
            cur_pos: 0,
        }
    }

    /// The number of bits that have not been consumed yet.
    pub fn bits_left(&self) -> usize {
        self.bit_len - self.cur_pos
    }

    /// The current position in bits.
    pub fn cur_pos(&self) -> usize {
        self.cur_pos
    }

    #[inline]
    fn bit_at(&self, pos: usize) -> u32 {
        if pos >= self.bit_len {
            return 0;
        }

        (self.data[pos / 8] >> (7 - pos % 8)) as u32 & 1
    }
}

impl BitSource for BitReader<'_> {
    fn peek_bits(&mut self, count: u32) -> Result<u32> {
        debug_assert!(count <= 32);

        Ok((0..count as usize).fold(0, |acc, i| (acc << 1) | self.bit_at(self.cur_pos + i)))
    }

    fn skip_bits(&mut self, count: u32) -> Result<()> {
        if count as usize > self.bits_left() {
            bail!(IoError::BitStreamOverrun);
        }

        self.cur_pos += count as usize;

        Ok(())
    }
}

/// A test-only MSB-first bit writer used to build codec inputs.
#[cfg(test)]
pub(crate) mod writer {
    /// Writes variable-width values, most significant bit first.
    #[derive(Debug, Default)]
    pub(crate) struct BitWriter {
        data: Vec<u8>,
        bit_len: usize,
    }

    impl BitWriter {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn write(&mut self, value: u32, count: u32) {
            for i in (0..count).rev() {
                let bit = (value >> i) & 1;

                if self.bit_len % 8 == 0 {
                    self.data.push(0);
                }

                if bit != 0 {
                    let last = self.data.len() - 1;
                    self.data[last] |= 0x80 >> (self.bit_len % 8);
                }

                self.bit_len += 1;
            }
        }

        pub(crate) fn bit_len(&self) -> usize {
            self.bit_len
        }

        /// Finish, padding the last byte with zeros.
        pub(crate) fn finish(self) -> Vec<u8> {
            self.data
        }

        /// Finish with JPEG byte stuffing applied.
        pub(crate) fn finish_stuffed(self) -> Vec<u8> {
            let mut out = Vec::with_capacity(self.data.len());

            for b in self.data {
                out.push(b);

                if b == 0xff {
                    out.push(0x00);
                }
            }

            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;

    #[test]
    fn msb_order() {
        let data = [0b1010_1100, 0b0101_0011, 0xff, 0x00];
        let mut bs = BitPumpMsb::new(&data);

        assert_eq!(bs.get_bits(1).unwrap(), 1);
        assert_eq!(bs.get_bits(3).unwrap(), 0b010);
        assert_eq!(bs.get_bits(8).unwrap(), 0b1100_0101);
        assert_eq!(bs.get_bits(12).unwrap(), 0b0011_1111_1111);
    }

    #[test]
    fn msb32_order() {
        let data = [0x78, 0x56, 0x34, 0x12];
        let mut bs = BitPumpMsb32::new(&data);

        assert_eq!(bs.get_bits(8).unwrap(), 0x12);
        assert_eq!(bs.get_bits(16).unwrap(), 0x3456);
    }

    #[test]
    fn msb16_order() {
        let data = [0x34, 0x12, 0x78, 0x56];
        let mut bs = BitPumpMsb16::new(&data);

        assert_eq!(bs.get_bits(4).unwrap(), 0x1);
        assert_eq!(bs.get_bits(16).unwrap(), 0x2345);
        assert_eq!(bs.get_bits(12).unwrap(), 0x678);
    }

    #[test]
    fn lsb_order() {
        let data = [0b1010_1100, 0b0101_0011, 0, 0];
        let mut bs = BitPumpLsb::new(&data);

        assert_eq!(bs.get_bits(2).unwrap(), 0b00);
        assert_eq!(bs.get_bits(4).unwrap(), 0b1011);
        assert_eq!(bs.get_bits(4).unwrap(), 0b1110);
    }

    #[test]
    fn jpeg_unstuffing() {
        let data = [0xff, 0x00, 0x12, 0xff, 0xd9, 0x34];
        let mut bs = BitPumpJpeg::new(&data);

        assert_eq!(bs.get_bits(8).unwrap(), 0xff);
        assert_eq!(bs.get_bits(8).unwrap(), 0x12);
        // Past the marker only zeros are returned, indefinitely.
        for _ in 0..100 {
            assert_eq!(bs.get_bits(16).unwrap(), 0);
        }
    }

    #[test]
    fn margin_then_overrun() {
        let data = [0xff; 4];
        let mut bs = BitPumpMsb::new(&data);

        assert_eq!(bs.get_bits(32).unwrap(), u32::MAX);

        for _ in 0..MARGIN / 4 {
            assert_eq!(bs.get_bits(32).unwrap(), 0);
        }

        assert!(matches!(
            bs.get_bits(1),
            Err(DecodeError::Io(IoError::BitStreamOverrun))
        ));
    }

    #[test]
    fn exact_reader() {
        let data = [0b0110_0000];
        let mut reader = BitReader::with_bit_len(&data, 3);

        assert_eq!(reader.peek_bits(8).unwrap(), 0b0110_0000);
        assert_eq!(reader.get_bits(2).unwrap(), 0b01);
        assert_eq!(reader.bits_left(), 1);
        assert!(reader.skip_bits(2).is_err());
        assert_eq!(reader.get_bits(1).unwrap(), 1);
    }

    #[test]
    fn writer_round_trip() {
        let mut writer = writer::BitWriter::new();
        writer.write(0b101, 3);
        writer.write(0x1234, 16);
        writer.write(0, 5);
        assert_eq!(writer.bit_len(), 24);

        let data = writer.finish();
        let mut bs = BitPumpMsb::new(&data);
        assert_eq!(bs.get_bits(3).unwrap(), 0b101);
        assert_eq!(bs.get_bits(16).unwrap(), 0x1234);
    }
}
