//! The block codec of Canon CRW files.
//!
//! The high 10 bits of each sample are coded in blocks of 64 differences with two prefix
//! codes: one for the first difference of a block and one for the remaining ones, which also
//! encode runs of zeros. Even and odd samples of a row have separate predictors. The low 2
//! bits may be stored uncompressed in front of the coded data.

use crate::bits::{BitPumpJpeg, BitSource};
use crate::cursor::ByteStream;
use crate::error::{DecodingError, Result, UnsupportedError, bail};
use crate::huffman::{HuffmanTable, PrefixCode, extend};
use crate::image::{Array2dMut, RawImage, RawImageType};
use crate::log::ldebug;

const MAX_WIDTH: u32 = 4104;
const MAX_HEIGHT: u32 = 3048;
const BLOCK_LEN: usize = 64;
const BASE: i32 = 512;
// Bytes between the low bits and the coded high bits.
pub(crate) const GAP: u32 = 514;

const FIRST_COUNTS: [[u8; 16]; 3] = [
    [0, 1, 4, 2, 3, 1, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    [0, 2, 2, 3, 1, 1, 1, 1, 2, 0, 0, 0, 0, 0, 0, 0],
    [0, 0, 6, 3, 1, 1, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0],
];

const FIRST_VALUES: [[u8; 12]; 3] = [
    [0x04, 0x03, 0x05, 0x06, 0x02, 0x07, 0x01, 0x08, 0x09, 0x00, 0x0a, 0x0b],
    [0x03, 0x02, 0x04, 0x01, 0x05, 0x00, 0x06, 0x07, 0x09, 0x08, 0x0a, 0x0b],
    [0x06, 0x05, 0x07, 0x04, 0x08, 0x03, 0x09, 0x02, 0x00, 0x0a, 0x01, 0x0b],
];

const SECOND_COUNTS: [[u8; 16]; 3] = [
    [0, 2, 2, 2, 1, 4, 2, 1, 2, 5, 1, 1, 0, 0, 0, 139],
    [0, 2, 2, 1, 4, 1, 4, 1, 3, 3, 1, 0, 0, 0, 0, 140],
    [0, 0, 6, 2, 1, 3, 3, 2, 5, 1, 2, 2, 8, 10, 0, 117],
];

const SECOND_VALUES: [[u8; 162]; 3] = [
    [
        0x03, 0x04, 0x02, 0x05, 0x01, 0x06, 0x07, 0x08, 0x12, 0x13, 0x11, 0x14, 0x09, 0x15,
        0x22, 0x00, 0x21, 0x16, 0x0a, 0xf0, 0x23, 0x17, 0x24, 0x31, 0x32, 0x18, 0x19, 0x33,
        0x25, 0x41, 0x34, 0x42, 0x35, 0x51, 0x36, 0x37, 0x38, 0x29, 0x79, 0x26, 0x1a, 0x39,
        0x56, 0x57, 0x28, 0x27, 0x52, 0x55, 0x58, 0x43, 0x76, 0x59, 0x77, 0x54, 0x61, 0xf9,
        0x71, 0x78, 0x75, 0x96, 0x97, 0x49, 0xb7, 0x53, 0xd7, 0x74, 0xb6, 0x98, 0x47, 0x48,
        0x95, 0x69, 0x99, 0x91, 0xfa, 0xb8, 0x68, 0xb5, 0xb9, 0xd6, 0xf7, 0xd8, 0x67, 0x46,
        0x45, 0x94, 0x89, 0xf8, 0x81, 0xd5, 0xf6, 0xb4, 0x88, 0xb1, 0x2a, 0x44, 0x72, 0xd9,
        0x87, 0x66, 0xd4, 0xf5, 0x3a, 0xa7, 0x73, 0xa9, 0xa8, 0x86, 0x62, 0xc7, 0x65, 0xc8,
        0xc9, 0xa1, 0xf4, 0xd1, 0xe9, 0x5a, 0x92, 0x85, 0xa6, 0xe7, 0x93, 0xe8, 0xc1, 0xc6,
        0x7a, 0x64, 0xe1, 0x4a, 0x6a, 0xe6, 0xb3, 0xf1, 0xd3, 0xa5, 0x8a, 0xb2, 0x9a, 0xba,
        0x84, 0xa4, 0x63, 0xe5, 0xc5, 0xf3, 0xd2, 0xc4, 0x82, 0xaa, 0xda, 0xe4, 0xf2, 0xca,
        0x83, 0xa3, 0xa2, 0xc3, 0xea, 0xc2, 0xe2, 0xe3,
    ],
    [
        0x02, 0x03, 0x01, 0x04, 0x05, 0x12, 0x11, 0x06, 0x13, 0x07, 0x08, 0x14, 0x22, 0x09,
        0x21, 0x00, 0x23, 0x15, 0x31, 0x32, 0x0a, 0x16, 0xf0, 0x24, 0x33, 0x41, 0x42, 0x19,
        0x17, 0x25, 0x18, 0x51, 0x34, 0x43, 0x52, 0x29, 0x35, 0x61, 0x39, 0x71, 0x62, 0x36,
        0x53, 0x26, 0x38, 0x1a, 0x37, 0x81, 0x27, 0x91, 0x79, 0x55, 0x45, 0x28, 0x72, 0x59,
        0xa1, 0xb1, 0x44, 0x69, 0x54, 0x58, 0xd1, 0xfa, 0x57, 0xe1, 0xf1, 0xb9, 0x49, 0x47,
        0x63, 0x6a, 0xf9, 0x56, 0x46, 0xa8, 0x2a, 0x4a, 0x78, 0x99, 0x3a, 0x75, 0x74, 0x86,
        0x65, 0xc1, 0x76, 0xb6, 0x96, 0xd6, 0x89, 0x85, 0xc9, 0xf5, 0x95, 0xb4, 0xc7, 0xf7,
        0x8a, 0x97, 0xb8, 0x73, 0xb7, 0xd8, 0xd9, 0x87, 0xa7, 0x7a, 0x48, 0x82, 0x84, 0xea,
        0xf4, 0xa6, 0xc5, 0x5a, 0x94, 0xa4, 0xc6, 0x92, 0xc3, 0x68, 0xb5, 0xc8, 0xe4, 0xe5,
        0xe6, 0xe9, 0xa2, 0xa3, 0xe3, 0xc2, 0x66, 0x67, 0x93, 0xaa, 0xd4, 0xd5, 0xe7, 0xf8,
        0x88, 0x9a, 0xd7, 0x77, 0xc4, 0x64, 0xe2, 0x98, 0xa5, 0xca, 0xda, 0xe8, 0xf3, 0xf6,
        0xa9, 0xb2, 0xb3, 0xf2, 0xd2, 0x83, 0xba, 0xd3,
    ],
    [
        0x04, 0x05, 0x03, 0x06, 0x02, 0x07, 0x01, 0x08, 0x09, 0x12, 0x13, 0x14, 0x11, 0x15,
        0x0a, 0x16, 0x17, 0xf0, 0x00, 0x22, 0x21, 0x18, 0x23, 0x19, 0x24, 0x32, 0x31, 0x25,
        0x33, 0x38, 0x37, 0x34, 0x35, 0x36, 0x39, 0x79, 0x57, 0x58, 0x59, 0x28, 0x56, 0x78,
        0x27, 0x41, 0x29, 0x77, 0x26, 0x42, 0x76, 0x99, 0x1a, 0x55, 0x98, 0x97, 0xf9, 0x48,
        0x54, 0x96, 0x89, 0x47, 0xb7, 0x49, 0xfa, 0x75, 0x68, 0xb6, 0x67, 0x69, 0xb9, 0xb8,
        0xd8, 0x52, 0xd7, 0x88, 0xb5, 0x74, 0x51, 0x46, 0xd9, 0xf8, 0x3a, 0xd6, 0x87, 0x45,
        0x7a, 0x95, 0xd5, 0xf6, 0x86, 0xb4, 0xa9, 0x94, 0x53, 0x2a, 0xa8, 0x43, 0xf5, 0xf7,
        0xd4, 0x66, 0xa7, 0x5a, 0x44, 0x8a, 0xc9, 0xe8, 0xc8, 0xe7, 0x9a, 0x6a, 0x73, 0x4a,
        0x61, 0xc7, 0xf4, 0xc6, 0x65, 0xe9, 0x72, 0xe6, 0x71, 0x91, 0x93, 0xa6, 0xda, 0x92,
        0x85, 0x62, 0xf3, 0xc5, 0xb2, 0xa4, 0x84, 0xba, 0x64, 0xa5, 0xb3, 0xd2, 0x81, 0xe5,
        0xd3, 0xaa, 0xc4, 0xca, 0xf2, 0xb1, 0xe4, 0xd1, 0x83, 0x63, 0xea, 0xc3, 0xe2, 0x82,
        0xf1, 0xa3, 0xc2, 0xa1, 0xc1, 0xe3, 0xa2, 0xe1,
    ],
];

/// The two prefix codes of table set `index`.
pub(crate) fn prefix_codes(index: u32) -> Result<[PrefixCode; 2]> {
    let i = index as usize;

    if i >= FIRST_COUNTS.len() {
        bail!(UnsupportedError::Feature("CRW decoder table"));
    }

    let widen = |values: &[u8]| values.iter().map(|v| *v as u16).collect::<Vec<_>>();

    Ok([
        PrefixCode::from_counts(&FIRST_COUNTS[i], &widen(&FIRST_VALUES[i]))?,
        PrefixCode::from_counts(&SECOND_COUNTS[i], &widen(&SECOND_VALUES[i]))?,
    ])
}

/// A decompressor for the raw data of a CRW file.
#[derive(Debug, Clone)]
pub struct CrwDecompressor<'a> {
    low_bits: Option<&'a [u8]>,
    high_bits: &'a [u8],
    tables: [HuffmanTable; 2],
}

impl<'a> CrwDecompressor<'a> {
    /// Create a decompressor for `image` using the decoder table set `table` (0 to 2).
    ///
    /// If `low_bits` is set, the stream starts with the packed low 2 bits of every sample.
    pub fn new(
        image: &RawImage,
        table: u32,
        low_bits: bool,
        mut input: ByteStream<'a>,
    ) -> Result<Self> {
        if image.cpp() != 1 || image.data_type() != RawImageType::U16 {
            bail!(UnsupportedError::Feature("CRW image layout"));
        }

        let dim = image.uncropped_dim();
        let (width, height) = (dim.x.max(0) as u32, dim.y.max(0) as u32);

        if width == 0
            || height == 0
            || width % 4 != 0
            || width > MAX_WIDTH
            || height > MAX_HEIGHT
            || (width * height) as usize % BLOCK_LEN != 0
        {
            bail!(DecodingError::InvalidDimensions { width, height });
        }

        let low_bits = if low_bits {
            Some(input.get_bytes(width * height / 4)?)
        } else {
            None
        };

        input.skip_bytes(GAP)?;

        let [first, second] = prefix_codes(table)?;

        Ok(Self {
            low_bits,
            high_bits: input.peek_remaining(),
            tables: [
                HuffmanTable::new(&first, false, false)?,
                HuffmanTable::new(&second, false, false)?,
            ],
        })
    }

    /// Decode the whole image.
    pub fn decode(&self, image: &mut RawImage) -> Result<()> {
        let mut out = image.as_array2d_mut::<u16>()?;
        ldebug!(
            "decoding crw image {}x{}, low bits: {}",
            out.width(),
            out.height(),
            self.low_bits.is_some()
        );

        self.decode_high_bits(&mut out)?;

        if let Some(low_bits) = self.low_bits {
            merge_low_bits(&mut out, low_bits);
        }

        Ok(())
    }

    fn decode_block(&self, bits: &mut BitPumpJpeg<'_>, diffs: &mut [i32; BLOCK_LEN]) -> Result<()> {
        let mut i = 0;

        while i < BLOCK_LEN {
            let value = self.tables[usize::from(i > 0)].decode_code_value(bits)?;
            let len = (value & 0xf) as u32;
            let run = (value >> 4) as usize;

            if len == 0 && run == 0 && i > 0 {
                break;
            }

            if len == 0xf && run == 0xf {
                i += 1;
                continue;
            }

            i += run;

            if len == 0 {
                i += 1;
                continue;
            }

            let diff = bits.get_bits(len)?;

            if i >= BLOCK_LEN {
                break;
            }

            diffs[i] = extend(diff, len);
            i += 1;
        }

        Ok(())
    }

    fn decode_high_bits(&self, out: &mut Array2dMut<'_, u16>) -> Result<()> {
        let width = out.width();
        let blocks = width * out.height() / BLOCK_LEN;
        let mut bits = BitPumpJpeg::new(self.high_bits);

        let mut carry = 0;
        let mut base = [BASE; 2];
        let (mut row, mut col) = (0, 0);

        for _ in 0..blocks {
            let mut diffs = [0; BLOCK_LEN];
            self.decode_block(&mut bits, &mut diffs)?;

            diffs[0] += carry;
            carry = diffs[0];

            for (k, diff) in diffs.iter().enumerate() {
                // Rows do not necessarily start with a block.
                if col == width {
                    col = 0;
                    row += 1;
                    base = [BASE; 2];
                }

                let predicted = &mut base[k & 1];
                *predicted += diff;

                if !(0..1 << 10).contains(&*predicted) {
                    bail!(DecodingError::ValueOutOfRange);
                }

                out.row_mut(row)[col] = *predicted as u16;
                col += 1;
            }
        }

        Ok(())
    }
}

fn merge_low_bits(out: &mut Array2dMut<'_, u16>, low_bits: &[u8]) {
    let width = out.width();
    let mut packed = low_bits.iter();

    for row in 0..out.height() {
        for group in out.row_mut(row).chunks_exact_mut(4) {
            let c = packed.next().copied().unwrap_or(0);

            for (p, pixel) in group.iter_mut().enumerate() {
                let mut value = (*pixel << 2) | ((c >> (2 * p)) & 3) as u16;

                // Quirk of cameras with this sensor width.
                if width == 2672 && value < 512 {
                    value += 2;
                }

                *pixel = value;
            }
        }
    }
}
