//! Deflate-compressed tiles, as written by DNG encoders.
//!
//! Each tile is a zlib stream of whole tile rows. Floating-point data is usually stored with
//! the floating-point predictor: the bytes of each row are split into planes (most
//! significant byte first) and every byte is stored as the difference to the byte `factor`
//! positions to its left.

use std::io::Read;

use flate2::read::ZlibDecoder;

use crate::buffer::Endianness;
use crate::cursor::ByteStream;
use crate::error::{DecodingError, Result, UnsupportedError, bail};
use crate::log::ltrace;
use crate::scheduler::DecodedTile;

/// The largest possible expansion of deflate data.
const MAX_DEFLATE_RATIO: usize = 1032;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Predictor {
    None,
    /// Integer differences between samples `factor` pixels apart.
    Horizontal(usize),
    /// Byte differences over byte planes, `factor` pixels apart.
    FloatingPoint(usize),
}

impl Predictor {
    fn from_tag(value: u32) -> Result<Self> {
        Ok(match value {
            1 => Self::None,
            2 => Self::Horizontal(1),
            34892 => Self::Horizontal(2),
            34893 => Self::Horizontal(4),
            3 => Self::FloatingPoint(1),
            34894 => Self::FloatingPoint(2),
            34895 => Self::FloatingPoint(4),
            _ => bail!(UnsupportedError::Predictor(value)),
        })
    }
}

/// A decompressor for one deflate-compressed tile.
#[derive(Debug, Clone)]
pub struct DeflateDecompressor<'a> {
    input: &'a [u8],
    endianness: Endianness,
    predictor: Predictor,
    bits_per_sample: u32,
    cpp: usize,
}

impl<'a> DeflateDecompressor<'a> {
    /// Create a new decompressor.
    ///
    /// `predictor` is the value of the TIFF `PREDICTOR` tag. Samples that are not stored in
    /// byte planes use the byte order of `input`.
    pub fn new(
        input: ByteStream<'a>,
        predictor: u32,
        bits_per_sample: u32,
        cpp: u32,
    ) -> Result<Self> {
        if !(1..=4).contains(&cpp) {
            bail!(DecodingError::ComponentMismatch {
                expected: 4,
                found: cpp,
            });
        }

        Ok(Self {
            input: input.peek_remaining(),
            endianness: input.endianness(),
            predictor: Predictor::from_tag(predictor)?,
            bits_per_sample,
            cpp: cpp as usize,
        })
    }

    /// Decode a tile of floating-point samples with 16, 24 or 32 bits.
    ///
    /// `tile_width` is the stored width of a row, `width` and `height` the part that is
    /// decoded. All of them as well as `x` are in pixels.
    pub fn decode_float_tile(
        &self,
        x: usize,
        y: usize,
        tile_width: usize,
        width: usize,
        height: usize,
    ) -> Result<DecodedTile<f32>> {
        let bytes = match self.bits_per_sample {
            16 | 24 | 32 => self.bits_per_sample as usize / 8,
            bits => bail!(UnsupportedError::BitsPerSample(bits)),
        };

        if let Predictor::Horizontal(_) = self.predictor {
            bail!(UnsupportedError::Feature("integer predictor on floating-point data"));
        }

        let (stride, samples) = self.check_geometry(tile_width, width)?;
        let mut rows = self.inflate(stride, bytes, height)?;
        let mut data = Vec::with_capacity(samples * height);

        for row in rows.chunks_exact_mut(stride * bytes) {
            if let Predictor::FloatingPoint(factor) = self.predictor {
                undo_byte_deltas(row, factor * self.cpp);

                data.extend((0..samples).map(|col| {
                    let mut value = 0_u32;

                    for plane in 0..bytes {
                        value = (value << 8) | row[col + plane * stride] as u32;
                    }

                    expand_float(value, bytes)
                }));
            } else {
                data.extend(row.chunks_exact(bytes).take(samples).map(|b| {
                    let value = b.iter().fold(0_u32, |acc, byte| (acc << 8) | *byte as u32);
                    let value = match self.endianness {
                        Endianness::Little => value.swap_bytes() >> (32 - 8 * bytes),
                        _ => value,
                    };

                    expand_float(value, bytes)
                }));
            }
        }

        Ok(DecodedTile {
            x: x * self.cpp,
            y,
            width: samples,
            data,
        })
    }

    /// Decode a tile of 8- or 16-bit integer samples. Arguments are as in
    /// [`DeflateDecompressor::decode_float_tile`].
    pub fn decode_int_tile(
        &self,
        x: usize,
        y: usize,
        tile_width: usize,
        width: usize,
        height: usize,
    ) -> Result<DecodedTile<u16>> {
        let bytes = match self.bits_per_sample {
            8 | 16 => self.bits_per_sample as usize / 8,
            bits => bail!(UnsupportedError::BitsPerSample(bits)),
        };

        if let Predictor::FloatingPoint(_) = self.predictor {
            bail!(UnsupportedError::Feature("floating-point predictor on integer data"));
        }

        let (stride, samples) = self.check_geometry(tile_width, width)?;
        let rows = self.inflate(stride, bytes, height)?;
        let mut data = Vec::with_capacity(samples * height);
        let mut row_samples = vec![0_u16; stride];

        for row in rows.chunks_exact(stride * bytes) {
            for (sample, b) in row_samples.iter_mut().zip(row.chunks_exact(bytes)) {
                *sample = match (bytes, self.endianness) {
                    (1, _) => b[0] as u16,
                    (_, Endianness::Little) => u16::from_le_bytes([b[0], b[1]]),
                    _ => u16::from_be_bytes([b[0], b[1]]),
                };
            }

            if let Predictor::Horizontal(factor) = self.predictor {
                let distance = factor * self.cpp;

                for i in distance..stride {
                    row_samples[i] = row_samples[i].wrapping_add(row_samples[i - distance]);
                }
            }

            data.extend_from_slice(&row_samples[..samples]);
        }

        Ok(DecodedTile {
            x: x * self.cpp,
            y,
            width: samples,
            data,
        })
    }

    /// Returns the samples per stored row and per decoded row.
    fn check_geometry(&self, tile_width: usize, width: usize) -> Result<(usize, usize)> {
        if tile_width == 0 || width == 0 || width > tile_width {
            bail!(DecodingError::Corrupt("decoded width exceeds tile width"));
        }

        let stride = tile_width
            .checked_mul(self.cpp)
            .ok_or(DecodingError::Corrupt("tile is too large"))?;

        Ok((stride, width * self.cpp))
    }

    /// Inflate `height` rows of `stride` samples with `bytes` bytes each.
    fn inflate(&self, stride: usize, bytes: usize, height: usize) -> Result<Vec<u8>> {
        let len = stride
            .checked_mul(bytes)
            .and_then(|row| row.checked_mul(height))
            .ok_or(DecodingError::Corrupt("tile is too large"))?;

        if len > self.input.len().saturating_mul(MAX_DEFLATE_RATIO) {
            bail!(DecodingError::Corrupt("tile is larger than its compressed data allows"));
        }

        let mut out = Vec::with_capacity(len);

        ZlibDecoder::new(self.input)
            .take(len as u64)
            .read_to_end(&mut out)
            .map_err(|_| DecodingError::Inflate)?;

        ltrace!("inflated {} of {} bytes", out.len(), len);

        if out.len() < len {
            bail!(DecodingError::Inflate);
        }

        Ok(out)
    }
}

fn undo_byte_deltas(row: &mut [u8], distance: usize) {
    for i in distance..row.len() {
        row[i] = row[i].wrapping_add(row[i - distance]);
    }
}

fn expand_float(value: u32, bytes: usize) -> f32 {
    match bytes {
        2 => f16_to_f32(value as u16),
        3 => f24_to_f32(value),
        _ => f32::from_bits(value),
    }
}

/// Widen a float with the given exponent and fraction sizes to `f32`.
fn widen_float(value: u32, exponent_bits: u32, fraction_bits: u32) -> f32 {
    let sign = (value >> (exponent_bits + fraction_bits)) & 1;
    let exponent = (value >> fraction_bits) & ((1 << exponent_bits) - 1);
    let mut fraction = (value & ((1 << fraction_bits) - 1)) << (23 - fraction_bits);

    let bias = (1 << (exponent_bits - 1)) - 1;
    let max_exponent = (1 << exponent_bits) - 1;

    let exponent = if exponent == max_exponent {
        // Infinity or NaN.
        255
    } else if exponent == 0 {
        if fraction == 0 {
            0
        } else {
            // Subnormal, which is normal in 32 bits.
            let mut e = 127 + 1 - bias;

            while fraction & (1 << 23) == 0 {
                e -= 1;
                fraction <<= 1;
            }

            fraction &= (1 << 23) - 1;
            e
        }
    } else {
        exponent + 127 - bias
    };

    f32::from_bits((sign << 31) | (exponent << 23) | fraction)
}

/// Convert an IEEE 754 binary16 value.
pub(crate) fn f16_to_f32(value: u16) -> f32 {
    widen_float(value as u32, 5, 10)
}

/// Convert a 24-bit float with 7 exponent and 16 fraction bits.
pub(crate) fn f24_to_f32(value: u32) -> f32 {
    widen_float(value, 7, 16)
}
