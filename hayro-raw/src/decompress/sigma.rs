//! The predictive prefix-code codec of Sigma X3F files.
//!
//! Formats 30 and 35 store three planes, each coded with one small table of (length, code)
//! pairs. A code selects the number of difference bits that follow it, and each sample is
//! predicted from the sample two positions to the left. Format 35 stores the first two
//! planes at half resolution.
//!
//! Format 6 stores interleaved pixels, row by row, with a table of up to 1024 codes that map
//! to entries of a curve of differences.

use crate::bits::{BitPumpMsb, BitSource};
use crate::cursor::ByteStream;
use crate::error::{DecodingError, FormatError, Result, UnsupportedError, bail};
use crate::huffman::extend;
use crate::image::{Array2dMut, RawImage};
use crate::log::ldebug;
use crate::scheduler::{collect_errors, decode_rows, map_in_parallel};
use crate::util::{clamp_bits, round_up};

const INVALID_CODE: u8 = 0xff;
const FAST_BITS: u32 = 14;
const FAST_MISS: i32 = 0xf;
const MAX_CURVE_CODE_LEN: u32 = 26;
const CURVE_LEN: usize = 1024;

/// The code table of formats 30 and 35.
struct PlaneCodes {
    // Indexed by the top 8 bits: `(value bits << 4) | code length`.
    codes: [u8; 256],
    // Indexed by the top 14 bits: `(value << 8) | consumed bits`, or `FAST_MISS`.
    fast: Vec<i32>,
}

impl PlaneCodes {
    fn parse(bs: &mut ByteStream<'_>, count: u32) -> Result<Self> {
        let mut codes = [INVALID_CODE; 256];

        for i in 0..count {
            let len = bs.get_u8()? as u32;
            let code = bs.get_u8()? as usize;

            if len > 8 {
                bail!(DecodingError::InvalidHuffmanTable("code longer than 8 bits"));
            }

            for j in 0..1_usize << (8 - len) {
                codes[(code | j) & 0xff] = ((i << 4) | len) as u8;
            }
        }

        let fast = (0..1_u32 << FAST_BITS)
            .map(|i| {
                let entry = codes[(i >> 6) as usize];

                if entry == INVALID_CODE {
                    return FAST_MISS;
                }

                let code_bits = (entry & 0xf) as u32;
                let value_bits = (entry >> 4) as u32;

                if code_bits + value_bits >= FAST_BITS {
                    return FAST_MISS;
                }

                let low = FAST_BITS - code_bits - value_bits;
                let raw = (i >> low) & ((1 << value_bits) - 1);

                (extend(raw, value_bits) << 8) | (code_bits + value_bits) as i32
            })
            .collect();

        Ok(Self { codes, fast })
    }

    /// Find the code at the cursor. Returns the number of code bits and value bits.
    fn lookup(&self, code: u32) -> Result<(u32, u32)> {
        let entry = self.codes[(code >> 6) as usize];

        if entry == INVALID_CODE {
            bail!(DecodingError::InvalidHuffmanCode);
        }

        Ok(((entry & 0xf) as u32, (entry >> 4) as u32))
    }

    fn decode(&self, bits: &mut BitPumpMsb<'_>) -> Result<i32> {
        bits.fill(32)?;
        let code = bits.peek_bits_no_fill(FAST_BITS);
        let fast = self.fast[code as usize];

        if fast != FAST_MISS {
            bits.skip_bits_no_fill((fast & 0xff) as u32);

            return Ok(fast >> 8);
        }

        let (code_bits, value_bits) = self.lookup(code)?;
        bits.skip_bits_no_fill(code_bits);

        if value_bits == 0 {
            return Ok(0);
        }

        Ok(extend(bits.get_bits_no_fill(value_bits), value_bits))
    }

    fn skip(&self, bits: &mut BitPumpMsb<'_>) -> Result<()> {
        bits.fill(32)?;
        let code = bits.peek_bits_no_fill(FAST_BITS);
        let (code_bits, value_bits) = self.lookup(code)?;
        bits.skip_bits_no_fill(code_bits + value_bits);

        Ok(())
    }
}

/// Decodes the image sections of X3F files.
#[derive(Debug)]
pub struct SigmaDecompressor<'a> {
    input: ByteStream<'a>,
    format: u32,
}

impl<'a> SigmaDecompressor<'a> {
    /// Create a decompressor for an image section payload of the given format.
    pub fn new(input: ByteStream<'a>, format: u32) -> Self {
        Self { input, format }
    }

    /// Decode into `image`, which must be allocated with three components per pixel.
    pub fn decode(&self, image: &mut RawImage, threads: usize) -> Result<()> {
        if image.cpp() != 3 {
            bail!(DecodingError::ComponentMismatch {
                expected: 3,
                found: image.cpp(),
            });
        }

        match self.format {
            30 | 35 => self.decode_planes(image, threads),
            6 => self.decode_curve(image, threads),
            format => bail!(UnsupportedError::Compression(format)),
        }
    }

    fn decode_planes(&self, image: &mut RawImage, threads: usize) -> Result<()> {
        let mut bs = self.input;
        let dim = image.uncropped_dim();
        let subsampled = self.format == 35;

        let mut plane_dims = [(dim.x as usize, dim.y as usize); 3];

        if subsampled {
            for d in &mut plane_dims {
                *d = (bs.get_u16()? as usize, bs.get_u16()? as usize);
            }
        }

        let mut pred = [0; 3];

        for p in &mut pred {
            *p = bs.get_u16()? as i32;
        }

        bs.skip_bytes(2)?;
        let codes = PlaneCodes::parse(&mut bs, if subsampled { 15 } else { 13 })?;
        bs.skip_bytes(if subsampled { 6 } else { 2 })?;

        let mut sizes = [0_u32; 3];

        for s in &mut sizes {
            *s = bs.get_u32()?;
        }

        let mut offset = bs.position();
        let mut planes = Vec::with_capacity(3);

        for (i, &size) in sizes.iter().enumerate() {
            let (plane_width, height) = plane_dims[i];
            let width = plane_width.min(dim.x as usize);

            planes.push((
                i,
                PlaneGeometry {
                    width,
                    height,
                    skip: plane_width - width,
                    subsampling: u32::from(subsampled && i < 2),
                    pred: pred[i],
                },
                bs.get_sub_stream(offset, size)?,
            ));

            // Planes are 16-byte aligned.
            offset = round_up(offset as usize + size as usize, 16)
                .try_into()
                .map_err(|_| FormatError::Corrupt("plane offset overflows"))?;
        }

        ldebug!("decoding {} sigma planes of format {}", planes.len(), self.format);

        collect_errors(image, |image, errors| {
            let decoded = map_in_parallel(planes, threads, errors, |_, (i, geometry, data)| {
                Ok((i, geometry.subsampling, geometry.width, decode_plane(&codes, data, &geometry)?))
            })?;

            let mut out = image.as_array2d_mut::<u16>()?;

            for (_, (component, subsampling, width, samples)) in decoded {
                for (y, row) in samples.chunks_exact(width.max(1)).enumerate() {
                    let ty = y << subsampling;

                    if ty >= out.height() {
                        break;
                    }

                    let dest = out.row_mut(ty);

                    for (x, &v) in row.iter().enumerate() {
                        if let Some(d) = dest.get_mut(((x << subsampling) * 3) + component) {
                            *d = v;
                        }
                    }
                }
            }

            if subsampled {
                let (w, h) = plane_dims[0];
                interpolate_subsampled(&mut out, w, h);
            }

            Ok(())
        })
    }

    fn decode_curve(&self, image: &mut RawImage, threads: usize) -> Result<()> {
        let mut bs = self.input;
        let dim = image.uncropped_dim();
        let height = dim.y as usize;
        let width = dim.x as usize;

        let mut curve = [0_i32; CURVE_LEN];

        for c in &mut curve {
            *c = bs.get_u16()? as i16 as i32;
        }

        let mut entries = Vec::with_capacity(CURVE_LEN);
        let mut max_len = 0;

        for _ in 0..CURVE_LEN {
            let v = bs.get_u32()?;
            let len = v >> 27;
            max_len = max_len.max(len);
            entries.push((len, v & 0x7ff_ffff));
        }

        if max_len > MAX_CURVE_CODE_LEN {
            bail!(DecodingError::InvalidHuffmanTable("code longer than 26 bits"));
        }

        let mut table = vec![u16::MAX; 1 << max_len];

        for (i, &(len, code)) in entries.iter().enumerate() {
            if len == 0 {
                continue;
            }

            let code = code & ((1 << len) - 1);
            let rem = max_len - len;
            let top = (code << rem) as usize;
            table[top..top + (1 << rem)].fill(((i as u16) << 5) | len as u16);
        }

        let data_start = bs.position();
        let offsets_start = bs
            .size()
            .checked_sub(height as u32 * 4)
            .ok_or(FormatError::Corrupt("no room for row offsets"))?;
        let mut offsets = bs.get_sub_stream(offsets_start, height as u32 * 4)?;
        let mut rows = Vec::with_capacity(height);

        for _ in 0..height {
            let offset = offsets.get_u32()? as u64 + data_start as u64;

            if offset >= bs.size() as u64 {
                bail!(FormatError::Corrupt("row offset outside of the image data"));
            }

            rows.push(offset as u32);
        }

        let data = bs.buffer().data();

        collect_errors(image, |image, errors| {
            let out = image.as_array2d_mut::<u16>()?;

            decode_rows(out, threads, errors, |range, band| {
                for (i, y) in range.enumerate() {
                    let mut bits = BitPumpMsb::new(&data[rows[y] as usize..]);
                    let dest = band.row_mut(i);
                    let mut pred = [0_i32; 3];

                    for x in 0..width {
                        for (c, p) in pred.iter_mut().enumerate() {
                            bits.fill(32)?;
                            let entry = table[bits.peek_bits_no_fill(max_len) as usize];

                            if entry == u16::MAX {
                                bail!(DecodingError::InvalidHuffmanCode);
                            }

                            bits.skip_bits_no_fill((entry & 31) as u32);
                            *p += curve[(entry >> 5) as usize];
                            dest[x * 3 + c] = clamp_bits(*p, 16);
                        }
                    }
                }

                Ok(())
            })
        })
    }
}

struct PlaneGeometry {
    width: usize,
    height: usize,
    // Values per row that are decoded but not stored.
    skip: usize,
    // log2 of the subsampling factor.
    subsampling: u32,
    pred: i32,
}

fn decode_plane(
    codes: &PlaneCodes,
    data: ByteStream<'_>,
    geometry: &PlaneGeometry,
) -> Result<Vec<u16>> {
    let &PlaneGeometry {
        width,
        height,
        skip,
        pred,
        ..
    } = geometry;
    let mut bits = BitPumpMsb::new(data.peek_remaining());
    let mut out = vec![0_u16; width * height];
    let mut pred_up = [pred; 4];

    for y in 0..height {
        let row = &mut out[y * width..(y + 1) * width];
        let phase = y & 1;

        pred_up[phase] += codes.decode(&mut bits)?;
        pred_up[phase + 2] += codes.decode(&mut bits)?;
        let mut left = [pred_up[phase], pred_up[phase + 2]];

        for x in (0..width).step_by(2) {
            if x > 0 {
                left[0] += codes.decode(&mut bits)?;
                left[1] += codes.decode(&mut bits)?;
            }

            row[x] = left[0] as u16;

            if let Some(d) = row.get_mut(x + 1) {
                *d = left[1] as u16;
            }
        }

        for _ in 0..skip {
            codes.skip(&mut bits)?;
        }
    }

    Ok(out)
}

/// Fill in the two half-resolution planes using the detail of the full-resolution plane.
fn interpolate_subsampled(
    out: &mut Array2dMut<'_, u16>,
    plane_width: usize,
    plane_height: usize,
) {
    let width = out.width() / 3;

    for y in 0..plane_height {
        let (top, bottom) = (y * 2, y * 2 + 1);

        if bottom >= out.height() {
            break;
        }

        for x in 0..plane_width {
            let (left, right) = (x * 2, x * 2 + 1);

            if right >= width {
                break;
            }

            let blue = |out: &Array2dMut<'_, u16>, row: usize, px: usize| {
                out.row(row)[px * 3 + 2] as i32
            };

            let corners = [(top, left), (top, right), (bottom, left), (bottom, right)];
            let blues = corners.map(|(r, px)| blue(out, r, px));
            let blue_mid = (blues.iter().sum::<i32>() + 2) >> 2;

            for c in 0..2 {
                let avg = out.row(top)[left * 3 + c] as i32;

                for (&(r, px), &b) in corners.iter().zip(&blues) {
                    out.row_mut(r)[px * 3 + c] = clamp_bits(b - blue_mid + avg, 16);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bits::writer::BitWriter;
    use crate::buffer::Endianness;
    use crate::error::DecodeError;
    use crate::image::{Point, RawImageType};
    use crate::testutil::difference_bits;

    // (length, code) for 0 to 12 difference bits.
    const CODES: [(u32, u32); 13] = [
        (2, 0b00),
        (2, 0b01),
        (3, 0b100),
        (3, 0b101),
        (4, 0b1100),
        (4, 0b1101),
        (5, 0b11100),
        (5, 0b11101),
        (6, 0b111100),
        (6, 0b111101),
        (7, 0b1111100),
        (7, 0b1111101),
        (8, 0b11111100),
    ];

    fn image(width: i32, height: i32) -> RawImage {
        let mut image = RawImage::new(RawImageType::U16);
        image.set_dim(Point::new(width, height)).unwrap();
        image.set_cpp(3).unwrap();
        image.create_data(1000).unwrap();

        image
    }

    fn encode_plane(samples: &[Vec<i32>], pred: i32) -> Vec<u8> {
        let mut w = BitWriter::new();
        let mut pred_up = [pred; 4];
        let mut put = |diff: i32| {
            let (bits, len) = difference_bits(diff);
            let (code_len, code) = CODES[len as usize];
            w.write(code, code_len);
            w.write(bits, len);
        };

        for (y, row) in samples.iter().enumerate() {
            let phase = y & 1;
            put(row[0] - pred_up[phase]);
            put(row[1] - pred_up[phase + 2]);
            pred_up[phase] = row[0];
            pred_up[phase + 2] = row[1];

            for x in (2..row.len()).step_by(2) {
                put(row[x] - row[x - 2]);
                put(row[x + 1] - row[x - 1]);
            }
        }

        let mut data = w.finish();
        data.resize(data.len() + 4, 0);

        data
    }

    /// A format 30 payload with the three planes of an image.
    pub(crate) fn format30(planes: &[Vec<Vec<i32>>; 3], pred: [u16; 3]) -> Vec<u8> {
        let mut out = Vec::new();

        for p in pred {
            out.extend(p.to_le_bytes());
        }

        out.extend([0, 0]);

        for (len, code) in CODES {
            out.push(len as u8);
            out.push((code << (8 - len)) as u8);
        }

        out.extend([0, 0]);

        let encoded: Vec<Vec<u8>> = planes
            .iter()
            .zip(pred)
            .map(|(p, pred)| encode_plane(p, pred as i32))
            .collect();

        for e in &encoded {
            out.extend((e.len() as u32).to_le_bytes());
        }

        assert_eq!(out.len(), 48);

        for e in &encoded {
            out.extend(e);
            out.resize(round_up(out.len(), 16), 0);
        }

        out
    }

    #[test]
    fn format30_round_trip() {
        let planes: [Vec<Vec<i32>>; 3] = core::array::from_fn(|c| {
            (0..3)
                .map(|y| {
                    (0..4)
                        .map(|x| 100 + c as i32 * 1000 + ((x * 37 + y * 101) % 300) - 150)
                        .collect()
                })
                .collect()
        });
        let data = format30(&planes, [100, 1100, 2100]);

        let mut img = image(4, 3);
        let bs = ByteStream::from_slice(&data, Endianness::Little).unwrap();
        SigmaDecompressor::new(bs, 30).decode(&mut img, 2).unwrap();

        let view = img.as_array2d::<u16>().unwrap();

        for y in 0..3 {
            for x in 0..4 {
                for c in 0..3 {
                    assert_eq!(view.row(y)[x * 3 + c] as i32, planes[c][y][x]);
                }
            }
        }

        assert!(img.errors().is_empty());
    }

    #[test]
    fn broken_plane_is_reported() {
        let planes: [Vec<Vec<i32>>; 3] = core::array::from_fn(|_| vec![vec![5, 6]; 2]);
        let mut data = format30(&planes, [0, 0, 0]);
        // The first plane starts with an invalid code.
        data[48] = 0xff;
        data[49] = 0xff;

        let mut img = image(2, 2);
        let bs = ByteStream::from_slice(&data, Endianness::Little).unwrap();
        SigmaDecompressor::new(bs, 30).decode(&mut img, 1).unwrap();

        assert_eq!(img.errors().len(), 1);
        assert_eq!(img.as_array2d::<u16>().unwrap().row(0), [0, 5, 5, 0, 6, 6]);
    }

    #[test]
    fn long_codes_are_rejected() {
        let mut data = vec![0_u8; 6 + 2];
        data.extend([9, 0]);
        data.resize(200, 0);

        let mut img = image(2, 2);
        let bs = ByteStream::from_slice(&data, Endianness::Little).unwrap();

        assert_eq!(
            SigmaDecompressor::new(bs, 30).decode(&mut img, 1).unwrap_err(),
            DecodeError::Decoding(DecodingError::InvalidHuffmanTable("code longer than 8 bits"))
        );
    }

    fn format6(rows: &[Vec<u8>], entries: &[(u32, u32)]) -> Vec<u8> {
        let mut out = Vec::new();

        // Curve entry `i` is the difference `i - 2`.
        for i in 0..CURVE_LEN as i16 {
            out.extend((i - 2).to_le_bytes());
        }

        for i in 0..CURVE_LEN {
            let (len, code) = entries.get(i).copied().unwrap_or((0, 0));
            out.extend(((len << 27) | code).to_le_bytes());
        }

        let mut offsets = Vec::new();
        let start = out.len();

        for row in rows {
            offsets.push((out.len() - start) as u32);
            out.extend(row);
            out.extend([0; 4]);
        }

        for o in offsets {
            out.extend(o.to_le_bytes());
        }

        out
    }

    #[test]
    fn format6_rows() {
        // Curve indices 0..=4 with codes 00, 01, 10, 110, 111.
        let entries = [(2, 0b00), (2, 0b01), (2, 0b10), (3, 0b110), (3, 0b111)];
        let encode = |indices: &[u32]| {
            let mut w = BitWriter::new();

            for &i in indices {
                let (len, code) = entries[i as usize];
                w.write(code, len);
            }

            w.finish()
        };

        // Row 0: +2 +1 +0 then +1 +2 +0. Row 1: +0 +0 +2 then -1 -2 -2.
        let rows = [encode(&[4, 3, 2, 3, 4, 2]), encode(&[2, 2, 4, 1, 0, 0])];
        let data = format6(&rows, &entries);

        let mut img = image(2, 2);
        let bs = ByteStream::from_slice(&data, Endianness::Little).unwrap();
        SigmaDecompressor::new(bs, 6).decode(&mut img, 2).unwrap();

        let view = img.as_array2d::<u16>().unwrap();
        assert_eq!(view.row(0), [2, 1, 0, 3, 3, 0]);
        assert_eq!(view.row(1), [0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn format6_invalid_code() {
        let entries = [(2, 0b00)];
        let rows = [vec![0xff; 4], vec![0xff; 4]];
        let data = format6(&rows, &entries);

        let mut img = image(1, 2);
        let bs = ByteStream::from_slice(&data, Endianness::Little).unwrap();

        assert_eq!(
            SigmaDecompressor::new(bs, 6).decode(&mut img, 1).unwrap_err(),
            DecodeError::Decoding(DecodingError::InvalidHuffmanCode)
        );
    }
}
