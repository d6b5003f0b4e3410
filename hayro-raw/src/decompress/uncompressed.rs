//! Uncompressed and bit-packed samples.

use crate::bits::{BitOrder, BitSource, BitStream, Lsb, Msb, Msb16, Msb32};
use crate::cursor::ByteStream;
use crate::error::{DecodingError, IoError, Result, UnsupportedError, bail};
use crate::image::{Array2dMut, Point, RawImage, RawImageType};

/// Recorded on the image when the input ends before the last row.
pub const TRUNCATED: &str = "Image truncated (file is too short)";

/// How samples are packed into bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitPacking {
    /// Most significant bit first, byte by byte.
    Msb,
    /// Most significant bit first within little-endian 16-bit words.
    Msb16,
    /// Most significant bit first within little-endian 32-bit words.
    Msb32,
    /// Least significant bit first.
    Lsb,
}

/// Layouts of 12-bit packed data, two samples in three bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packed12 {
    /// Low nibble of the middle byte belongs to the first sample.
    Little,
    /// High nibble of the middle byte belongs to the first sample.
    Big,
    /// Little-endian with a control byte after every ten samples.
    LittleWithControl,
    /// Big-endian with a control byte after every ten samples.
    BigWithControl,
    /// Big-endian with even rows first and odd rows starting at the next 2048-byte boundary.
    BigInterlaced,
}

/// Reads uncompressed samples from an input stream into a raw image.
///
/// Short input is handled uniformly: as many complete rows as present are decoded and
/// "Image truncated (file is too short)" is recorded on the image. If not a single row is
/// present, decoding fails.
#[derive(Debug)]
pub struct UncompressedDecompressor<'a> {
    input: ByteStream<'a>,
}

impl<'a> UncompressedDecompressor<'a> {
    /// Create a new decompressor over `input`.
    pub fn new(input: ByteStream<'a>) -> Self {
        Self { input }
    }

    /// The number of complete rows present, consuming nothing.
    fn complete_rows(&self, per_row: u64, rows: u64) -> Result<usize> {
        let remaining = self.input.remain_size() as u64;

        if remaining >= per_row * rows {
            return Ok(rows as usize);
        }

        if per_row == 0 || remaining < per_row {
            bail!(IoError::BufferOverflow {
                offset: self.input.position() as u64,
                count: per_row,
                size: remaining,
            });
        }

        Ok((remaining / per_row) as usize)
    }

    /// Like `complete_rows`, recording the truncation on the image.
    fn available_rows(&self, image: &RawImage, per_row: u64, rows: u64) -> Result<usize> {
        let available = self.complete_rows(per_row, rows)?;

        if (available as u64) < rows {
            image.set_error(TRUNCATED);
        }

        Ok(available)
    }

    /// Read `size` pixels of `bits` bits each into the image at `offset`.
    ///
    /// Rows in the input are `input_pitch` bytes apart. Float images only accept 32-bit
    /// little-endian samples.
    pub fn read_uncompressed_raw(
        &mut self,
        image: &mut RawImage,
        size: Point,
        offset: Point,
        input_pitch: u32,
        bits: u32,
        packing: BitPacking,
    ) -> Result<()> {
        let dim = image.uncropped_dim();
        let cpp = image.cpp() as usize;

        if size.x <= 0 || size.y <= 0 || offset.x < 0 || offset.y < 0 {
            bail!(DecodingError::InvalidDimensions {
                width: size.x.max(0) as u32,
                height: size.y.max(0) as u32,
            });
        }

        if offset.y > dim.y || offset.x as i64 + size.x as i64 > dim.x as i64 {
            bail!(DecodingError::Corrupt("uncompressed area is outside of the image"));
        }

        let x0 = offset.x as usize * cpp;
        let y0 = offset.y as usize;
        let width = size.x as usize * cpp;
        let wanted = (size.y as usize).min((dim.y - offset.y) as usize);

        let rows = if image.data_type() == RawImageType::F32 {
            if bits != 32 {
                bail!(UnsupportedError::BitsPerSample(bits));
            }

            let mut out = image.as_array2d_mut::<f32>()?.sub_view(x0, y0, width, wanted)?;
            self.read_float_rows(&mut out, input_pitch)?
        } else {
            let mut out = image.as_array2d_mut::<u16>()?.sub_view(x0, y0, width, wanted)?;
            self.read_rows(&mut out, input_pitch, bits, packing)?
        };

        if rows < wanted {
            image.set_error(TRUNCATED);
        }

        Ok(())
    }

    /// Read rows of `bits`-bit samples filling `out`, `input_pitch` bytes apart in the input.
    ///
    /// Returns the number of rows read. This is less than the height of `out` if the input is
    /// short, and an error if not a single row is present.
    pub fn read_rows(
        &mut self,
        out: &mut Array2dMut<'_, u16>,
        input_pitch: u32,
        bits: u32,
        packing: BitPacking,
    ) -> Result<usize> {
        if bits == 0 || bits > 16 {
            bail!(UnsupportedError::BitsPerSample(bits));
        }

        let width = out.width();

        if (width as u64 * bits as u64).div_ceil(8) > input_pitch as u64 {
            bail!(DecodingError::Corrupt("input pitch is smaller than a row"));
        }

        let rows = self.complete_rows(input_pitch as u64, out.height() as u64)?;
        let data = self.input.get_bytes(input_pitch * rows as u32)?;

        for (row, src) in data.chunks_exact(input_pitch as usize).enumerate() {
            let dest = out.row_mut(row);

            match packing {
                BitPacking::Msb => read_row::<Msb>(src, dest, bits)?,
                BitPacking::Msb16 => read_row::<Msb16>(src, dest, bits)?,
                BitPacking::Msb32 => read_row::<Msb32>(src, dest, bits)?,
                BitPacking::Lsb => read_row::<Lsb>(src, dest, bits)?,
            }
        }

        Ok(rows)
    }

    /// Read rows of 32-bit little-endian floats filling `out`.
    pub fn read_float_rows(&mut self, out: &mut Array2dMut<'_, f32>, input_pitch: u32) -> Result<usize> {
        if out.width() as u64 * 4 > input_pitch as u64 {
            bail!(DecodingError::Corrupt("input pitch is smaller than a row"));
        }

        let rows = self.complete_rows(input_pitch as u64, out.height() as u64)?;
        let data = self.input.get_bytes(input_pitch * rows as u32)?;

        for (row, src) in data.chunks_exact(input_pitch as usize).enumerate() {
            for (d, s) in out.row_mut(row).iter_mut().zip(src.chunks_exact(4)) {
                *d = f32::from_le_bytes([s[0], s[1], s[2], s[3]]);
            }
        }

        Ok(rows)
    }

    /// Decode 12-bit packed samples into the top-left `width` x `height` pixels.
    pub fn decode_12bit_raw(
        &mut self,
        image: &mut RawImage,
        width: u32,
        height: u32,
        layout: Packed12,
    ) -> Result<()> {
        if width < 2 || width % 2 != 0 {
            bail!(DecodingError::InvalidDimensions { width, height });
        }

        let control = matches!(layout, Packed12::LittleWithControl | Packed12::BigWithControl);
        let mut per_row = width as u64 * 12 / 8;

        if control {
            per_row += (width as u64 + 2) / 10;
        }

        let rows = self.available_rows(image, per_row, height as u64)?;
        let mut out = image.as_array2d_mut::<u16>()?;
        check_target(out.width(), out.height(), width, rows)?;

        let w = width as usize;
        let per_row = per_row as usize;
        let big_endian = matches!(
            layout,
            Packed12::Big | Packed12::BigWithControl | Packed12::BigInterlaced
        );

        let unpack = |src: &[u8], dest: &mut [u16]| {
            let mut pos = 0;

            for x in (0..w).step_by(2) {
                let (g1, g2, g3) = (src[pos] as u16, src[pos + 1] as u16, src[pos + 2] as u16);
                pos += 3;

                if big_endian {
                    dest[x] = (g1 << 4) | (g2 >> 4);
                    dest[x + 1] = ((g2 & 0x0f) << 8) | g3;
                } else {
                    dest[x] = g1 | ((g2 & 0x0f) << 8);
                    dest[x + 1] = (g2 >> 4) | (g3 << 4);
                }

                if control && x % 10 == 8 {
                    pos += 1;
                }
            }
        };

        if layout == Packed12::BigInterlaced {
            let data = self.input.peek_remaining();
            let half = rows.div_ceil(2);
            // The second field starts at the next 2048-byte boundary.
            let field2 = (((half * w * 3 / 2) >> 11) + 1) << 11;

            for row in 0..rows {
                let (y, start) = if row < half {
                    (row * 2, row * per_row)
                } else {
                    ((row - half) * 2 + 1, field2 + (row - half) * per_row)
                };

                let Some(src) = data.get(start..start + per_row) else {
                    bail!(IoError::BufferOverflow {
                        offset: start as u64,
                        count: per_row as u64,
                        size: data.len() as u64,
                    });
                };

                unpack(src, &mut out.row_mut(y)[..w]);
            }

            self.input.skip_bytes(self.input.remain_size())?;

            return Ok(());
        }

        let data = self.input.get_bytes((per_row * rows) as u32)?;

        for (row, src) in data.chunks_exact(per_row).enumerate() {
            unpack(src, &mut out.row_mut(row)[..w]);
        }

        Ok(())
    }

    /// Decode 16-bit containers holding `BITS`-bit samples in their low bits.
    pub fn decode_raw_unpacked<const BITS: u32, const BIG_ENDIAN: bool>(
        &mut self,
        image: &mut RawImage,
        width: u32,
        height: u32,
    ) -> Result<()> {
        self.decode_16bit_containers(image, width, height, BIG_ENDIAN, |v| {
            v & ((1_u32 << BITS) - 1) as u16
        })
    }

    /// Decode 16-bit containers holding `BITS`-bit samples in their high bits.
    pub fn decode_raw_unpacked_left_aligned<const BITS: u32, const BIG_ENDIAN: bool>(
        &mut self,
        image: &mut RawImage,
        width: u32,
        height: u32,
    ) -> Result<()> {
        self.decode_16bit_containers(image, width, height, BIG_ENDIAN, |v| v >> (16 - BITS))
    }

    fn decode_16bit_containers(
        &mut self,
        image: &mut RawImage,
        width: u32,
        height: u32,
        big_endian: bool,
        convert: impl Fn(u16) -> u16,
    ) -> Result<()> {
        let per_row = width as u64 * 2;
        let rows = self.available_rows(image, per_row, height as u64)?;
        let mut out = image.as_array2d_mut::<u16>()?;
        check_target(out.width(), out.height(), width, rows)?;

        let data = self.input.get_bytes(per_row as u32 * rows as u32)?;

        for (row, src) in data.chunks_exact(per_row as usize).enumerate() {
            let dest = out.row_mut(row);

            for (d, s) in dest.iter_mut().zip(src.chunks_exact(2)) {
                let v = if big_endian {
                    u16::from_be_bytes([s[0], s[1]])
                } else {
                    u16::from_le_bytes([s[0], s[1]])
                };
                *d = convert(v);
            }
        }

        Ok(())
    }

    /// Decode 8-bit samples, optionally mapped through a lookup table.
    pub fn decode_8bit_raw(
        &mut self,
        image: &mut RawImage,
        width: u32,
        height: u32,
        table: Option<&[u16; 256]>,
    ) -> Result<()> {
        let rows = self.available_rows(image, width as u64, height as u64)?;
        let mut out = image.as_array2d_mut::<u16>()?;
        check_target(out.width(), out.height(), width, rows)?;

        let data = self.input.get_bytes(width * rows as u32)?;

        for (row, src) in data.chunks_exact(width as usize).enumerate() {
            for (d, s) in out.row_mut(row).iter_mut().zip(src) {
                *d = table.map_or(*s as u16, |t| t[*s as usize]);
            }
        }

        Ok(())
    }
}

fn check_target(out_width: usize, out_height: usize, width: u32, rows: usize) -> Result<()> {
    if width as usize > out_width || rows > out_height {
        bail!(DecodingError::InvalidDimensions {
            width,
            height: rows as u32,
        });
    }

    Ok(())
}

fn read_row<O: BitOrder>(src: &[u8], dest: &mut [u16], bits: u32) -> Result<()> {
    let mut bs = BitStream::<O>::new(src);

    for d in dest {
        *d = bs.get_bits(bits)? as u16;
    }

    Ok(())
}
