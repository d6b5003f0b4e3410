//! The CRX codec of Canon CR3 files, lossless mode only.
//!
//! The image is split into tiles, and each tile into one plane per CFA position (or a single
//! plane). Every plane is coded line by line with an adaptive Golomb-Rice code. A line is
//! predicted from the line above, and runs of equal samples are coded by their length.
//!
//! The mdat chunk starts with a header that lists the tiles in row-major order. Each tile
//! header (`0xFF01`) is followed by one plane header (`0xFF02`) per plane, each followed by a
//! subband header (`0xFF03`). The coded data of all tiles follows the header.

use core::ops::Range;

use crate::bits::{BitPumpMsb, BitSource};
use crate::bmff::Cmp1Box;
use crate::buffer::Endianness;
use crate::cursor::ByteStream;
use crate::error::{DecodingError, FormatError, Result, UnsupportedError, bail};
use crate::image::RawImage;
use crate::log::{ldebug, ltrace};
use crate::scheduler::{DecodedTile, collect_errors, decode_tiles};

const TILE_HEADER: u16 = 0xff01;
const PLANE_HEADER: u16 = 0xff02;
const SUBBAND_HEADER: u16 = 0xff03;
const HEADER_PAYLOAD: u16 = 8;

const MAX_K: u32 = 15;
const ESCAPE_ZEROS: u32 = 41;
const ESCAPE_BITS: u32 = 21;

// Run length steps and the number of extra bits, indexed by the run state.
const RUN_STEPS: [usize; 32] = [
    1, 1, 1, 1, 2, 2, 2, 2, 4, 4, 4, 4, 8, 8, 8, 8, 16, 16, 32, 32, 64, 64, 128, 128, 256, 512,
    1024, 2048, 4096, 8192, 16384, 32768,
];
const RUN_BITS: [u32; 32] = [
    0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 9, 10, 11, 12,
    13, 14, 15,
];

#[derive(Debug, Clone)]
struct TileInfo {
    index: usize,
    // In plane samples.
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    // Absolute ranges of the coded lines of each plane in the chunk.
    planes: Vec<Range<usize>>,
}

/// A decompressor for the CRX data of one CR3 track.
#[derive(Debug, Clone)]
pub struct CrxDecompressor<'a> {
    params: Cmp1Box,
    data: &'a [u8],
}

impl<'a> CrxDecompressor<'a> {
    /// Create a decompressor for the chunk `data`, described by `params`.
    pub fn new(params: &Cmp1Box, data: ByteStream<'a>) -> Result<Self> {
        if params.image_levels != 0 {
            bail!(UnsupportedError::Feature("CRX wavelet levels"));
        }

        if params.enc_type == 3 {
            bail!(UnsupportedError::Feature("CRX encoding type 3"));
        }

        if !(1..=16).contains(&params.n_bits) {
            bail!(UnsupportedError::BitsPerSample(params.n_bits as u32));
        }

        if params.tile_width == 0 || params.tile_height == 0 {
            bail!(FormatError::Corrupt("CRX tile size is zero"));
        }

        Ok(Self {
            params: params.clone(),
            data: data.peek_remaining(),
        })
    }

    fn planes(&self) -> usize {
        self.params.n_planes as usize
    }

    /// The factor between plane samples and image pixels.
    fn plane_scale(&self) -> usize {
        if self.planes() == 4 { 2 } else { 1 }
    }

    /// Decode into `image`, which must be an allocated single-component image of the frame
    /// size.
    pub fn decode(&self, image: &mut RawImage, threads: usize) -> Result<()> {
        let dim = image.uncropped_dim();
        let (width, height) = (self.params.f_width, self.params.f_height);

        if image.cpp() != 1 || dim.x as u32 != width || dim.y as u32 != height {
            bail!(DecodingError::InvalidDimensions { width, height });
        }

        let tiles = self.parse_headers()?;
        ldebug!("decoding {} crx tiles with {} planes", tiles.len(), self.planes());

        collect_errors(image, |image, errors| {
            let mut view = image.as_array2d_mut::<u16>()?;

            decode_tiles(&mut view, tiles, threads, errors, |_, tile| {
                self.decode_tile(&tile)
            })
        })
    }

    fn parse_headers(&self) -> Result<Vec<TileInfo>> {
        let scale = self.plane_scale();
        let plane_w = self.params.f_width as usize / scale;
        let plane_h = self.params.f_height as usize / scale;
        let tile_w = self.params.tile_width as usize / scale;
        let tile_h = self.params.tile_height as usize / scale;

        if plane_w == 0 || plane_h == 0 || tile_w == 0 || tile_h == 0 {
            bail!(FormatError::Corrupt("CRX plane is empty"));
        }

        let cols = plane_w.div_ceil(tile_w);
        let rows = plane_h.div_ceil(tile_h);

        let header_len = self.params.mdat_hdr_size;
        let header = self
            .data
            .get(..header_len as usize)
            .ok_or(FormatError::Corrupt("CRX header exceeds chunk"))?;
        let mut bs = ByteStream::from_slice(header, Endianness::Big)?;

        let mut tiles = Vec::with_capacity(cols * rows);
        let mut tile_offset = header_len as usize;

        for index in 0..cols * rows {
            let (col, row) = (index % cols, index / cols);

            let tile_size = read_header(&mut bs, TILE_HEADER)?;

            if bs.get_u16()? as usize != index {
                bail!(FormatError::Corrupt("CRX tile out of order"));
            }

            // Unused trailing flags.
            bs.skip_bytes(2)?;

            let mut planes = Vec::with_capacity(self.planes());
            let mut plane_offset = tile_offset;

            for plane in 0..self.planes() {
                let plane_size = read_header(&mut bs, PLANE_HEADER)?;
                let flags = bs.get_u8()?;
                bs.skip_bytes(3)?;

                if (flags >> 4) as usize != plane {
                    bail!(FormatError::Corrupt("CRX plane out of order"));
                }

                if flags & 8 == 0 || (flags >> 1) & 3 != 0 {
                    bail!(UnsupportedError::Feature("CRX plane without lossless lines"));
                }

                let band_size = read_header(&mut bs, SUBBAND_HEADER)?;
                let band_info = bs.get_u32()?;

                if band_info >> 28 != 0 {
                    bail!(FormatError::Corrupt("CRX subband out of order"));
                }

                let data_size = band_size
                    .checked_sub(band_info & 0x7ffff)
                    .ok_or(FormatError::Corrupt("CRX subband size"))?;

                planes.push(plane_offset..plane_offset + data_size as usize);
                plane_offset += plane_size as usize;
            }

            tiles.push(TileInfo {
                index,
                x: col * tile_w,
                y: row * tile_h,
                width: if col == cols - 1 {
                    plane_w - tile_w * (cols - 1)
                } else {
                    tile_w
                },
                height: if row == rows - 1 {
                    plane_h - tile_h * (rows - 1)
                } else {
                    tile_h
                },
                planes,
            });

            tile_offset += tile_size as usize;
        }

        Ok(tiles)
    }

    fn decode_tile(&self, tile: &TileInfo) -> Result<DecodedTile<u16>> {
        ltrace!("crx tile {}: {}x{}", tile.index, tile.width, tile.height);

        let scale = self.plane_scale();
        let out_w = tile.width * scale;
        let mut data = vec![0_u16; out_w * tile.height * scale];

        let bits = self.params.n_bits as u32;
        let median = 1_i32 << (bits - 1);
        let max = (1_i32 << bits) - 1;

        for (plane, range) in tile.planes.iter().enumerate() {
            let coded = self
                .data
                .get(range.clone())
                .ok_or(DecodingError::Corrupt("CRX plane exceeds chunk"))?;

            let pos = if scale == 2 {
                plane ^ self.params.cfa_layout as usize
            } else {
                0
            };
            let (dx, dy) = (pos & 1, pos >> 1);
            let mut lines = LineDecoder::new(coded, tile.width);

            for y in 0..tile.height {
                let line = lines.next_line()?;
                let row = &mut data[(y * scale + dy) * out_w..][..out_w];

                for (x, v) in line.iter().enumerate() {
                    row[x * scale + dx] = median.wrapping_add(*v).clamp(0, max) as u16;
                }
            }
        }

        Ok(DecodedTile {
            x: tile.x * scale,
            y: tile.y * scale,
            width: out_w,
            data,
        })
    }
}

/// Read a `(signature, 8, size)` header and return the size.
fn read_header(bs: &mut ByteStream<'_>, signature: u16) -> Result<u32> {
    let found = bs.get_u16()?;

    if found != signature {
        if found & 0xfff0 == 0xff10 {
            bail!(UnsupportedError::Feature("CRX extended headers"));
        }

        bail!(FormatError::Corrupt("unexpected CRX header"));
    }

    if bs.get_u16()? != HEADER_PAYLOAD {
        bail!(FormatError::Corrupt("unexpected CRX header size"));
    }

    bs.get_u32()
}

#[inline]
fn decode_residual(code: u32) -> i32 {
    -((code & 1) as i32) ^ (code >> 1) as i32
}

#[inline]
fn predict_k(k: u32, code: u32, max: u32) -> u32 {
    let shifted = code >> k;
    let lower = u32::from(code < ((1 << k) >> 1));
    let raise = u32::from(shifted > 2) + u32::from(shifted > 5);

    (k + raise - lower).min(max)
}

#[inline]
fn predict(left: i32, top: i32, delta_h: i32, delta_v: i32) -> i32 {
    let candidates = [
        left.wrapping_add(delta_h),
        left.wrapping_add(delta_h),
        left,
        top,
    ];
    let index = (usize::from((delta_v < 0) ^ (delta_h < 0)) << 1)
        | usize::from((left < top) ^ (delta_h < 0));

    candidates[index]
}

/// Decodes the lines of one plane of a tile.
struct LineDecoder<'a> {
    bits: BitPumpMsb<'a>,
    width: usize,
    k: u32,
    run_state: usize,
    // Both lines have a border sample on each side.
    prev: Vec<i32>,
    cur: Vec<i32>,
    first: bool,
}

impl<'a> LineDecoder<'a> {
    fn new(data: &'a [u8], width: usize) -> Self {
        Self {
            bits: BitPumpMsb::new(data),
            width,
            k: 0,
            run_state: 0,
            prev: vec![0; width + 2],
            cur: vec![0; width + 2],
            first: true,
        }
    }

    fn next_line(&mut self) -> Result<&[i32]> {
        if self.first {
            self.first = false;
            self.top_line()?;
        } else {
            core::mem::swap(&mut self.prev, &mut self.cur);
            self.line()?;
        }

        Ok(&self.cur[1..=self.width])
    }

    fn count_zeros(&mut self) -> Result<u32> {
        let mut zeros = 0;

        loop {
            self.bits.fill(32)?;
            let word = self.bits.peek_bits_no_fill(32);

            if word != 0 {
                let lz = word.leading_zeros();
                self.bits.skip_bits_no_fill(lz + 1);

                return Ok(zeros + lz);
            }

            self.bits.skip_bits_no_fill(32);
            zeros += 32;
        }
    }

    fn read_code(&mut self) -> Result<u32> {
        let zeros = self.count_zeros()?;

        if zeros >= ESCAPE_ZEROS {
            return self.bits.get_bits(ESCAPE_BITS);
        }

        if self.k == 0 {
            return Ok(zeros);
        }

        Ok((zeros << self.k) | self.bits.get_bits(self.k)?)
    }

    /// Read the length of a run, at most `length`.
    fn read_run(&mut self, length: usize) -> Result<usize> {
        if self.bits.get_bits(1)? == 0 {
            return Ok(0);
        }

        let mut n = 1;

        while self.bits.get_bits(1)? == 1 {
            n += RUN_STEPS[self.run_state];

            if n > length {
                return Ok(length);
            }

            if self.run_state < 31 {
                self.run_state += 1;
            }

            if n == length {
                return Ok(n);
            }
        }

        if n < length {
            let extra = RUN_BITS[self.run_state];

            if extra > 0 {
                n += self.bits.get_bits(extra)? as usize;
            }

            self.run_state = self.run_state.saturating_sub(1);

            if n > length {
                bail!(DecodingError::Corrupt("CRX run exceeds line"));
            }
        }

        Ok(n)
    }

    /// Copy the sample left of `cur[i + 1]` `n` times.
    fn copy_run(&mut self, i: &mut usize, n: usize) {
        for _ in 0..n {
            self.cur[*i + 1] = self.cur[*i];
            *i += 1;
        }
    }

    fn top_line(&mut self) -> Result<()> {
        let mut i = 0;
        let mut length = self.width;
        self.cur[0] = 0;

        while length > 1 {
            if self.cur[i] != 0 {
                self.cur[i + 1] = self.cur[i];
            } else {
                let n = self.read_run(length)?;
                self.copy_run(&mut i, n);
                length -= n;

                if length == 0 {
                    break;
                }

                self.cur[i + 1] = 0;
            }

            let code = self.read_code()?;
            self.cur[i + 1] = self.cur[i + 1].wrapping_add(decode_residual(code));
            self.k = predict_k(self.k, code, MAX_K);

            i += 1;
            length -= 1;
        }

        if length == 1 {
            let code = self.read_code()?;
            self.cur[i + 1] = self.cur[i].wrapping_add(decode_residual(code));
            self.k = predict_k(self.k, code, MAX_K);
            i += 1;
        }

        self.cur[i + 1] = self.cur[i].wrapping_add(1);

        Ok(())
    }

    /// Predict `cur[i + 1]` and add the next residual.
    fn predicted_sample(&mut self, i: usize, delta_h: i32) -> Result<u32> {
        let (left, top, top_left) = (self.cur[i], self.prev[i + 1], self.prev[i]);
        let predicted = predict(left, top, delta_h, top_left.wrapping_sub(left));

        let code = self.read_code()?;
        self.cur[i + 1] = predicted.wrapping_add(decode_residual(code));

        Ok(code)
    }

    fn line(&mut self) -> Result<()> {
        let mut i = 0;
        let mut length = self.width;
        self.cur[0] = self.prev[1];
        let mut delta_h = self.prev[1].wrapping_sub(self.prev[0]);

        while length > 1 {
            let left = self.cur[i];

            if left == self.prev[i + 1] && left == self.prev[i + 2] {
                let n = self.read_run(length)?;
                self.copy_run(&mut i, n);
                length -= n;

                if length == 0 {
                    break;
                }

                delta_h = self.prev[i + 1].wrapping_sub(self.prev[i]);
            }

            let code = self.predicted_sample(i, delta_h)?;
            delta_h = self.prev[i + 2].wrapping_sub(self.prev[i + 1]);
            let weighted = code.saturating_add(2 * delta_h.unsigned_abs()) >> 1;
            self.k = predict_k(self.k, weighted, MAX_K);

            i += 1;
            length -= 1;
        }

        if length == 1 {
            let code = self.predicted_sample(i, delta_h)?;
            self.k = predict_k(self.k, code, MAX_K);
            i += 1;
        }

        self.cur[i + 1] = self.cur[i].wrapping_add(1);

        Ok(())
    }
}
